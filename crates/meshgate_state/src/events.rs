//! Per-project event streams.
//!
//! Each project carries an append-only list of events with a dense,
//! strictly increasing `seq` starting at 1. Subscribers replay from a
//! cursor with [`EventLog::since`] and follow live appends through a
//! broadcast hook.
//!
//! Snapshot events are idempotent against no-op changes: the log keeps the
//! last visible projection (revision + lock tuple) per project and skips an
//! append when the projection is unchanged.

use meshgate_protocol::ProjectKey;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use crate::clock::Clock;

/// Replay window per project. A cursor older than the window replays only
/// the retained suffix.
const EVENT_WINDOW: usize = 1024;

/// Event discriminators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ProjectSnapshot,
    JobSubmitted,
    JobClaimed,
    JobCompleted,
    JobFailed,
    JobDeadLetter,
}

/// One event in a project stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectEvent {
    /// Dense per-project sequence, starting at 1
    pub seq: u64,

    pub event: EventKind,

    pub payload: Value,

    /// Append time (epoch ms)
    pub at: u64,
}

/// The lock fields visible to subscribers. Renewal preserves this tuple, so
/// a renew alone never produces a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockView {
    pub owner_agent_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_session_id: Option<String>,
    pub mode: String,
    pub token: String,
}

/// Last-published visible projection of a project.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotView {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock: Option<LockView>,
}

struct ProjectStream {
    last_seq: u64,
    events: VecDeque<ProjectEvent>,
    last_view: Option<SnapshotView>,
}

impl ProjectStream {
    fn new() -> Self {
        Self {
            last_seq: 0,
            events: VecDeque::new(),
            last_view: None,
        }
    }
}

/// Append-only per-project event log with cursor replay and live fan-out.
pub struct EventLog {
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
}

struct Inner {
    streams: HashMap<ProjectKey, ProjectStream>,
    subscribers: Vec<mpsc::UnboundedSender<(ProjectKey, ProjectEvent)>>,
}

impl EventLog {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            inner: Mutex::new(Inner {
                streams: HashMap::new(),
                subscribers: Vec::new(),
            }),
        }
    }

    /// Append an event, bumping the project sequence.
    pub fn append(&self, key: &ProjectKey, kind: EventKind, payload: Value) -> ProjectEvent {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        self.append_locked(&mut inner, key, kind, payload)
    }

    /// Publish a snapshot reflecting a lock transition. The revision part of
    /// the projection is carried over from the last snapshot. Returns `None`
    /// when the visible projection is unchanged.
    pub fn snapshot_lock(&self, key: &ProjectKey, lock: Option<LockView>) -> Option<ProjectEvent> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let revision = inner
            .streams
            .get(key)
            .and_then(|s| s.last_view.as_ref())
            .and_then(|v| v.revision.clone());
        self.snapshot_locked(&mut inner, key, SnapshotView { revision, lock })
    }

    /// Publish a snapshot reflecting a revision change. The lock part of the
    /// projection is carried over. Returns `None` when unchanged.
    pub fn snapshot_revision(
        &self,
        key: &ProjectKey,
        revision: Option<String>,
    ) -> Option<ProjectEvent> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let lock = inner
            .streams
            .get(key)
            .and_then(|s| s.last_view.as_ref())
            .and_then(|v| v.lock.clone());
        self.snapshot_locked(&mut inner, key, SnapshotView { revision, lock })
    }

    /// Publish the initial (empty) snapshot if the project has none yet.
    pub fn ensure_snapshot(&self, key: &ProjectKey) -> Option<ProjectEvent> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let has_view = inner
            .streams
            .get(key)
            .map(|s| s.last_view.is_some())
            .unwrap_or(false);
        if has_view {
            return None;
        }
        self.snapshot_locked(&mut inner, key, SnapshotView::default())
    }

    /// All events with `seq > cursor`, ascending.
    pub fn since(&self, key: &ProjectKey, cursor: u64) -> Vec<ProjectEvent> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.streams.get(key) {
            Some(stream) => stream
                .events
                .iter()
                .filter(|e| e.seq > cursor)
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }

    /// Highest sequence assigned for a project (0 when none).
    pub fn last_seq(&self, key: &ProjectKey) -> u64 {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.streams.get(key).map(|s| s.last_seq).unwrap_or(0)
    }

    /// Follow live appends across all projects. Dropped receivers are pruned
    /// on the next append.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<(ProjectKey, ProjectEvent)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.subscribers.push(tx);
        rx
    }

    fn append_locked(
        &self,
        inner: &mut Inner,
        key: &ProjectKey,
        kind: EventKind,
        payload: Value,
    ) -> ProjectEvent {
        let stream = inner
            .streams
            .entry(key.clone())
            .or_insert_with(ProjectStream::new);
        stream.last_seq += 1;
        let event = ProjectEvent {
            seq: stream.last_seq,
            event: kind,
            payload,
            at: self.clock.now_ms(),
        };
        stream.events.push_back(event.clone());
        while stream.events.len() > EVENT_WINDOW {
            stream.events.pop_front();
        }

        inner
            .subscribers
            .retain(|tx| tx.send((key.clone(), event.clone())).is_ok());

        event
    }

    fn snapshot_locked(
        &self,
        inner: &mut Inner,
        key: &ProjectKey,
        view: SnapshotView,
    ) -> Option<ProjectEvent> {
        let unchanged = inner
            .streams
            .get(key)
            .and_then(|s| s.last_view.as_ref())
            .map(|last| *last == view)
            .unwrap_or(false);
        if unchanged {
            return None;
        }

        let payload = json!({
            "project": {
                "workspaceId": key.workspace_id,
                "projectId": key.project_id,
                "revision": view.revision,
            },
            "lock": view.lock,
        });
        let event = self.append_locked(inner, key, EventKind::ProjectSnapshot, payload);
        if let Some(stream) = inner.streams.get_mut(key) {
            stream.last_view = Some(view);
        }
        Some(event)
    }
}
