//! Project lock manager.
//!
//! One advisory exclusive lock per `(workspace_id, project_id)`, bounded by
//! a TTL. Lock identity is the `(owner_agent_id, owner_session_id)` pair;
//! the token is a capability echoed back to the client, never the key the
//! dispatcher matches on. A holder re-acquiring renews the TTL and keeps
//! its token; anyone else waits for expiry.

use meshgate_protocol::defaults::clamp_lock_ttl_ms;
use meshgate_protocol::ProjectKey;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::clock::Clock;
use crate::events::{EventLog, LockView};

/// Lock mode recorded on MCP-held locks.
pub const LOCK_MODE_MCP: &str = "mcp";

/// An active project lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectLock {
    pub owner_agent_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_session_id: Option<String>,
    pub token: String,
    pub acquired_at: u64,
    pub heartbeat_at: u64,
    pub expires_at: u64,
    pub mode: String,
}

impl ProjectLock {
    fn view(&self) -> LockView {
        LockView {
            owner_agent_id: self.owner_agent_id.clone(),
            owner_session_id: self.owner_session_id.clone(),
            mode: self.mode.clone(),
            token: self.token.clone(),
        }
    }
}

/// Identity of a lock holder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockOwner {
    pub agent_id: String,
    pub session_id: Option<String>,
}

impl LockOwner {
    pub fn new(agent_id: impl Into<String>, session_id: Option<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            session_id,
        }
    }

    fn matches(&self, lock: &ProjectLock) -> bool {
        lock.owner_agent_id == self.agent_id && lock.owner_session_id == self.session_id
    }
}

/// Lock acquisition failure.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("project {key} is locked by {owner_agent_id} until {expires_at}")]
    Conflict {
        key: ProjectKey,
        owner_agent_id: String,
        owner_session_id: Option<String>,
        expires_at: u64,
    },
}

/// TTL-bounded per-project exclusive lock table.
pub struct LockManager {
    clock: Arc<dyn Clock>,
    events: Arc<EventLog>,
    locks: Mutex<HashMap<ProjectKey, ProjectLock>>,
}

impl LockManager {
    pub fn new(clock: Arc<dyn Clock>, events: Arc<EventLog>) -> Self {
        Self {
            clock,
            events,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Acquire or renew the lock for `key`.
    ///
    /// Expired locks anywhere in the table are swept first. An active lock
    /// held by a different owner is a conflict carrying the holder identity
    /// and expiry; the same owner renews in place, preserving `acquired_at`
    /// and `token`.
    pub fn acquire(
        &self,
        key: &ProjectKey,
        owner: &LockOwner,
        ttl_ms: Option<u64>,
    ) -> Result<ProjectLock, LockError> {
        let ttl = clamp_lock_ttl_ms(ttl_ms);
        let now = self.clock.now_ms();
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        self.sweep_expired_locked(&mut locks, now);

        if let Some(existing) = locks.get_mut(key) {
            if !owner.matches(existing) {
                return Err(LockError::Conflict {
                    key: key.clone(),
                    owner_agent_id: existing.owner_agent_id.clone(),
                    owner_session_id: existing.owner_session_id.clone(),
                    expires_at: existing.expires_at,
                });
            }
            existing.heartbeat_at = now;
            existing.expires_at = now + ttl;
            let renewed = existing.clone();
            drop(locks);
            // Same visible tuple; the snapshot publish is a no-op.
            self.events.snapshot_lock(key, Some(renewed.view()));
            debug!("Renewed lock on {} for {}", key, owner.agent_id);
            return Ok(renewed);
        }

        let lock = ProjectLock {
            owner_agent_id: owner.agent_id.clone(),
            owner_session_id: owner.session_id.clone(),
            token: Uuid::new_v4().to_string(),
            acquired_at: now,
            heartbeat_at: now,
            expires_at: now + ttl,
            mode: LOCK_MODE_MCP.to_string(),
        };
        locks.insert(key.clone(), lock.clone());
        drop(locks);

        self.events.snapshot_lock(key, Some(lock.view()));
        info!("Acquired lock on {} for {}", key, owner.agent_id);
        Ok(lock)
    }

    /// Renew without acquiring: `None` when the lock is absent or held by
    /// someone else.
    pub fn renew(
        &self,
        key: &ProjectKey,
        owner: &LockOwner,
        ttl_ms: Option<u64>,
    ) -> Option<ProjectLock> {
        let ttl = clamp_lock_ttl_ms(ttl_ms);
        let now = self.clock.now_ms();
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        self.sweep_expired_locked(&mut locks, now);

        let existing = locks.get_mut(key)?;
        if !owner.matches(existing) {
            return None;
        }
        existing.heartbeat_at = now;
        existing.expires_at = now + ttl;
        Some(existing.clone())
    }

    /// Release the lock if `owner` holds it.
    pub fn release(&self, key: &ProjectKey, owner: &LockOwner) -> bool {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        let held = locks
            .get(key)
            .map(|lock| owner.matches(lock))
            .unwrap_or(false);
        if !held {
            return false;
        }
        locks.remove(key);
        drop(locks);

        self.events.snapshot_lock(key, None);
        debug!("Released lock on {} for {}", key, owner.agent_id);
        true
    }

    /// Release every lock held by an agent (optionally narrowed to one
    /// session). Used when a session terminates.
    pub fn release_by_owner(&self, agent_id: &str, session_id: Option<&str>) -> usize {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        let keys: Vec<ProjectKey> = locks
            .iter()
            .filter(|(_, lock)| {
                lock.owner_agent_id == agent_id
                    && session_id
                        .map(|s| lock.owner_session_id.as_deref() == Some(s))
                        .unwrap_or(true)
            })
            .map(|(key, _)| key.clone())
            .collect();
        for key in &keys {
            locks.remove(key);
        }
        drop(locks);

        for key in &keys {
            self.events.snapshot_lock(key, None);
        }
        if !keys.is_empty() {
            info!("Released {} lock(s) held by {}", keys.len(), agent_id);
        }
        keys.len()
    }

    /// Current active lock for `key`, if any.
    pub fn current(&self, key: &ProjectKey) -> Option<ProjectLock> {
        let now = self.clock.now_ms();
        let locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .get(key)
            .filter(|lock| lock.expires_at > now)
            .cloned()
    }

    /// Linear sweep releasing every expired lock, with snapshots.
    fn sweep_expired_locked(&self, locks: &mut HashMap<ProjectKey, ProjectLock>, now: u64) {
        let expired: Vec<ProjectKey> = locks
            .iter()
            .filter(|(_, lock)| lock.expires_at <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            locks.remove(&key);
            self.events.snapshot_lock(&key, None);
            debug!("Swept expired lock on {}", key);
        }
    }
}
