//! MCP session store.
//!
//! Sessions are soft state: created on `initialize`, extended by every
//! request that names them, and swept once stale with no live SSE
//! connection. Ids must be unguessable; they come from the OS RNG.

use meshgate_protocol::Principal;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use crate::clock::Clock;

/// Opaque session identifier returned in the `Mcp-Session-Id` header.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    fn generate() -> Self {
        let mut bytes = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Liveness handle for one attached SSE connection. The writer task flips
/// `closed` when the socket goes away; the store treats closed handles as
/// detached for staleness purposes.
#[derive(Debug, Clone)]
pub struct SseHandle {
    pub id: u64,
    closed: Arc<AtomicBool>,
}

impl SseHandle {
    pub fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// An active MCP session.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub protocol_version: String,
    pub principal: Principal,
    pub sse_connections: Vec<SseHandle>,
    pub last_seen_at: u64,
}

impl Session {
    /// Count of attached connections whose socket is still open.
    pub fn live_sse_count(&self) -> usize {
        self.sse_connections
            .iter()
            .filter(|h| !h.is_closed())
            .count()
    }
}

/// Single-process session table.
pub struct SessionStore {
    clock: Arc<dyn Clock>,
    ttl_ms: u64,
    max_sse_per_session: usize,
    next_conn_id: AtomicU64,
    sessions: Mutex<HashMap<SessionId, Session>>,
}

impl SessionStore {
    pub fn new(clock: Arc<dyn Clock>, ttl_ms: u64, max_sse_per_session: usize) -> Self {
        Self {
            clock,
            ttl_ms,
            max_sse_per_session,
            next_conn_id: AtomicU64::new(1),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Create a session for a negotiated protocol version.
    pub fn create(&self, protocol_version: impl Into<String>, principal: Principal) -> Session {
        let session = Session {
            id: SessionId::generate(),
            protocol_version: protocol_version.into(),
            principal,
            sse_connections: Vec::new(),
            last_seen_at: self.clock.now_ms(),
        };
        info!("Created session {}", session.id);
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(session.id.clone(), session.clone());
        session
    }

    pub fn get(&self, id: &SessionId) -> Option<Session> {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    /// Extend the session lifetime to now.
    pub fn touch(&self, id: &SessionId) {
        let now = self.clock.now_ms();
        if let Some(session) = self
            .sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(id)
        {
            session.last_seen_at = now;
        }
    }

    /// Attach an SSE connection; `None` when the session is unknown or the
    /// per-session cap is reached (counting only live connections).
    pub fn attach_sse(&self, id: &SessionId) -> Option<SseHandle> {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let session = sessions.get_mut(id)?;

        session.sse_connections.retain(|h| !h.is_closed());
        if session.sse_connections.len() >= self.max_sse_per_session {
            return None;
        }

        let handle = SseHandle {
            id: self.next_conn_id.fetch_add(1, Ordering::SeqCst),
            closed: Arc::new(AtomicBool::new(false)),
        };
        session.sse_connections.push(handle.clone());
        debug!("Attached SSE conn {} to session {}", handle.id, id);
        Some(handle)
    }

    /// Detach an SSE connection by handle id.
    pub fn detach_sse(&self, id: &SessionId, conn_id: u64) {
        if let Some(session) = self
            .sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(id)
        {
            session.sse_connections.retain(|h| h.id != conn_id);
        }
    }

    /// Remove the session outright (explicit DELETE).
    pub fn remove(&self, id: &SessionId) -> Option<Session> {
        let removed = self
            .sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
        if removed.is_some() {
            info!("Removed session {}", id);
        }
        removed
    }

    /// Sweep sessions that are both stale and without live SSE connections.
    pub fn prune_stale(&self) -> usize {
        let now = self.clock.now_ms();
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let before = sessions.len();
        sessions.retain(|_, session| {
            let fresh = session.last_seen_at + self.ttl_ms >= now;
            fresh || session.live_sse_count() > 0
        });
        let removed = before - sessions.len();
        if removed > 0 {
            info!("Pruned {} stale session(s)", removed);
        }
        removed
    }

    pub fn count(&self) -> usize {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}
