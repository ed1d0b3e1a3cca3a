//! SSE fan-out.
//!
//! Each attached stream gets its own channel of pre-framed SSE chunks; the
//! broker pumps project events from the event log into matching
//! connections and pings everyone on an interval. A send failure means the
//! socket went away: the connection is marked closed, dropped from the
//! broker, and detached from its session.

use meshgate_protocol::{methods, JsonRpcRequest, ProjectKey};
use meshgate_state::{EventLog, ProjectEvent, SessionId, SessionStore, SseHandle};
use serde_json::json;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::dispatch::ViewportNotifier;

/// One attached SSE stream.
pub struct SseConnection {
    pub session_id: SessionId,
    pub handle: SseHandle,
    pub tx: mpsc::UnboundedSender<String>,
    /// Only events for this workspace are delivered; `None` receives all
    /// (admin/service streams).
    pub workspace_filter: Option<String>,
}

/// Frame one SSE event.
pub fn sse_frame(id: Option<&str>, data: &str) -> String {
    match id {
        Some(id) => format!("id: {id}\ndata: {data}\n\n"),
        None => format!("data: {data}\n\n"),
    }
}

/// Keep-alive comment frame.
pub fn sse_ping() -> String {
    ": ping\n\n".to_string()
}

/// Session-aware SSE fan-out hub.
pub struct SseBroker {
    sessions: Arc<SessionStore>,
    connections: Mutex<Vec<SseConnection>>,
}

impl SseBroker {
    pub fn new(sessions: Arc<SessionStore>) -> Self {
        Self {
            sessions,
            connections: Mutex::new(Vec::new()),
        }
    }

    /// Register an attached stream.
    pub fn register(&self, connection: SseConnection) {
        debug!(
            "SSE conn {} registered for session {}",
            connection.handle.id, connection.session_id
        );
        self.connections
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(connection);
    }

    /// Number of currently registered streams.
    pub fn connection_count(&self) -> usize {
        self.connections
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Deliver a project event as a JSON-RPC notification to every stream
    /// whose workspace filter matches.
    pub fn broadcast_event(&self, key: &ProjectKey, event: &ProjectEvent) {
        let notification = JsonRpcRequest::notification(
            methods::PROJECT_EVENT,
            json!({
                "workspaceId": key.workspace_id,
                "projectId": key.project_id,
                "seq": event.seq,
                "event": event.event,
                "payload": event.payload,
                "at": event.at,
            }),
        );
        let data = match serde_json::to_string(&notification) {
            Ok(data) => data,
            Err(_) => return,
        };
        let frame = sse_frame(Some(&format!("{}#{}", key, event.seq)), &data);

        self.send_matching(&frame, Some(&key.workspace_id));
    }

    /// Broadcast a raw notification to every stream (no workspace filter).
    pub fn broadcast_notification(&self, method: &str, params: serde_json::Value) {
        let notification = JsonRpcRequest::notification(method, params);
        let data = match serde_json::to_string(&notification) {
            Ok(data) => data,
            Err(_) => return,
        };
        self.send_matching(&sse_frame(None, &data), None);
    }

    /// Ping all streams, dropping the dead.
    pub fn ping_all(&self) {
        self.send_matching(&sse_ping(), None);
    }

    fn send_matching(&self, frame: &str, workspace: Option<&str>) {
        let mut connections = self.connections.lock().unwrap_or_else(|e| e.into_inner());
        connections.retain(|conn| {
            if conn.handle.is_closed() {
                self.sessions.detach_sse(&conn.session_id, conn.handle.id);
                return false;
            }
            let matches = match (workspace, &conn.workspace_filter) {
                (Some(ws), Some(filter)) => ws == filter,
                _ => true,
            };
            if !matches {
                return true;
            }
            if conn.tx.send(frame.to_string()).is_err() {
                conn.handle.mark_closed();
                self.sessions.detach_sse(&conn.session_id, conn.handle.id);
                return false;
            }
            true
        });
    }

    /// Pump events from the log into the fan-out until the gateway stops.
    pub fn spawn_event_pump(self: Arc<Self>, events: &EventLog) -> tokio::task::JoinHandle<()> {
        let mut rx = events.subscribe();
        tokio::spawn(async move {
            while let Some((key, event)) = rx.recv().await {
                self.broadcast_event(&key, &event);
            }
            info!("SSE event pump stopped");
        })
    }

    /// Ping on an interval until the gateway stops.
    pub fn spawn_ping(self: Arc<Self>, interval_ms: u64) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(std::time::Duration::from_millis(interval_ms.max(1_000)));
            loop {
                ticker.tick().await;
                self.ping_all();
            }
        })
    }
}

impl ViewportNotifier for SseBroker {
    fn viewport_refresh(&self, key: &ProjectKey) -> Result<(), String> {
        self.broadcast_notification(
            "notifications/meshgate/viewport_refresh",
            json!({
                "workspaceId": key.workspace_id,
                "projectId": key.project_id,
            }),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshgate_protocol::Principal;
    use meshgate_state::{Clock, EventKind, ManualClock};

    fn setup() -> (Arc<SessionStore>, Arc<SseBroker>) {
        let clock = Arc::new(ManualClock::new(1_000));
        let sessions = Arc::new(SessionStore::new(clock as Arc<dyn Clock>, 300_000, 4));
        let broker = Arc::new(SseBroker::new(sessions.clone()));
        (sessions, broker)
    }

    fn event(seq: u64) -> ProjectEvent {
        ProjectEvent {
            seq,
            event: EventKind::JobSubmitted,
            payload: json!({"jobId": "j1"}),
            at: 1_000,
        }
    }

    fn attach(
        sessions: &SessionStore,
        broker: &SseBroker,
        workspace: Option<&str>,
    ) -> (SessionId, mpsc::UnboundedReceiver<String>) {
        let session = sessions.create("2025-06-18", Principal::anonymous());
        let handle = sessions.attach_sse(&session.id).unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        broker.register(SseConnection {
            session_id: session.id.clone(),
            handle,
            tx,
            workspace_filter: workspace.map(String::from),
        });
        (session.id, rx)
    }

    #[test]
    fn test_frame_format() {
        assert_eq!(
            sse_frame(Some("ws/p#1"), "{}"),
            "id: ws/p#1\ndata: {}\n\n"
        );
        assert_eq!(sse_frame(None, "x"), "data: x\n\n");
        assert_eq!(sse_ping(), ": ping\n\n");
    }

    #[tokio::test]
    async fn test_workspace_filter() {
        let (sessions, broker) = setup();
        let (_, mut matching) = attach(&sessions, &broker, Some("ws_1"));
        let (_, mut other) = attach(&sessions, &broker, Some("ws_2"));
        let (_, mut unfiltered) = attach(&sessions, &broker, None);

        broker.broadcast_event(&ProjectKey::new("ws_1", "prj_1"), &event(1));

        let frame = matching.try_recv().unwrap();
        assert!(frame.contains("notifications/meshgate/project_event"));
        assert!(frame.contains("id: ws_1/prj_1#1"));
        assert!(other.try_recv().is_err());
        assert!(unfiltered.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_dead_connection_is_dropped_and_detached() {
        let (sessions, broker) = setup();
        let (session_id, rx) = attach(&sessions, &broker, None);
        drop(rx);

        broker.broadcast_event(&ProjectKey::new("ws_1", "prj_1"), &event(1));
        assert_eq!(broker.connection_count(), 0);
        assert_eq!(
            sessions.get(&session_id).unwrap().sse_connections.len(),
            0
        );
    }

    #[tokio::test]
    async fn test_ping_reaches_everyone() {
        let (sessions, broker) = setup();
        let (_, mut a) = attach(&sessions, &broker, Some("ws_1"));
        let (_, mut b) = attach(&sessions, &broker, Some("ws_2"));

        broker.ping_all();
        assert_eq!(a.try_recv().unwrap(), ": ping\n\n");
        assert_eq!(b.try_recv().unwrap(), ": ping\n\n");
    }
}
