//! JSON-RPC message routing.
//!
//! The router owns MCP semantics: initialize and version negotiation,
//! session continuity via `Mcp-Session-Id`, per-principal tool registry
//! resolution on every request, tool-call validation, resource delegation,
//! and SSE attachment. Transport concerns (parsing, limits, status
//! plumbing) live in [`crate::http`].

use meshgate_protocol::{
    headers as hdr, methods, CallToolResult, ErrorCode, InitializeParams, InitializeResult,
    JsonRpcError, JsonRpcRequest, JsonRpcResponse, Principal, ProjectKey, RequestId,
    ServerCapabilities, ServerInfo, ToolCallParams, ToolRegistryInfo, ToolsCapability,
    ToolsListResult, SUPPORTED_PROTOCOL_VERSIONS,
};
use meshgate_security::Authenticator;
use meshgate_state::{EventLog, LockManager, Session, SessionStore};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::dispatch::{DispatchContext, Dispatcher};
use crate::resources::ResourceStore;
use crate::sse::{sse_frame, SseBroker, SseConnection};
use crate::tools::RegistryResolver;

/// Router identity and policy knobs.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub server_name: String,
    pub server_version: String,
    pub instructions: Option<String>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            server_name: "meshgate".to_string(),
            server_version: env!("CARGO_PKG_VERSION").to_string(),
            instructions: Some(
                "Call tools/list to discover tools. Mutations are serialized per \
                 project; pass ifRevision on state-replacing updates."
                    .to_string(),
            ),
        }
    }
}

/// A routed JSON response plus transport metadata.
#[derive(Debug)]
pub struct JsonReply {
    pub status: u16,
    /// `Value::Null` means an empty body (notification acknowledgement)
    pub body: Value,
    /// Set on successful `initialize`
    pub session_header: Option<String>,
}

impl JsonReply {
    fn ok(body: Value) -> Self {
        Self {
            status: 200,
            body,
            session_header: None,
        }
    }

    fn status(status: u16, body: Value) -> Self {
        Self {
            status,
            body,
            session_header: None,
        }
    }
}

/// An accepted SSE attachment: the transport drains `rx` into the socket.
pub struct SseStream {
    pub rx: mpsc::UnboundedReceiver<String>,
}

enum EnvelopeOutcome {
    Reply(JsonRpcResponse),
    ReplyWithSession(JsonRpcResponse, String),
    /// HTTP-level failure (status, response body)
    Fail(u16, JsonRpcResponse),
    /// Notification: nothing to send
    None,
}

/// The MCP router.
pub struct Router {
    config: RouterConfig,
    sessions: Arc<SessionStore>,
    authenticator: Arc<dyn Authenticator>,
    resolver: Arc<dyn RegistryResolver>,
    dispatcher: Arc<Dispatcher>,
    resources: Arc<dyn ResourceStore>,
    events: Arc<EventLog>,
    locks: Arc<LockManager>,
    broker: Arc<SseBroker>,
    registry_info: ToolRegistryInfo,
}

#[allow(clippy::too_many_arguments)]
impl Router {
    pub fn new(
        config: RouterConfig,
        sessions: Arc<SessionStore>,
        authenticator: Arc<dyn Authenticator>,
        resolver: Arc<dyn RegistryResolver>,
        dispatcher: Arc<Dispatcher>,
        resources: Arc<dyn ResourceStore>,
        events: Arc<EventLog>,
        locks: Arc<LockManager>,
        broker: Arc<SseBroker>,
        registry_info: ToolRegistryInfo,
    ) -> Self {
        Self {
            config,
            sessions,
            authenticator,
            resolver,
            dispatcher,
            resources,
            events,
            locks,
            broker,
            registry_info,
        }
    }

    /// Handle a JSON-RPC POST body (single envelope or batch).
    pub async fn handle_post(&self, headers: &HashMap<String, String>, body: &[u8]) -> JsonReply {
        let principal = match self.authenticator.authenticate(headers).await {
            Ok(principal) => principal,
            Err(err) => {
                return JsonReply::status(
                    401,
                    serde_json::to_value(JsonRpcResponse::error(
                        None,
                        JsonRpcError::new(ErrorCode::ServerError(-32001), err.to_string()),
                    ))
                    .unwrap_or(Value::Null),
                );
            }
        };

        let parsed: Value = match serde_json::from_slice(body) {
            Ok(parsed) => parsed,
            Err(err) => {
                return JsonReply::status(
                    400,
                    serde_json::to_value(JsonRpcResponse::error(
                        None,
                        JsonRpcError::new(ErrorCode::ParseError, format!("Invalid JSON: {err}")),
                    ))
                    .unwrap_or(Value::Null),
                );
            }
        };

        match parsed {
            Value::Array(batch) => {
                // Batches always answer 200; per-item failures ride in the
                // response envelopes.
                let mut responses = Vec::new();
                for item in batch {
                    match self.process_value(item, headers, &principal).await {
                        EnvelopeOutcome::Reply(response)
                        | EnvelopeOutcome::Fail(_, response) => responses.push(response),
                        EnvelopeOutcome::ReplyWithSession(response, _) => responses.push(response),
                        EnvelopeOutcome::None => {}
                    }
                }
                if responses.is_empty() {
                    JsonReply::status(202, Value::Null)
                } else {
                    JsonReply::ok(serde_json::to_value(responses).unwrap_or(Value::Null))
                }
            }
            single => match self.process_value(single, headers, &principal).await {
                EnvelopeOutcome::Reply(response) => {
                    JsonReply::ok(serde_json::to_value(response).unwrap_or(Value::Null))
                }
                EnvelopeOutcome::ReplyWithSession(response, session_id) => JsonReply {
                    status: 200,
                    body: serde_json::to_value(response).unwrap_or(Value::Null),
                    session_header: Some(session_id),
                },
                EnvelopeOutcome::Fail(status, response) => JsonReply::status(
                    status,
                    serde_json::to_value(response).unwrap_or(Value::Null),
                ),
                EnvelopeOutcome::None => JsonReply::status(202, Value::Null),
            },
        }
    }

    /// Terminate a session: drop it and release every lock it holds.
    pub async fn handle_delete(&self, headers: &HashMap<String, String>) -> JsonReply {
        let Some(session_id) = session_header(headers) else {
            return JsonReply::status(
                400,
                error_body(None, ErrorCode::InvalidRequest, "Mcp-Session-Id required"),
            );
        };
        let Some(session) = self.sessions.remove(&session_id) else {
            return JsonReply::status(
                404,
                error_body(None, ErrorCode::InvalidRequest, "Session not found"),
            );
        };

        let agent_id = agent_id(&session.principal);
        let released = self
            .locks
            .release_by_owner(&agent_id, Some(session.id.as_str()));
        info!(
            "Session {} terminated, {} lock(s) released",
            session.id, released
        );
        JsonReply::ok(json!({ "ok": true }))
    }

    /// Attach an SSE stream to a session, with optional per-project replay
    /// via `projectId`/`workspaceId`/`cursor` query parameters.
    pub async fn handle_sse_attach(
        &self,
        headers: &HashMap<String, String>,
        query: &HashMap<String, String>,
    ) -> Result<SseStream, JsonReply> {
        let Some(session_id) = session_header(headers) else {
            return Err(JsonReply::status(
                400,
                error_body(None, ErrorCode::InvalidRequest, "Mcp-Session-Id required"),
            ));
        };
        let Some(session) = self.sessions.get(&session_id) else {
            return Err(JsonReply::status(
                404,
                error_body(None, ErrorCode::InvalidRequest, "Session not found"),
            ));
        };

        let Some(handle) = self.sessions.attach_sse(&session.id) else {
            return Err(JsonReply::status(
                409,
                error_body(
                    None,
                    ErrorCode::ServerError(-32000),
                    "SSE connection limit reached for session",
                ),
            ));
        };

        let (tx, rx) = mpsc::unbounded_channel();

        // Replay before going live so the subscriber observes seq order.
        if let Some(project_id) = query.get("projectId") {
            let workspace_id = query
                .get("workspaceId")
                .cloned()
                .or_else(|| session.principal.workspace_id.clone())
                .unwrap_or_else(|| meshgate_protocol::DEFAULT_WORKSPACE_ID.to_string());
            let cursor = query
                .get("cursor")
                .and_then(|c| c.parse::<u64>().ok())
                .unwrap_or(0);
            let key = ProjectKey::new(workspace_id, project_id.clone());
            for event in self.events.since(&key, cursor) {
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
                if let Ok(data) = serde_json::to_string(&notification) {
                    let _ = tx.send(sse_frame(
                        Some(&format!("{}#{}", key, event.seq)),
                        &data,
                    ));
                }
            }
        }

        self.sessions.touch(&session.id);
        self.broker.register(SseConnection {
            session_id: session.id.clone(),
            handle,
            tx,
            workspace_filter: session.principal.workspace_id.clone(),
        });

        Ok(SseStream { rx })
    }

    async fn process_value(
        &self,
        value: Value,
        headers: &HashMap<String, String>,
        principal: &Principal,
    ) -> EnvelopeOutcome {
        let request: JsonRpcRequest = match serde_json::from_value(value) {
            Ok(request) => request,
            Err(err) => {
                return EnvelopeOutcome::Fail(
                    400,
                    JsonRpcResponse::error(
                        None,
                        JsonRpcError::new(
                            ErrorCode::InvalidRequest,
                            format!("Invalid request envelope: {err}"),
                        ),
                    ),
                );
            }
        };
        self.process_envelope(request, headers, principal).await
    }

    async fn process_envelope(
        &self,
        request: JsonRpcRequest,
        headers: &HashMap<String, String>,
        principal: &Principal,
    ) -> EnvelopeOutcome {
        if request.jsonrpc != meshgate_protocol::JSONRPC_VERSION {
            return EnvelopeOutcome::Fail(
                400,
                JsonRpcResponse::error(
                    request.id,
                    JsonRpcError::new(
                        ErrorCode::InvalidRequest,
                        format!("Invalid JSON-RPC version: {}", request.jsonrpc),
                    ),
                ),
            );
        }

        if request.method == methods::INITIALIZE {
            return self.handle_initialize(request, principal).await;
        }

        // Everything else runs inside a session.
        let session = match self.require_session(&request, headers) {
            Ok(session) => session,
            Err(outcome) => return outcome,
        };
        self.sessions.touch(&session.id);

        match request.method.as_str() {
            methods::INITIALIZED => {
                if request.id.is_none() {
                    return EnvelopeOutcome::None;
                }
                EnvelopeOutcome::Reply(JsonRpcResponse::success(request.id, Value::Null))
            }
            methods::PING => EnvelopeOutcome::Reply(JsonRpcResponse::success(
                request.id,
                Value::Object(Default::default()),
            )),
            methods::TOOLS_LIST => self.handle_tools_list(request, &session).await,
            methods::TOOLS_CALL => self.handle_tools_call(request, &session).await,
            methods::RESOURCES_LIST => {
                let resources = self.resources.list().await;
                EnvelopeOutcome::Reply(JsonRpcResponse::success(
                    request.id,
                    json!({ "resources": resources }),
                ))
            }
            methods::RESOURCES_READ => self.handle_resources_read(request).await,
            methods::RESOURCES_TEMPLATES_LIST => {
                let templates = self.resources.templates().await;
                EnvelopeOutcome::Reply(JsonRpcResponse::success(
                    request.id,
                    json!({ "resourceTemplates": templates }),
                ))
            }
            other => {
                debug!("Unknown method: {other}");
                EnvelopeOutcome::Reply(JsonRpcResponse::error(
                    request.id,
                    JsonRpcError::new(ErrorCode::MethodNotFound, "Method not found"),
                ))
            }
        }
    }

    async fn handle_initialize(
        &self,
        request: JsonRpcRequest,
        principal: &Principal,
    ) -> EnvelopeOutcome {
        let Some(id) = request.id.clone() else {
            return EnvelopeOutcome::Fail(
                400,
                JsonRpcResponse::error(
                    None,
                    JsonRpcError::new(
                        ErrorCode::InvalidRequest,
                        "initialize requires a request id",
                    ),
                ),
            );
        };

        let params: InitializeParams = match request.params {
            Some(params) => match serde_json::from_value(params) {
                Ok(params) => params,
                Err(err) => {
                    return EnvelopeOutcome::Fail(
                        400,
                        JsonRpcResponse::error(
                            Some(id),
                            JsonRpcError::new(
                                ErrorCode::InvalidParams,
                                format!("Invalid initialize params: {err}"),
                            ),
                        ),
                    );
                }
            },
            None => {
                return EnvelopeOutcome::Fail(
                    400,
                    JsonRpcResponse::error(
                        Some(id),
                        JsonRpcError::new(ErrorCode::InvalidParams, "Missing initialize params"),
                    ),
                );
            }
        };

        if !SUPPORTED_PROTOCOL_VERSIONS.contains(&params.protocol_version.as_str()) {
            return EnvelopeOutcome::Fail(
                400,
                JsonRpcResponse::error(
                    Some(id),
                    JsonRpcError::with_data(
                        ErrorCode::InvalidParams,
                        "Unsupported protocol version",
                        json!({
                            "requested": params.protocol_version,
                            "supported": SUPPORTED_PROTOCOL_VERSIONS,
                        }),
                    ),
                ),
            );
        }

        let session = self
            .sessions
            .create(params.protocol_version.clone(), principal.clone());
        info!(
            "Initialize from {} v{} (protocol {}, session {})",
            params.client_info.name,
            params.client_info.version,
            params.protocol_version,
            session.id
        );

        let result = InitializeResult {
            protocol_version: params.protocol_version,
            capabilities: ServerCapabilities {
                tools: Some(ToolsCapability { list_changed: true }),
                resources: Some(json!({})),
                logging: None,
            },
            server_info: ServerInfo {
                name: self.config.server_name.clone(),
                version: self.config.server_version.clone(),
            },
            instructions: self.config.instructions.clone(),
            tool_registry: self.registry_info.clone(),
        };

        EnvelopeOutcome::ReplyWithSession(
            JsonRpcResponse::success(
                Some(id),
                serde_json::to_value(result).unwrap_or(Value::Null),
            ),
            session.id.to_string(),
        )
    }

    async fn handle_tools_list(
        &self,
        request: JsonRpcRequest,
        session: &Session,
    ) -> EnvelopeOutcome {
        // Re-resolved on every call: permission changes are visible on the
        // next list without session churn.
        let view = self.resolver.resolve(&session.principal).await;
        let result = ToolsListResult {
            tools: view.definitions(),
        };
        EnvelopeOutcome::Reply(JsonRpcResponse::success(
            request.id,
            serde_json::to_value(result).unwrap_or(Value::Null),
        ))
    }

    async fn handle_tools_call(
        &self,
        request: JsonRpcRequest,
        session: &Session,
    ) -> EnvelopeOutcome {
        let params: ToolCallParams = match request.params {
            Some(params) => match serde_json::from_value(params) {
                Ok(params) => params,
                Err(err) => {
                    return EnvelopeOutcome::Reply(JsonRpcResponse::error(
                        request.id,
                        JsonRpcError::new(
                            ErrorCode::InvalidParams,
                            format!("Invalid tool call params: {err}"),
                        ),
                    ));
                }
            },
            None => {
                return EnvelopeOutcome::Reply(JsonRpcResponse::error(
                    request.id,
                    JsonRpcError::new(ErrorCode::InvalidParams, "Missing tool call params"),
                ));
            }
        };

        // The registry is re-resolved at call time; a tool hidden by a
        // permission change is unknown even within an established session.
        let view = self.resolver.resolve(&session.principal).await;
        let Some(spec) = view.get(&params.name) else {
            warn!(
                "Rejected hidden/unknown tool {} for {}",
                params.name, session.principal.account_id
            );
            return EnvelopeOutcome::Fail(
                400,
                JsonRpcResponse::error(
                    request.id,
                    JsonRpcError::with_data(
                        ErrorCode::InvalidParams,
                        format!("Unknown tool: {}", params.name),
                        json!({ "code": "invalid_payload" }),
                    ),
                ),
            );
        };

        if let Err(violation) = meshgate_schema::validate(&spec.input_schema(), &params.arguments)
        {
            let body = json!({
                "ok": false,
                "error": {
                    "code": "invalid_payload",
                    "message": violation.message,
                    "details": {
                        "path": violation.path,
                        "reason": violation.reason,
                        "details": violation.details,
                    }
                }
            });
            return EnvelopeOutcome::Reply(JsonRpcResponse::success(
                request.id,
                serde_json::to_value(CallToolResult::from_value(body, true))
                    .unwrap_or(Value::Null),
            ));
        }

        let ctx = DispatchContext {
            principal: session.principal.clone(),
            session_id: Some(session.id.to_string()),
        };
        let response = self.dispatcher.handle(&params.name, &params.arguments, &ctx).await;
        let is_error = !response.ok;
        let body = serde_json::to_value(response).unwrap_or(Value::Null);

        EnvelopeOutcome::Reply(JsonRpcResponse::success(
            request.id,
            serde_json::to_value(CallToolResult::from_value(body, is_error))
                .unwrap_or(Value::Null),
        ))
    }

    async fn handle_resources_read(&self, request: JsonRpcRequest) -> EnvelopeOutcome {
        let uri = request
            .params
            .as_ref()
            .and_then(|p| p.get("uri"))
            .and_then(Value::as_str)
            .map(String::from);
        let Some(uri) = uri else {
            return EnvelopeOutcome::Reply(JsonRpcResponse::error(
                request.id,
                JsonRpcError::new(ErrorCode::InvalidParams, "uri is required"),
            ));
        };

        match self.resources.read(&uri).await {
            Some(content) => EnvelopeOutcome::Reply(JsonRpcResponse::success(
                request.id,
                json!({ "contents": [content] }),
            )),
            None => EnvelopeOutcome::Reply(JsonRpcResponse::error(
                request.id,
                JsonRpcError::new(
                    ErrorCode::InvalidParams,
                    format!("Unknown resource: {uri}"),
                ),
            )),
        }
    }

    fn require_session(
        &self,
        request: &JsonRpcRequest,
        headers: &HashMap<String, String>,
    ) -> Result<Session, EnvelopeOutcome> {
        let Some(session_id) = session_header(headers) else {
            return Err(EnvelopeOutcome::Fail(
                400,
                JsonRpcResponse::error(
                    request.id.clone(),
                    JsonRpcError::new(ErrorCode::InvalidRequest, "Mcp-Session-Id required"),
                ),
            ));
        };
        let Some(session) = self.sessions.get(&session_id) else {
            return Err(EnvelopeOutcome::Fail(
                404,
                JsonRpcResponse::error(
                    request.id.clone(),
                    JsonRpcError::new(ErrorCode::InvalidRequest, "Session not found"),
                ),
            ));
        };

        if let Some(version) = headers.get(&hdr::PROTOCOL_VERSION.to_lowercase()) {
            if version != &session.protocol_version {
                return Err(EnvelopeOutcome::Fail(
                    400,
                    JsonRpcResponse::error(
                        request.id.clone(),
                        JsonRpcError::with_data(
                            ErrorCode::InvalidRequest,
                            "MCP-Protocol-Version mismatch",
                            json!({
                                "header": version,
                                "session": session.protocol_version,
                            }),
                        ),
                    ),
                ));
            }
        }

        Ok(session)
    }
}

fn session_header(headers: &HashMap<String, String>) -> Option<meshgate_state::SessionId> {
    headers
        .get(&hdr::SESSION_ID.to_lowercase())
        .map(|v| meshgate_state::SessionId::from_string(v.clone()))
}

/// Lock-owner identity for a principal, mirroring the dispatcher's keying.
fn agent_id(principal: &Principal) -> String {
    if !principal.account_id.is_empty() {
        principal.account_id.clone()
    } else if !principal.key_id.is_empty() {
        principal.key_id.clone()
    } else {
        "anonymous".to_string()
    }
}

/// Serialize a bare JSON-RPC error body.
fn error_body(id: Option<RequestId>, code: ErrorCode, message: &str) -> Value {
    serde_json::to_value(JsonRpcResponse::error(
        id,
        JsonRpcError::new(code, message),
    ))
    .unwrap_or(Value::Null)
}
