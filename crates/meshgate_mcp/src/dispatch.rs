//! Tool dispatcher.
//!
//! One entry point, `handle`, takes a validated tool call and runs the full
//! gateway pipeline: backend resolution, scope extraction, write
//! authorization, project locking, forwarding, revision guarding, and
//! response enrichment. Mutations hold the project lock for exactly the
//! duration of the call and release it on every exit path.

use meshgate_protocol::{
    derive_project_id, NextAction, Principal, ProjectKey, Scope, ToolError, ToolErrorCode,
    ToolResponse, DEFAULT_PROJECT_ID, DEFAULT_TENANT_ID, DEFAULT_WORKSPACE_ID,
};
use meshgate_security::{AccessRequest, PolicyEngine};
use meshgate_state::{
    Clock, EventLog, JobQueue, JobStatus, LockError, LockManager, LockOwner, SessionStore, Sleeper,
    SubmitJobInput,
};
use meshgate_store::ProjectRepository;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::backend::{Backend, BackendContext, BackendRegistry};
use crate::tools::{self, ToolSpec};
use meshgate_protocol::CapabilitiesEnvelope;
use meshgate_protocol::JobId;

/// Tools whose successful mutation should refresh connected viewports.
const VIEWPORT_TOOLS: &[&str] = &["create_project", "update_project", "delete_project"];

/// Dispatcher tuning.
#[derive(Debug, Clone)]
pub struct DispatchPolicy {
    /// TTL stamped on acquired project locks
    pub lock_ttl_ms: u64,
    /// Budget for waiting out a contended lock; 0 fails on first conflict
    pub lock_timeout_ms: u64,
    /// Poll interval while waiting
    pub lock_retry_ms: u64,
    /// Retry a revision-guarded mutation once with the fresh revision
    pub auto_retry_revision: bool,
    /// Attach project state to every response
    pub auto_include_state: bool,
    /// Attach a state diff to every mutation response
    pub auto_include_diff: bool,
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self {
            lock_ttl_ms: 30_000,
            lock_timeout_ms: 2_000,
            lock_retry_ms: 50,
            auto_retry_revision: true,
            auto_include_state: false,
            auto_include_diff: false,
        }
    }
}

/// Best-effort viewport refresh sink. Failures are logged and swallowed.
pub trait ViewportNotifier: Send + Sync {
    fn viewport_refresh(&self, key: &ProjectKey) -> Result<(), String>;
}

/// Best-effort call tracing sink. Failures are logged and swallowed.
pub trait TraceRecorder: Send + Sync {
    fn record(&self, tool: &str, payload: &Value, response: &ToolResponse) -> Result<(), String>;
}

/// Caller identity threaded through a dispatch.
#[derive(Debug, Clone)]
pub struct DispatchContext {
    pub principal: Principal,
    pub session_id: Option<String>,
}

impl DispatchContext {
    /// The agent identity locks are keyed on.
    fn agent_id(&self) -> String {
        if !self.principal.account_id.is_empty() {
            self.principal.account_id.clone()
        } else if !self.principal.key_id.is_empty() {
            self.principal.key_id.clone()
        } else {
            "anonymous".to_string()
        }
    }
}

/// The gateway tool dispatcher.
pub struct Dispatcher {
    registry: Arc<BackendRegistry>,
    locks: Arc<LockManager>,
    events: Arc<EventLog>,
    queue: Arc<JobQueue>,
    sessions: Arc<SessionStore>,
    policy_engine: Arc<PolicyEngine>,
    projects: Arc<dyn ProjectRepository>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    policy: DispatchPolicy,
    capabilities: CapabilitiesEnvelope,
    viewport: Option<Arc<dyn ViewportNotifier>>,
    trace: Option<Arc<dyn TraceRecorder>>,
}

#[allow(clippy::too_many_arguments)]
impl Dispatcher {
    pub fn new(
        registry: Arc<BackendRegistry>,
        locks: Arc<LockManager>,
        events: Arc<EventLog>,
        queue: Arc<JobQueue>,
        sessions: Arc<SessionStore>,
        policy_engine: Arc<PolicyEngine>,
        projects: Arc<dyn ProjectRepository>,
        clock: Arc<dyn Clock>,
        sleeper: Arc<dyn Sleeper>,
        policy: DispatchPolicy,
        capabilities: CapabilitiesEnvelope,
    ) -> Self {
        Self {
            registry,
            locks,
            events,
            queue,
            sessions,
            policy_engine,
            projects,
            clock,
            sleeper,
            policy,
            capabilities,
            viewport: None,
            trace: None,
        }
    }

    pub fn with_viewport_notifier(mut self, notifier: Arc<dyn ViewportNotifier>) -> Self {
        self.viewport = Some(notifier);
        self
    }

    pub fn with_trace_recorder(mut self, recorder: Arc<dyn TraceRecorder>) -> Self {
        self.trace = Some(recorder);
        self
    }

    /// Dispatch one tool call.
    pub async fn handle(
        &self,
        tool_name: &str,
        payload: &Value,
        ctx: &DispatchContext,
    ) -> ToolResponse {
        let Some(spec) = tools::find_tool(tool_name) else {
            return ToolResponse::err(
                ToolError::new(
                    ToolErrorCode::InvalidPayload,
                    format!("Unknown tool: {tool_name}"),
                )
                .with_fix("Call tools/list to discover the available tools"),
            );
        };

        let backend = match self.resolve_backend(payload) {
            Ok(backend) => backend,
            Err(response) => return response,
        };
        let scope = self.extract_scope(payload, ctx);

        let response = if spec.is_mutating() {
            self.handle_mutation(&spec, tool_name, payload, &scope, ctx, backend)
                .await
        } else {
            let mut response = self
                .execute(tool_name, payload, &scope, ctx, backend)
                .await;
            self.attach_state(&mut response, payload, &scope, None).await;
            response
        };

        if let Some(trace) = &self.trace {
            if let Err(err) = trace.record(tool_name, payload, &response) {
                warn!("Trace recording failed for {}: {}", tool_name, err);
            }
        }

        response
    }

    async fn handle_mutation(
        &self,
        spec: &ToolSpec,
        tool_name: &str,
        payload: &Value,
        scope: &Scope,
        ctx: &DispatchContext,
        backend: Arc<dyn Backend>,
    ) -> ToolResponse {
        debug_assert!(spec.is_mutating());
        let key = scope.project_key();

        if let Some(response) = self.authorize_write(payload, scope, ctx).await {
            return response;
        }

        let owner = LockOwner::new(ctx.agent_id(), ctx.session_id.clone());
        if let Err(response) = self.acquire_lock(&key, &owner).await {
            return response;
        }

        // The lock is held for the duration of the single call and released
        // on every exit path below.
        let before = if self.include_diff(payload) {
            self.projects.find(scope).await.ok().flatten()
        } else {
            None
        };

        let mut response = self
            .execute_guarded(tool_name, payload, scope, ctx, backend)
            .await;

        if response.ok {
            if tool_name == "delete_project" {
                self.events.snapshot_revision(&key, None);
            } else if let Some(revision) = response.revision.clone() {
                self.events.snapshot_revision(&key, Some(revision));
            }
        }

        self.attach_state(&mut response, payload, scope, before.map(|r| r.state))
            .await;
        self.locks.release(&key, &owner);

        if response.ok && VIEWPORT_TOOLS.contains(&tool_name) {
            if let Some(viewport) = &self.viewport {
                if let Err(err) = viewport.viewport_refresh(&key) {
                    warn!("Viewport refresh failed for {}: {}", key, err);
                }
            }
        }

        response
    }

    /// Forward to the backend with the revision guard wrapped around it.
    async fn execute_guarded(
        &self,
        tool_name: &str,
        payload: &Value,
        scope: &Scope,
        ctx: &DispatchContext,
        backend: Arc<dyn Backend>,
    ) -> ToolResponse {
        let response = self
            .execute(tool_name, payload, scope, ctx, backend.clone())
            .await;
        if response.ok || response.error_reason() != Some("missing_ifRevision") {
            return response;
        }

        if self.policy.auto_retry_revision {
            if let Ok(Some(record)) = self.projects.find(scope).await {
                debug!(
                    "Retrying {} once with fresh revision {}",
                    tool_name, record.revision
                );
                let mut retry_payload = payload.clone();
                if let Some(map) = retry_payload.as_object_mut() {
                    map.insert("ifRevision".to_string(), json!(record.revision));
                }
                let retried = self
                    .execute(tool_name, &retry_payload, scope, ctx, backend)
                    .await;
                if retried.ok {
                    return retried;
                }
            }
        }

        self.with_revision_next_actions(response, tool_name, payload, scope)
    }

    /// Gateway-owned tools execute inline; everything else forwards to the
    /// resolved backend.
    async fn execute(
        &self,
        tool_name: &str,
        payload: &Value,
        scope: &Scope,
        ctx: &DispatchContext,
        backend: Arc<dyn Backend>,
    ) -> ToolResponse {
        match tool_name {
            "list_capabilities" => {
                ToolResponse::ok(serde_json::to_value(&self.capabilities).unwrap_or(Value::Null))
            }
            "list_backends" => ToolResponse::ok(json!({
                "backends": self.registry.list_kinds(),
                "default": self.registry.default_kind(),
            })),
            "submit_job" => self.submit_job(payload, scope),
            "job_status" => self.job_status(payload),
            "list_jobs" => self.list_jobs(payload, scope),
            "workspace_read_demo" => ToolResponse::ok(json!({
                "workspaceId": scope.workspace_id,
                "projectId": scope.project_id,
                "accountId": ctx.principal.account_id,
            })),
            "workspace_get_metrics" => self.workspace_metrics(scope),
            _ => {
                let backend_ctx = BackendContext {
                    scope: scope.clone(),
                    principal: ctx.principal.clone(),
                    session_id: ctx.session_id.clone(),
                };
                backend.handle_tool(tool_name, payload, &backend_ctx).await
            }
        }
    }

    fn submit_job(&self, payload: &Value, scope: &Scope) -> ToolResponse {
        let Some(kind) = payload.get("kind").and_then(Value::as_str) else {
            return ToolResponse::err(ToolError::new(
                ToolErrorCode::InvalidPayload,
                "kind is required",
            ));
        };

        let job = self.queue.submit(SubmitJobInput {
            workspace_id: scope.workspace_id.clone(),
            project_id: scope.project_id.clone(),
            kind: kind.to_string(),
            payload: payload.get("payload").cloned().unwrap_or_else(|| json!({})),
            max_attempts: payload
                .get("maxAttempts")
                .and_then(Value::as_u64)
                .map(|v| v as u32),
            lease_ms: payload.get("leaseMs").and_then(Value::as_u64),
        });

        ToolResponse::ok(json!({
            "jobId": job.id,
            "status": job.status,
            "maxAttempts": job.max_attempts,
            "leaseMs": job.lease_ms,
        }))
    }

    fn job_status(&self, payload: &Value) -> ToolResponse {
        let Some(raw) = payload.get("jobId").and_then(Value::as_str) else {
            return ToolResponse::err(ToolError::new(
                ToolErrorCode::InvalidPayload,
                "jobId is required",
            ));
        };
        let Ok(id) = JobId::parse(raw) else {
            return ToolResponse::err(ToolError::new(
                ToolErrorCode::InvalidPayload,
                format!("Invalid job id: {raw}"),
            ));
        };

        match self.queue.get(&id) {
            Some(job) => {
                ToolResponse::ok(serde_json::to_value(&job).unwrap_or(Value::Null))
            }
            None => ToolResponse::err(
                ToolError::new(ToolErrorCode::InvalidState, format!("Job not found: {raw}"))
                    .with_details(json!({ "reason": "job_not_found" })),
            ),
        }
    }

    fn list_jobs(&self, payload: &Value, scope: &Scope) -> ToolResponse {
        let status = match payload.get("status").and_then(Value::as_str) {
            Some("queued") => Some(JobStatus::Queued),
            Some("running") => Some(JobStatus::Running),
            Some("completed") => Some(JobStatus::Completed),
            Some("failed") => Some(JobStatus::Failed),
            _ => None,
        };
        let jobs = self.queue.list(Some(&scope.project_key()), status);
        let count = jobs.len();
        ToolResponse::ok(json!({
            "jobs": jobs,
            "count": count,
        }))
    }

    fn workspace_metrics(&self, scope: &Scope) -> ToolResponse {
        let all = self.queue.list(None, None);
        let mut counts = [0usize; 4];
        for job in all.iter().filter(|j| j.workspace_id == scope.workspace_id) {
            let idx = match job.status {
                JobStatus::Queued => 0,
                JobStatus::Running => 1,
                JobStatus::Completed => 2,
                JobStatus::Failed => 3,
            };
            counts[idx] += 1;
        }
        ToolResponse::ok(json!({
            "workspaceId": scope.workspace_id,
            "jobs": {
                "queued": counts[0],
                "running": counts[1],
                "completed": counts[2],
                "failed": counts[3],
            },
            "sessions": self.sessions.count(),
        }))
    }

    fn resolve_backend(&self, payload: &Value) -> Result<Arc<dyn Backend>, ToolResponse> {
        let requested = payload.get("backend").and_then(Value::as_str);
        let resolved = match requested {
            Some(kind) => self.registry.resolve(kind),
            None => self.registry.default_backend(),
        };
        resolved.ok_or_else(|| {
            ToolResponse::err(
                ToolError::new(
                    ToolErrorCode::InvalidState,
                    match requested {
                        Some(kind) => format!("Backend {kind} is not registered"),
                        None => "No default backend is registered".to_string(),
                    },
                )
                .with_fix("Pick one of the available backends")
                .with_details(json!({
                    "reason": "unsupported_backend",
                    "available": self.registry.list_kinds(),
                })),
            )
        })
    }

    fn extract_scope(&self, payload: &Value, ctx: &DispatchContext) -> Scope {
        let project_id = payload
            .get("projectId")
            .and_then(Value::as_str)
            .map(String::from)
            .or_else(|| {
                payload
                    .get("projectName")
                    .and_then(Value::as_str)
                    .map(derive_project_id)
            })
            .unwrap_or_else(|| DEFAULT_PROJECT_ID.to_string());

        let workspace_id = payload
            .get("workspaceId")
            .and_then(Value::as_str)
            .map(String::from)
            .or_else(|| ctx.principal.workspace_id.clone())
            .unwrap_or_else(|| DEFAULT_WORKSPACE_ID.to_string());

        Scope::new(DEFAULT_TENANT_ID, workspace_id, project_id)
    }

    async fn authorize_write(
        &self,
        payload: &Value,
        scope: &Scope,
        ctx: &DispatchContext,
    ) -> Option<ToolResponse> {
        let mut folder_path: Vec<Option<String>> = vec![None];
        if let Some(folders) = payload.get("folderPath").and_then(Value::as_array) {
            folder_path.extend(
                folders
                    .iter()
                    .filter_map(Value::as_str)
                    .map(|f| Some(f.to_string())),
            );
        }

        let request = AccessRequest {
            workspace_id: &scope.workspace_id,
            folder_path: &folder_path,
            project_id: &scope.project_id,
            tool: "",
            actor: &ctx.principal,
        };

        match self.policy_engine.authorize_write(&request).await {
            Ok(Ok(())) => None,
            Ok(Err(denial)) => Some(ToolResponse::err(
                ToolError::new(
                    ToolErrorCode::InvalidState,
                    format!(
                        "Write access to project {} denied",
                        scope.project_id
                    ),
                )
                .with_fix("Ask a workspace admin for write access")
                .with_details(serde_json::to_value(&denial).unwrap_or(Value::Null)),
            )),
            Err(err) => Some(ToolResponse::err(ToolError::new(
                ToolErrorCode::IoError,
                format!("Authorization lookup failed: {err}"),
            ))),
        }
    }

    async fn acquire_lock(
        &self,
        key: &ProjectKey,
        owner: &LockOwner,
    ) -> Result<(), ToolResponse> {
        let started = self.clock.now_ms();
        loop {
            match self.locks.acquire(key, owner, Some(self.policy.lock_ttl_ms)) {
                Ok(_) => return Ok(()),
                Err(LockError::Conflict {
                    owner_agent_id,
                    owner_session_id,
                    expires_at,
                    ..
                }) => {
                    let elapsed = self.clock.now_ms().saturating_sub(started);
                    if elapsed >= self.policy.lock_timeout_ms {
                        let reason = if self.policy.lock_timeout_ms == 0 {
                            "project_locked"
                        } else {
                            "lock_timeout"
                        };
                        return Err(ToolResponse::err(
                            ToolError::new(
                                ToolErrorCode::InvalidState,
                                format!("Project {} is locked by another agent", key.project_id),
                            )
                            .with_fix("Retry after the lock expires or ask the holder to finish")
                            .with_details(json!({
                                "reason": reason,
                                "ownerAgentId": owner_agent_id,
                                "ownerSessionId": owner_session_id,
                                "expiresAt": expires_at,
                            })),
                        ));
                    }
                    self.sleeper.sleep_ms(self.policy.lock_retry_ms).await;
                }
            }
        }
    }

    /// Suggest the canonical recovery sequence for a missing revision guard:
    /// read the state, then retry the same tool with the fresh revision.
    fn with_revision_next_actions(
        &self,
        mut response: ToolResponse,
        tool_name: &str,
        payload: &Value,
        scope: &Scope,
    ) -> ToolResponse {
        let selector = json!({
            "projectId": scope.project_id,
            "workspaceId": scope.workspace_id,
        });

        let mut get_state_args = selector.clone();
        if let Some(map) = get_state_args.as_object_mut() {
            map.insert("detail".to_string(), json!("summary"));
        }

        let mut retry_args = payload.clone();
        if let Some(map) = retry_args.as_object_mut() {
            map.insert(
                "ifRevision".to_string(),
                json!("$ref(get_project_state/project/revision)"),
            );
        }

        let mut actions = response.next_actions.take().unwrap_or_default();
        actions.push(NextAction {
            tool: "get_project_state".to_string(),
            arguments: get_state_args,
            reason: Some("Fetch the current revision".to_string()),
        });
        actions.push(NextAction {
            tool: tool_name.to_string(),
            arguments: retry_args,
            reason: Some("Retry with the fresh revision".to_string()),
        });

        // Dedupe by tool name, first occurrence wins.
        let mut seen = std::collections::HashSet::new();
        actions.retain(|action| seen.insert(action.tool.clone()));

        response.next_actions = Some(actions);
        response
    }

    fn include_diff(&self, payload: &Value) -> bool {
        self.policy.auto_include_diff
            || payload
                .get("includeDiff")
                .and_then(Value::as_bool)
                .unwrap_or(false)
    }

    async fn attach_state(
        &self,
        response: &mut ToolResponse,
        payload: &Value,
        scope: &Scope,
        before_state: Option<Value>,
    ) {
        let include_state = self.policy.auto_include_state
            || payload
                .get("includeState")
                .and_then(Value::as_bool)
                .unwrap_or(false);
        if !include_state && before_state.is_none() {
            return;
        }

        let record = match self.projects.find(scope).await {
            Ok(record) => record,
            Err(err) => {
                warn!("State attachment failed for {}: {}", scope, err);
                return;
            }
        };

        if include_state {
            response.state = record.as_ref().map(|r| r.state.clone());
        }
        if let Some(before) = before_state {
            let after = record
                .as_ref()
                .map(|r| r.state.clone())
                .unwrap_or(Value::Null);
            response.diff = Some(state_diff(&before, &after));
        }
    }
}

/// Top-level key diff between two state objects.
fn state_diff(before: &Value, after: &Value) -> Value {
    let empty = serde_json::Map::new();
    let before_map = before.as_object().unwrap_or(&empty);
    let after_map = after.as_object().unwrap_or(&empty);

    let mut added = Vec::new();
    let mut removed = Vec::new();
    let mut changed = Vec::new();

    for key in after_map.keys() {
        match before_map.get(key) {
            None => added.push(key.clone()),
            Some(value) if value != &after_map[key] => changed.push(key.clone()),
            Some(_) => {}
        }
    }
    for key in before_map.keys() {
        if !after_map.contains_key(key) {
            removed.push(key.clone());
        }
    }

    json!({ "added": added, "removed": removed, "changed": changed })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineBackend;
    use meshgate_protocol::{KeySpace, ToolRegistryInfo};
    use meshgate_protocol::capabilities::{AuthoringCapabilities, Limits};
    use meshgate_security::Principal;
    use meshgate_state::{ManualClock, ManualSleeper, SessionStore};
    use meshgate_store::{
        Member, MemoryProjectRepository, MemoryWorkspaceRepository, Role, Workspace, WorkspaceMode,
        WorkspaceRepository,
    };
    use std::sync::Mutex;

    #[allow(dead_code)]
    struct Harness {
        clock: Arc<ManualClock>,
        locks: Arc<LockManager>,
        events: Arc<EventLog>,
        queue: Arc<JobQueue>,
        workspaces: Arc<MemoryWorkspaceRepository>,
        dispatcher: Dispatcher,
    }

    fn capabilities() -> CapabilitiesEnvelope {
        CapabilitiesEnvelope {
            plugin_version: "0.1.0".to_string(),
            tool_schema_version: "1".to_string(),
            blockbench_version: "4.12".to_string(),
            limits: Limits::default(),
            tool_registry: ToolRegistryInfo {
                hash: tools::registry_hash(&tools::gateway_tools()),
                count: tools::gateway_tools().len(),
            },
            authoring: AuthoringCapabilities::default(),
            formats: vec!["bbmodel".to_string(), "gltf".to_string()],
        }
    }

    fn harness() -> Harness {
        let clock = Arc::new(ManualClock::new(1_000));
        let sleeper = Arc::new(ManualSleeper::new(Arc::clone(&clock)));
        let events = Arc::new(EventLog::new(clock.clone() as Arc<dyn Clock>));
        let locks = Arc::new(LockManager::new(
            clock.clone() as Arc<dyn Clock>,
            events.clone(),
        ));
        let queue = Arc::new(JobQueue::new(
            clock.clone() as Arc<dyn Clock>,
            events.clone(),
        ));
        let sessions = Arc::new(SessionStore::new(
            clock.clone() as Arc<dyn Clock>,
            300_000,
            4,
        ));
        let projects = Arc::new(MemoryProjectRepository::new(
            clock.clone() as Arc<dyn Clock>,
            sleeper.clone() as Arc<dyn Sleeper>,
        ));
        let workspaces = Arc::new(MemoryWorkspaceRepository::new());
        let policy_engine = Arc::new(PolicyEngine::new(
            workspaces.clone() as Arc<dyn WorkspaceRepository>,
        ));

        let mut registry = BackendRegistry::new("engine");
        let engine = Arc::new(EngineBackend::new(
            "engine",
            projects.clone() as Arc<dyn ProjectRepository>,
            clock.clone() as Arc<dyn Clock>,
        ));
        registry.register("engine", engine.clone());
        registry.register("blockbench", engine);

        let dispatcher = Dispatcher::new(
            Arc::new(registry),
            locks.clone(),
            events.clone(),
            queue.clone(),
            sessions,
            policy_engine,
            projects as Arc<dyn ProjectRepository>,
            clock.clone() as Arc<dyn Clock>,
            sleeper as Arc<dyn Sleeper>,
            DispatchPolicy::default(),
            capabilities(),
        );

        Harness {
            clock,
            locks,
            events,
            queue,
            workspaces,
            dispatcher,
        }
    }

    fn ctx(account: &str) -> DispatchContext {
        DispatchContext {
            principal: Principal {
                key_space: KeySpace::Workspace,
                key_id: format!("key-{account}"),
                account_id: account.to_string(),
                workspace_id: Some("ws_1".to_string()),
                system_roles: Vec::new(),
            },
            session_id: Some(format!("sess-{account}")),
        }
    }

    async fn open_workspace(h: &Harness) {
        h.workspaces
            .put_workspace(Workspace {
                workspace_id: "ws_1".to_string(),
                tenant_id: "default".to_string(),
                name: "Workspace 1".to_string(),
                mode: WorkspaceMode::AllOpen,
                created_by: "acct_admin".to_string(),
                created_at: 1,
                updated_at: 1,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let h = harness();
        let response = h
            .dispatcher
            .handle("no_such_tool", &json!({}), &ctx("acct_1"))
            .await;
        assert!(!response.ok);
        assert_eq!(
            response.error.unwrap().code,
            ToolErrorCode::InvalidPayload
        );
    }

    #[tokio::test]
    async fn test_unsupported_backend_lists_kinds() {
        let h = harness();
        open_workspace(&h).await;
        let response = h
            .dispatcher
            .handle(
                "create_project",
                &json!({"projectId": "prj_1", "backend": "maya"}),
                &ctx("acct_1"),
            )
            .await;
        assert!(!response.ok);
        assert_eq!(response.error_reason(), Some("unsupported_backend"));
        let details = response.error.unwrap().details.unwrap();
        assert!(details["available"]
            .as_array()
            .unwrap()
            .contains(&json!("engine")));
    }

    #[tokio::test]
    async fn test_scope_from_project_name() {
        let h = harness();
        open_workspace(&h).await;
        let response = h
            .dispatcher
            .handle(
                "create_project",
                &json!({"projectName": "Robot Arm"}),
                &ctx("acct_1"),
            )
            .await;
        assert!(response.ok);
        let expected = derive_project_id("Robot Arm");
        assert_eq!(response.data.unwrap()["projectId"], expected);
    }

    #[tokio::test]
    async fn test_mutation_denied_without_workspace() {
        let h = harness();
        // No workspace rows at all: workspace_not_found.
        let response = h
            .dispatcher
            .handle(
                "create_project",
                &json!({"projectId": "prj_1"}),
                &ctx("acct_1"),
            )
            .await;
        assert!(!response.ok);
        let details = response.error.unwrap().details.unwrap();
        assert_eq!(details["reason"], "workspace_not_found");
    }

    #[tokio::test]
    async fn test_read_only_skips_authorization() {
        let h = harness();
        // Rbac workspace, caller is not a member; reads still flow.
        h.workspaces
            .put_workspace(Workspace {
                workspace_id: "ws_1".to_string(),
                tenant_id: "default".to_string(),
                name: "Locked down".to_string(),
                mode: WorkspaceMode::Rbac,
                created_by: "acct_admin".to_string(),
                created_at: 1,
                updated_at: 1,
            })
            .await
            .unwrap();

        let response = h
            .dispatcher
            .handle(
                "get_project_state",
                &json!({"projectId": "prj_1"}),
                &ctx("acct_stranger"),
            )
            .await;
        assert!(response.ok);
        assert_eq!(response.data.unwrap()["project"]["exists"], false);
    }

    #[tokio::test]
    async fn test_rbac_member_write_allowed_stranger_denied() {
        let h = harness();
        h.workspaces
            .put_workspace(Workspace {
                workspace_id: "ws_1".to_string(),
                tenant_id: "default".to_string(),
                name: "Rbac".to_string(),
                mode: WorkspaceMode::Rbac,
                created_by: "acct_admin".to_string(),
                created_at: 1,
                updated_at: 1,
            })
            .await
            .unwrap();
        h.workspaces
            .put_role(Role {
                workspace_id: "ws_1".to_string(),
                role_id: "editor".to_string(),
                builtin: false,
                permissions: vec!["workspace:write".to_string()],
            })
            .await
            .unwrap();
        h.workspaces
            .put_member(Member {
                workspace_id: "ws_1".to_string(),
                account_id: "acct_member".to_string(),
                role_ids: vec!["editor".to_string()],
                joined_at: 1,
            })
            .await
            .unwrap();

        let allowed = h
            .dispatcher
            .handle(
                "create_project",
                &json!({"projectId": "prj_1"}),
                &ctx("acct_member"),
            )
            .await;
        assert!(allowed.ok);

        let denied = h
            .dispatcher
            .handle(
                "create_project",
                &json!({"projectId": "prj_2"}),
                &ctx("acct_stranger"),
            )
            .await;
        assert!(!denied.ok);
        let details = denied.error.unwrap().details.unwrap();
        assert_eq!(details["reason"], "forbidden_workspace_project_write");
    }

    #[tokio::test]
    async fn test_lock_conflict_times_out_with_holder_details() {
        let h = harness();
        open_workspace(&h).await;

        // Another agent holds the lock beyond the dispatcher's budget.
        let key = ProjectKey::new("ws_1", "prj_1");
        h.locks
            .acquire(
                &key,
                &LockOwner::new("acct_other", Some("sess-other".to_string())),
                Some(300_000),
            )
            .unwrap();

        let response = h
            .dispatcher
            .handle(
                "create_project",
                &json!({"projectId": "prj_1"}),
                &ctx("acct_1"),
            )
            .await;
        assert!(!response.ok);
        assert_eq!(response.error_reason(), Some("lock_timeout"));
        let details = response.error.unwrap().details.unwrap();
        assert_eq!(details["ownerAgentId"], "acct_other");
        assert_eq!(details["ownerSessionId"], "sess-other");
    }

    #[tokio::test]
    async fn test_lock_released_after_mutation() {
        let h = harness();
        open_workspace(&h).await;

        let first = h
            .dispatcher
            .handle(
                "create_project",
                &json!({"projectId": "prj_1"}),
                &ctx("acct_a"),
            )
            .await;
        assert!(first.ok);

        // A different agent can mutate immediately: the lock was released.
        let second = h
            .dispatcher
            .handle(
                "delete_project",
                &json!({"projectId": "prj_1"}),
                &ctx("acct_b"),
            )
            .await;
        assert!(second.ok);
        assert!(h.locks.current(&ProjectKey::new("ws_1", "prj_1")).is_none());
    }

    #[tokio::test]
    async fn test_lock_released_after_error_too() {
        let h = harness();
        open_workspace(&h).await;

        // update on a missing project fails inside the backend.
        let response = h
            .dispatcher
            .handle(
                "update_project",
                &json!({"projectId": "prj_x", "state": {}}),
                &ctx("acct_a"),
            )
            .await;
        assert!(!response.ok);
        assert!(h.locks.current(&ProjectKey::new("ws_1", "prj_x")).is_none());
    }

    #[tokio::test]
    async fn test_revision_guard_auto_retries_once() {
        let h = harness();
        open_workspace(&h).await;
        h.dispatcher
            .handle(
                "create_project",
                &json!({"projectId": "prj_1", "state": {"cubes": []}}),
                &ctx("acct_a"),
            )
            .await;

        // No ifRevision supplied; the dispatcher fetches it and retries.
        let response = h
            .dispatcher
            .handle(
                "update_project",
                &json!({"projectId": "prj_1", "state": {"cubes": [1]}}),
                &ctx("acct_a"),
            )
            .await;
        assert!(response.ok);
        assert!(response.revision.is_some());
    }

    #[tokio::test]
    async fn test_missing_revision_surfaces_next_actions_when_retry_disabled() {
        let mut h = harness();
        h.dispatcher.policy.auto_retry_revision = false;
        open_workspace(&h).await;
        h.dispatcher
            .handle(
                "create_project",
                &json!({"projectId": "prj_1"}),
                &ctx("acct_a"),
            )
            .await;

        let response = h
            .dispatcher
            .handle(
                "update_project",
                &json!({"projectId": "prj_1", "state": {"cubes": [1]}}),
                &ctx("acct_a"),
            )
            .await;
        assert!(!response.ok);
        assert_eq!(response.error_reason(), Some("missing_ifRevision"));

        let actions = response.next_actions.unwrap();
        assert_eq!(actions.len(), 2);
        assert_eq!(actions[0].tool, "get_project_state");
        assert_eq!(actions[1].tool, "update_project");
        assert_eq!(
            actions[1].arguments["ifRevision"],
            "$ref(get_project_state/project/revision)"
        );
    }

    #[tokio::test]
    async fn test_successful_mutation_publishes_revision_snapshot() {
        let h = harness();
        open_workspace(&h).await;
        let response = h
            .dispatcher
            .handle(
                "create_project",
                &json!({"projectId": "prj_1"}),
                &ctx("acct_a"),
            )
            .await;
        let revision = response.revision.clone().unwrap();

        let key = ProjectKey::new("ws_1", "prj_1");
        let snapshots: Vec<_> = h
            .events
            .since(&key, 0)
            .into_iter()
            .filter(|e| e.event == meshgate_state::EventKind::ProjectSnapshot)
            .collect();
        assert!(snapshots
            .iter()
            .any(|e| e.payload["project"]["revision"] == json!(revision)));
    }

    #[tokio::test]
    async fn test_include_state_and_diff_attachment() {
        let h = harness();
        open_workspace(&h).await;
        h.dispatcher
            .handle(
                "create_project",
                &json!({"projectId": "prj_1", "state": {"cubes": [], "name": "a"}}),
                &ctx("acct_a"),
            )
            .await;

        let response = h
            .dispatcher
            .handle(
                "update_project",
                &json!({
                    "projectId": "prj_1",
                    "state": {"cubes": [1], "textures": []},
                    "includeState": true,
                    "includeDiff": true
                }),
                &ctx("acct_a"),
            )
            .await;
        assert!(response.ok);
        assert_eq!(response.state.unwrap()["cubes"], json!([1]));
        let diff = response.diff.unwrap();
        assert_eq!(diff["added"], json!(["textures"]));
        assert_eq!(diff["removed"], json!(["name"]));
        assert_eq!(diff["changed"], json!(["cubes"]));
    }

    #[tokio::test]
    async fn test_submit_job_and_status() {
        let h = harness();
        open_workspace(&h).await;
        let submitted = h
            .dispatcher
            .handle(
                "submit_job",
                &json!({"projectId": "prj_1", "kind": "export", "maxAttempts": 999}),
                &ctx("acct_a"),
            )
            .await;
        assert!(submitted.ok);
        let data = submitted.data.unwrap();
        assert_eq!(data["maxAttempts"], 10);
        let job_id = data["jobId"].as_str().unwrap().to_string();

        let status = h
            .dispatcher
            .handle("job_status", &json!({"jobId": job_id}), &ctx("acct_a"))
            .await;
        assert!(status.ok);
        assert_eq!(status.data.unwrap()["status"], "queued");

        assert_eq!(h.queue.list(None, None).len(), 1);
    }

    #[tokio::test]
    async fn test_viewport_notifier_fires_on_mutation() {
        struct Recorder(Mutex<Vec<String>>);
        impl ViewportNotifier for Recorder {
            fn viewport_refresh(&self, key: &ProjectKey) -> Result<(), String> {
                self.0
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push(key.to_string());
                Ok(())
            }
        }

        let mut h = harness();
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        h.dispatcher = h.dispatcher.with_viewport_notifier(recorder.clone());
        open_workspace(&h).await;

        h.dispatcher
            .handle(
                "create_project",
                &json!({"projectId": "prj_1"}),
                &ctx("acct_a"),
            )
            .await;

        let seen = recorder.0.lock().unwrap_or_else(|e| e.into_inner()).clone();
        assert_eq!(seen, vec!["ws_1/prj_1".to_string()]);
    }

    #[tokio::test]
    async fn test_capabilities_and_metrics_tools() {
        let h = harness();
        open_workspace(&h).await;

        let caps = h
            .dispatcher
            .handle("list_capabilities", &json!({}), &ctx("acct_a"))
            .await;
        assert!(caps.ok);
        let data = caps.data.unwrap();
        assert_eq!(data["toolRegistry"]["count"], tools::gateway_tools().len());

        let metrics = h
            .dispatcher
            .handle("workspace_get_metrics", &json!({}), &ctx("acct_a"))
            .await;
        assert!(metrics.ok);
        assert_eq!(metrics.data.unwrap()["jobs"]["queued"], 0);
    }
}
