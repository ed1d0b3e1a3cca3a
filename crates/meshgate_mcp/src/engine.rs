//! Built-in reference backend.
//!
//! Stores opaque project state through the project repository with revision
//! compare-and-set. State-replacing mutations demand `ifRevision`; the
//! dispatcher's revision guard builds on the `missing_ifRevision` and
//! `revision_mismatch` details surfaced here.

use async_trait::async_trait;
use meshgate_protocol::{Scope, ToolError, ToolErrorCode, ToolResponse};
use meshgate_store::{ProjectRecord, ProjectRepository, RepoError};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::backend::{Backend, BackendContext};
use meshgate_state::Clock;

/// Reference engine backend.
pub struct EngineBackend {
    kind: String,
    projects: Arc<dyn ProjectRepository>,
    clock: Arc<dyn Clock>,
}

impl EngineBackend {
    pub fn new(
        kind: impl Into<String>,
        projects: Arc<dyn ProjectRepository>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            kind: kind.into(),
            projects,
            clock,
        }
    }

    fn next_revision() -> String {
        format!("rev_{}", &Uuid::new_v4().simple().to_string()[..8])
    }

    fn io_error(err: RepoError) -> ToolResponse {
        match err {
            RepoError::LockTimeout { .. } => ToolResponse::err(
                ToolError::new(ToolErrorCode::InvalidState, err.to_string())
                    .with_details(json!({ "reason": "lock_timeout" })),
            ),
            RepoError::Io(_) => ToolResponse::err(
                ToolError::new(ToolErrorCode::IoError, err.to_string())
                    .with_fix("Retry the call; the persistence layer failed transiently"),
            ),
        }
    }

    fn project_summary(scope: &Scope, record: Option<&ProjectRecord>) -> Value {
        match record {
            Some(record) => json!({
                "projectId": scope.project_id,
                "workspaceId": scope.workspace_id,
                "exists": true,
                "revision": record.revision,
                "createdAt": record.created_at,
                "updatedAt": record.updated_at,
            }),
            None => json!({
                "projectId": scope.project_id,
                "workspaceId": scope.workspace_id,
                "exists": false,
                "revision": null,
            }),
        }
    }

    async fn get_project_state(&self, payload: &Value, ctx: &BackendContext) -> ToolResponse {
        let record = match self.projects.find(&ctx.scope).await {
            Ok(record) => record,
            Err(err) => return Self::io_error(err),
        };

        let detail = payload
            .get("detail")
            .and_then(Value::as_str)
            .unwrap_or("summary");
        let mut data = json!({ "project": Self::project_summary(&ctx.scope, record.as_ref()) });
        if detail == "full" {
            data["state"] = record
                .as_ref()
                .map(|r| r.state.clone())
                .unwrap_or(Value::Null);
        }

        let mut response = ToolResponse::ok(data);
        response.revision = record.map(|r| r.revision);
        response
    }

    async fn create_project(&self, payload: &Value, ctx: &BackendContext) -> ToolResponse {
        let state = payload.get("state").cloned().unwrap_or_else(|| json!({}));
        let revision = Self::next_revision();
        let now = self.clock.now_ms();
        let record = ProjectRecord {
            scope: ctx.scope.clone(),
            revision: revision.clone(),
            state,
            created_at: now,
            updated_at: now,
        };

        match self.projects.save_if_revision(record, None).await {
            Ok(true) => {
                debug!("Created project {}", ctx.scope);
                ToolResponse::ok(json!({
                    "projectId": ctx.scope.project_id,
                    "created": true,
                }))
                .with_revision(revision)
            }
            Ok(false) => ToolResponse::err(
                ToolError::new(
                    ToolErrorCode::InvalidState,
                    format!("Project {} already exists", ctx.scope.project_id),
                )
                .with_fix("Use update_project with ifRevision to modify an existing project")
                .with_details(json!({ "reason": "project_exists" })),
            ),
            Err(err) => Self::io_error(err),
        }
    }

    async fn update_project(&self, payload: &Value, ctx: &BackendContext) -> ToolResponse {
        let Some(state) = payload.get("state").cloned() else {
            return ToolResponse::err(
                ToolError::new(ToolErrorCode::InvalidPayload, "state is required")
                    .with_fix("Provide the replacement project state"),
            );
        };

        let current = match self.projects.find(&ctx.scope).await {
            Ok(record) => record,
            Err(err) => return Self::io_error(err),
        };
        let Some(current) = current else {
            return ToolResponse::err(
                ToolError::new(
                    ToolErrorCode::InvalidState,
                    format!("Project {} does not exist", ctx.scope.project_id),
                )
                .with_fix("Create the project first with create_project")
                .with_details(json!({ "reason": "project_not_found" })),
            );
        };

        let Some(if_revision) = payload.get("ifRevision").and_then(Value::as_str) else {
            return ToolResponse::err(
                ToolError::new(
                    ToolErrorCode::InvalidState,
                    "ifRevision is required for update_project",
                )
                .with_fix("Fetch the current revision with get_project_state and pass it as ifRevision")
                .with_details(json!({
                    "reason": "missing_ifRevision",
                    "current": current.revision,
                })),
            );
        };

        if state == current.state {
            return ToolResponse::err(
                ToolError::new(ToolErrorCode::NoChange, "Update produced no observable change")
                    .with_details(json!({ "reason": "no_change" })),
            )
            .with_revision(current.revision);
        }

        let revision = Self::next_revision();
        let record = ProjectRecord {
            scope: ctx.scope.clone(),
            revision: revision.clone(),
            state,
            created_at: current.created_at,
            updated_at: self.clock.now_ms(),
        };

        match self.projects.save_if_revision(record, Some(if_revision)).await {
            Ok(true) => ToolResponse::ok(json!({
                "projectId": ctx.scope.project_id,
                "updated": true,
            }))
            .with_revision(revision),
            Ok(false) => {
                // The record existed above, so a failed CAS is a revision race.
                let current = match self.projects.find(&ctx.scope).await {
                    Ok(record) => record,
                    Err(err) => return Self::io_error(err),
                };
                ToolResponse::err(
                    ToolError::new(ToolErrorCode::InvalidState, "Revision mismatch")
                        .with_fix("Re-read the project state and retry with the fresh revision")
                        .with_details(json!({
                            "reason": "revision_mismatch",
                            "expected": if_revision,
                            "current": current.map(|r| r.revision),
                        })),
                )
            }
            Err(err) => Self::io_error(err),
        }
    }

    async fn delete_project(&self, ctx: &BackendContext) -> ToolResponse {
        let existing = match self.projects.find(&ctx.scope).await {
            Ok(record) => record,
            Err(err) => return Self::io_error(err),
        };
        if existing.is_none() {
            return ToolResponse::err(
                ToolError::new(ToolErrorCode::NoChange, "Project does not exist")
                    .with_details(json!({ "reason": "no_change" })),
            );
        }

        match self.projects.remove(&ctx.scope).await {
            Ok(()) => ToolResponse::ok(json!({
                "projectId": ctx.scope.project_id,
                "deleted": true,
            })),
            Err(err) => Self::io_error(err),
        }
    }
}

#[async_trait]
impl Backend for EngineBackend {
    fn kind(&self) -> &str {
        &self.kind
    }

    async fn handle_tool(
        &self,
        name: &str,
        payload: &Value,
        ctx: &BackendContext,
    ) -> ToolResponse {
        match name {
            "get_project_state" => self.get_project_state(payload, ctx).await,
            "create_project" => self.create_project(payload, ctx).await,
            "update_project" => self.update_project(payload, ctx).await,
            "delete_project" => self.delete_project(ctx).await,
            _ => ToolResponse::err(
                ToolError::new(
                    ToolErrorCode::NotImplemented,
                    format!("Backend {} does not implement {}", self.kind, name),
                )
                .with_details(json!({ "reason": "not_implemented", "tool": name })),
            ),
        }
    }

    async fn execute_job(
        &self,
        kind: &str,
        payload: &Value,
        scope: &Scope,
    ) -> Result<Value, String> {
        match kind {
            // Export renders the stored state into an artifact descriptor.
            "export" => {
                let record = self
                    .projects
                    .find(scope)
                    .await
                    .map_err(|e| e.to_string())?
                    .ok_or_else(|| format!("project {} does not exist", scope.project_id))?;
                let format = payload
                    .get("format")
                    .and_then(Value::as_str)
                    .unwrap_or("gltf");
                let rendered = serde_json::to_vec(&record.state).map_err(|e| e.to_string())?;
                Ok(json!({
                    "projectId": scope.project_id,
                    "format": format,
                    "revision": record.revision,
                    "sizeBytes": rendered.len(),
                }))
            }
            // Echo is a diagnostic kind used by operators to probe the worker plane.
            "echo" => Ok(payload.clone()),
            _ => Err(format!("unsupported job kind: {kind}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshgate_protocol::Principal;
    use meshgate_state::{ManualClock, ManualSleeper, Sleeper};
    use meshgate_store::MemoryProjectRepository;

    fn setup() -> (Arc<MemoryProjectRepository>, EngineBackend, BackendContext) {
        let clock = Arc::new(ManualClock::new(1_000));
        let sleeper = Arc::new(ManualSleeper::new(Arc::clone(&clock)));
        let projects = Arc::new(MemoryProjectRepository::new(
            clock.clone() as Arc<dyn Clock>,
            sleeper as Arc<dyn Sleeper>,
        ));
        let engine = EngineBackend::new(
            "engine",
            projects.clone() as Arc<dyn ProjectRepository>,
            clock as Arc<dyn Clock>,
        );
        let ctx = BackendContext {
            scope: Scope::new("default", "ws_1", "prj_1"),
            principal: Principal::anonymous(),
            session_id: None,
        };
        (projects, engine, ctx)
    }

    #[tokio::test]
    async fn test_create_then_get() {
        let (_, engine, ctx) = setup();
        let created = engine
            .handle_tool("create_project", &json!({"state": {"cubes": []}}), &ctx)
            .await;
        assert!(created.ok);
        let revision = created.revision.clone().unwrap();

        let state = engine
            .handle_tool("get_project_state", &json!({"detail": "full"}), &ctx)
            .await;
        assert!(state.ok);
        let data = state.data.unwrap();
        assert_eq!(data["project"]["exists"], true);
        assert_eq!(data["project"]["revision"], revision);
        assert_eq!(data["state"]["cubes"], json!([]));
    }

    #[tokio::test]
    async fn test_create_twice_fails() {
        let (_, engine, ctx) = setup();
        engine.handle_tool("create_project", &json!({}), &ctx).await;
        let second = engine.handle_tool("create_project", &json!({}), &ctx).await;
        assert!(!second.ok);
        assert_eq!(second.error_reason(), Some("project_exists"));
    }

    #[tokio::test]
    async fn test_update_requires_if_revision() {
        let (_, engine, ctx) = setup();
        engine.handle_tool("create_project", &json!({}), &ctx).await;

        let missing = engine
            .handle_tool("update_project", &json!({"state": {"cubes": [1]}}), &ctx)
            .await;
        assert!(!missing.ok);
        assert_eq!(missing.error_reason(), Some("missing_ifRevision"));
        // The current revision rides along so the guard can retry.
        assert!(missing.error.unwrap().details.unwrap()["current"].is_string());
    }

    #[tokio::test]
    async fn test_update_revision_mismatch() {
        let (_, engine, ctx) = setup();
        engine.handle_tool("create_project", &json!({}), &ctx).await;

        let stale = engine
            .handle_tool(
                "update_project",
                &json!({"state": {"cubes": [1]}, "ifRevision": "rev_stale"}),
                &ctx,
            )
            .await;
        assert!(!stale.ok);
        assert_eq!(stale.error_reason(), Some("revision_mismatch"));
    }

    #[tokio::test]
    async fn test_update_happy_path_changes_revision() {
        let (_, engine, ctx) = setup();
        let created = engine.handle_tool("create_project", &json!({}), &ctx).await;
        let rev1 = created.revision.unwrap();

        let updated = engine
            .handle_tool(
                "update_project",
                &json!({"state": {"cubes": [1]}, "ifRevision": rev1}),
                &ctx,
            )
            .await;
        assert!(updated.ok);
        assert_ne!(updated.revision.unwrap(), rev1);
    }

    #[tokio::test]
    async fn test_noop_update_is_no_change() {
        let (_, engine, ctx) = setup();
        let created = engine
            .handle_tool("create_project", &json!({"state": {"cubes": []}}), &ctx)
            .await;
        let rev1 = created.revision.unwrap();

        let noop = engine
            .handle_tool(
                "update_project",
                &json!({"state": {"cubes": []}, "ifRevision": rev1}),
                &ctx,
            )
            .await;
        assert!(!noop.ok);
        assert_eq!(
            noop.error.as_ref().unwrap().code,
            ToolErrorCode::NoChange
        );
        assert_eq!(noop.revision.as_deref(), Some(rev1.as_str()));
    }

    #[tokio::test]
    async fn test_delete_missing_is_no_change() {
        let (_, engine, ctx) = setup();
        let gone = engine.handle_tool("delete_project", &json!({}), &ctx).await;
        assert!(!gone.ok);
        assert_eq!(gone.error.unwrap().code, ToolErrorCode::NoChange);
    }

    #[tokio::test]
    async fn test_export_job_reads_state() {
        let (_, engine, ctx) = setup();
        engine
            .handle_tool("create_project", &json!({"state": {"cubes": [1, 2]}}), &ctx)
            .await;

        let result = engine
            .execute_job("export", &json!({"format": "bbmodel"}), &ctx.scope)
            .await
            .unwrap();
        assert_eq!(result["format"], "bbmodel");
        assert!(result["sizeBytes"].as_u64().unwrap() > 0);
    }

    #[tokio::test]
    async fn test_unknown_job_kind_fails() {
        let (_, engine, ctx) = setup();
        let err = engine
            .execute_job("paint", &json!({}), &ctx.scope)
            .await
            .unwrap_err();
        assert!(err.contains("unsupported job kind"));
    }
}
