//! Workspace authorization policy.
//!
//! Decides whether an account may read or write a project given the
//! workspace mode, the actor's effective roles, and the folder ACL chain
//! from the workspace root down to the target folder.
//!
//! ACL resolution: the decision comes from the nearest ancestor that
//! specifies anything for the actor's roles — deeper rows override
//! shallower ones, and at equal depth deny wins. A role-holding actor with
//! no specifying ancestor is allowed; folder ACLs restrict, they do not
//! grant baseline access.

use meshgate_protocol::Principal;
use meshgate_store::{AclDecision, FolderAcl, RepoError, WorkspaceMode, WorkspaceRepository};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// System role that bypasses workspace policy entirely.
pub const SYSTEM_ADMIN_ROLE: &str = "system_admin";

/// Read or write intent of a tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
}

/// Why access was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    WorkspaceNotFound,
    ForbiddenWorkspaceProjectRead,
    ForbiddenWorkspaceProjectWrite,
    ForbiddenFolderRead,
    ForbiddenFolderWrite,
}

/// A denied decision with the ids needed for a structured error.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessDenial {
    pub reason: DenyReason,
    pub workspace_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub folder_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
}

/// One authorization question.
#[derive(Debug, Clone)]
pub struct AccessRequest<'a> {
    pub workspace_id: &'a str,

    /// Folder chain from root, ordered; `None` is the workspace root.
    pub folder_path: &'a [Option<String>],

    pub project_id: &'a str,

    /// Tool being called (for logging only; classification happens in the
    /// registry)
    pub tool: &'a str,

    pub actor: &'a Principal,
}

/// Workspace policy engine.
pub struct PolicyEngine {
    workspaces: Arc<dyn WorkspaceRepository>,
}

impl PolicyEngine {
    pub fn new(workspaces: Arc<dyn WorkspaceRepository>) -> Self {
        Self { workspaces }
    }

    pub async fn authorize_write(
        &self,
        req: &AccessRequest<'_>,
    ) -> Result<Result<(), AccessDenial>, RepoError> {
        self.authorize(req, AccessKind::Write).await
    }

    pub async fn authorize_read(
        &self,
        req: &AccessRequest<'_>,
    ) -> Result<Result<(), AccessDenial>, RepoError> {
        self.authorize(req, AccessKind::Read).await
    }

    async fn authorize(
        &self,
        req: &AccessRequest<'_>,
        kind: AccessKind,
    ) -> Result<Result<(), AccessDenial>, RepoError> {
        let Some(workspace) = self.workspaces.get_workspace(req.workspace_id).await? else {
            return Ok(Err(AccessDenial {
                reason: DenyReason::WorkspaceNotFound,
                workspace_id: req.workspace_id.to_string(),
                folder_id: None,
                project_id: Some(req.project_id.to_string()),
            }));
        };

        if workspace.mode == WorkspaceMode::AllOpen
            || req.actor.has_system_role(SYSTEM_ADMIN_ROLE)
        {
            return Ok(Ok(()));
        }

        let roles = self.effective_roles(req).await?;
        if roles.is_empty() {
            debug!(
                "Denied {} on {} for {}: no roles in workspace {}",
                req.tool, req.project_id, req.actor.account_id, req.workspace_id
            );
            return Ok(Err(AccessDenial {
                reason: match kind {
                    AccessKind::Read => DenyReason::ForbiddenWorkspaceProjectRead,
                    AccessKind::Write => DenyReason::ForbiddenWorkspaceProjectWrite,
                },
                workspace_id: req.workspace_id.to_string(),
                folder_id: None,
                project_id: Some(req.project_id.to_string()),
            }));
        }

        let acls = self.workspaces.list_folder_acls(req.workspace_id).await?;
        if let Some(folder_id) = self.folder_denial(req, kind, &roles, &acls) {
            return Ok(Err(AccessDenial {
                reason: match kind {
                    AccessKind::Read => DenyReason::ForbiddenFolderRead,
                    AccessKind::Write => DenyReason::ForbiddenFolderWrite,
                },
                workspace_id: req.workspace_id.to_string(),
                folder_id,
                project_id: Some(req.project_id.to_string()),
            }));
        }

        Ok(Ok(()))
    }

    async fn effective_roles(&self, req: &AccessRequest<'_>) -> Result<HashSet<String>, RepoError> {
        let member = self
            .workspaces
            .get_member(req.workspace_id, &req.actor.account_id)
            .await?;
        Ok(member
            .map(|m| m.role_ids.into_iter().collect())
            .unwrap_or_default())
    }

    /// Walk the folder chain root-first and evaluate the nearest specifying
    /// ancestor. Returns the denying folder id (None = root) wrapped in
    /// `Some` when access is denied.
    #[allow(clippy::option_option)]
    fn folder_denial(
        &self,
        req: &AccessRequest<'_>,
        kind: AccessKind,
        roles: &HashSet<String>,
        acls: &[FolderAcl],
    ) -> Option<Option<String>> {
        let mut decision: Option<(bool, Option<String>)> = None;

        for folder in req.folder_path {
            let rows: Vec<&FolderAcl> = acls
                .iter()
                .filter(|row| row.folder_id == *folder && roles.contains(&row.role_id))
                .collect();
            if rows.is_empty() {
                continue;
            }

            let of = |row: &FolderAcl| match kind {
                AccessKind::Read => row.read,
                AccessKind::Write => row.write,
            };
            let any_allow = rows.iter().any(|row| of(row) == AclDecision::Allow);
            let any_deny = rows.iter().any(|row| of(row) == AclDecision::Deny);

            // Deny wins at equal depth; a deeper folder overrides whatever
            // was decided above it.
            decision = Some((any_allow && !any_deny, folder.clone()));
        }

        match decision {
            Some((false, folder)) => Some(folder),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshgate_protocol::KeySpace;
    use meshgate_store::{Member, MemoryWorkspaceRepository, Role, Workspace};

    fn actor(account: &str) -> Principal {
        Principal {
            key_space: KeySpace::Workspace,
            key_id: format!("key-{account}"),
            account_id: account.to_string(),
            workspace_id: Some("ws_1".to_string()),
            system_roles: Vec::new(),
        }
    }

    fn admin() -> Principal {
        Principal {
            system_roles: vec![SYSTEM_ADMIN_ROLE.to_string()],
            ..actor("acct_admin")
        }
    }

    async fn repo(mode: WorkspaceMode) -> Arc<MemoryWorkspaceRepository> {
        let repo = Arc::new(MemoryWorkspaceRepository::new());
        repo.put_workspace(Workspace {
            workspace_id: "ws_1".to_string(),
            tenant_id: "default".to_string(),
            name: "Workspace 1".to_string(),
            mode,
            created_by: "acct_admin".to_string(),
            created_at: 1,
            updated_at: 1,
        })
        .await
        .unwrap();
        repo
    }

    async fn join(repo: &MemoryWorkspaceRepository, account: &str, role: &str) {
        repo.put_role(Role {
            workspace_id: "ws_1".to_string(),
            role_id: role.to_string(),
            builtin: false,
            permissions: vec!["workspace:write".to_string()],
        })
        .await
        .unwrap();
        repo.put_member(Member {
            workspace_id: "ws_1".to_string(),
            account_id: account.to_string(),
            role_ids: vec![role.to_string()],
            joined_at: 1,
        })
        .await
        .unwrap();
    }

    fn request<'a>(
        actor: &'a Principal,
        folder_path: &'a [Option<String>],
    ) -> AccessRequest<'a> {
        AccessRequest {
            workspace_id: "ws_1",
            folder_path,
            project_id: "prj_1",
            tool: "update_project",
            actor,
        }
    }

    async fn acl(
        repo: &MemoryWorkspaceRepository,
        folder: Option<&str>,
        role: &str,
        write: AclDecision,
    ) {
        repo.put_folder_acl(FolderAcl {
            workspace_id: "ws_1".to_string(),
            folder_id: folder.map(String::from),
            role_id: role.to_string(),
            read: AclDecision::Allow,
            write,
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_unknown_workspace() {
        let repo = Arc::new(MemoryWorkspaceRepository::new());
        let engine = PolicyEngine::new(repo);
        let actor = actor("acct_1");
        let path = [None];
        let denial = engine
            .authorize_write(&request(&actor, &path))
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(denial.reason, DenyReason::WorkspaceNotFound);
    }

    #[tokio::test]
    async fn test_all_open_allows_anyone() {
        let repo = repo(WorkspaceMode::AllOpen).await;
        let engine = PolicyEngine::new(repo);
        let actor = actor("acct_stranger");
        let path = [None];
        assert!(engine
            .authorize_write(&request(&actor, &path))
            .await
            .unwrap()
            .is_ok());
    }

    #[tokio::test]
    async fn test_system_admin_bypasses_rbac() {
        let repo = repo(WorkspaceMode::Rbac).await;
        let engine = PolicyEngine::new(repo);
        let actor = admin();
        let path = [None];
        assert!(engine
            .authorize_write(&request(&actor, &path))
            .await
            .unwrap()
            .is_ok());
    }

    #[tokio::test]
    async fn test_rbac_without_membership_denies() {
        let repo = repo(WorkspaceMode::Rbac).await;
        let engine = PolicyEngine::new(repo);
        let actor = actor("acct_stranger");
        let path = [None];
        let denial = engine
            .authorize_write(&request(&actor, &path))
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(denial.reason, DenyReason::ForbiddenWorkspaceProjectWrite);
    }

    #[tokio::test]
    async fn test_member_without_acl_rows_allowed() {
        let repo = repo(WorkspaceMode::Rbac).await;
        join(&repo, "acct_1", "editor").await;
        let engine = PolicyEngine::new(repo);
        let actor = actor("acct_1");
        let path = [None, Some("f1".to_string())];
        assert!(engine
            .authorize_write(&request(&actor, &path))
            .await
            .unwrap()
            .is_ok());
    }

    #[tokio::test]
    async fn test_deny_wins_at_equal_depth() {
        let repo = repo(WorkspaceMode::Rbac).await;
        join(&repo, "acct_1", "editor").await;
        repo.put_member(Member {
            workspace_id: "ws_1".to_string(),
            account_id: "acct_1".to_string(),
            role_ids: vec!["editor".to_string(), "restricted".to_string()],
            joined_at: 1,
        })
        .await
        .unwrap();
        acl(&repo, Some("f1"), "editor", AclDecision::Allow).await;
        acl(&repo, Some("f1"), "restricted", AclDecision::Deny).await;

        let engine = PolicyEngine::new(repo);
        let actor = actor("acct_1");
        let path = [None, Some("f1".to_string())];
        let denial = engine
            .authorize_write(&request(&actor, &path))
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(denial.reason, DenyReason::ForbiddenFolderWrite);
        assert_eq!(denial.folder_id.as_deref(), Some("f1"));
    }

    #[tokio::test]
    async fn test_deeper_allow_overrides_shallow_deny() {
        let repo = repo(WorkspaceMode::Rbac).await;
        join(&repo, "acct_1", "editor").await;
        acl(&repo, None, "editor", AclDecision::Deny).await;
        acl(&repo, Some("f1"), "editor", AclDecision::Allow).await;

        let engine = PolicyEngine::new(repo);
        let actor = actor("acct_1");
        let path = [None, Some("f1".to_string())];
        assert!(engine
            .authorize_write(&request(&actor, &path))
            .await
            .unwrap()
            .is_ok());
    }

    #[tokio::test]
    async fn test_deeper_deny_overrides_shallow_allow() {
        let repo = repo(WorkspaceMode::Rbac).await;
        join(&repo, "acct_1", "editor").await;
        acl(&repo, None, "editor", AclDecision::Allow).await;
        acl(&repo, Some("f2"), "editor", AclDecision::Deny).await;

        let engine = PolicyEngine::new(repo);
        let actor = actor("acct_1");
        let path = [None, Some("f1".to_string()), Some("f2".to_string())];
        let denial = engine
            .authorize_write(&request(&actor, &path))
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(denial.folder_id.as_deref(), Some("f2"));
    }

    #[tokio::test]
    async fn test_read_follows_read_column() {
        let repo = repo(WorkspaceMode::Rbac).await;
        join(&repo, "acct_1", "editor").await;
        // Write denied at root, read allowed.
        acl(&repo, None, "editor", AclDecision::Deny).await;

        let engine = PolicyEngine::new(repo);
        let actor = actor("acct_1");
        let path = [None];
        assert!(engine
            .authorize_read(&request(&actor, &path))
            .await
            .unwrap()
            .is_ok());
        assert!(engine
            .authorize_write(&request(&actor, &path))
            .await
            .unwrap()
            .is_err());
    }
}
