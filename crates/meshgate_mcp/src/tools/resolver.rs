//! Per-principal registry resolution.
//!
//! Both `tools/list` and `tools/call` re-resolve the registry, so a
//! permission change is visible on the very next request — there is no
//! session-lifetime cache to invalidate.

use async_trait::async_trait;
use meshgate_protocol::{KeySpace, Principal, DEFAULT_WORKSPACE_ID};
use meshgate_store::{WorkspaceMode, WorkspaceRepository};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

use super::{gateway_tools, permissions, ToolRegistryView, ToolSpec};

/// System role granting the full registry.
const SYSTEM_ADMIN_ROLE: &str = "system_admin";

/// Resolves the tool registry a principal may see and call.
#[async_trait]
pub trait RegistryResolver: Send + Sync {
    async fn resolve(&self, principal: &Principal) -> ToolRegistryView;
}

/// Default policy:
/// - `system_admin` sees the full registry
/// - service keys see the service-tool subset
/// - workspace members see tools whose required permission their roles
///   grant (`manage` implies `write` implies `read`); `all_open`
///   workspaces grant read+write to any member account
/// - anonymous principals see nothing
pub struct DefaultRegistryResolver {
    workspaces: Arc<dyn WorkspaceRepository>,
}

impl DefaultRegistryResolver {
    pub fn new(workspaces: Arc<dyn WorkspaceRepository>) -> Self {
        Self { workspaces }
    }

    async fn member_permissions(&self, principal: &Principal) -> HashSet<String> {
        let workspace_id = principal
            .workspace_id
            .clone()
            .unwrap_or_else(|| DEFAULT_WORKSPACE_ID.to_string());

        let mut granted: HashSet<String> = HashSet::new();

        match self.workspaces.get_workspace(&workspace_id).await {
            Ok(Some(workspace)) if workspace.mode == WorkspaceMode::AllOpen => {
                granted.insert(permissions::READ.to_string());
                granted.insert(permissions::WRITE.to_string());
            }
            Ok(_) => {}
            Err(err) => {
                debug!("Workspace lookup failed during registry resolution: {err}");
                return granted;
            }
        }

        let member = match self
            .workspaces
            .get_member(&workspace_id, &principal.account_id)
            .await
        {
            Ok(member) => member,
            Err(err) => {
                debug!("Member lookup failed during registry resolution: {err}");
                None
            }
        };
        let Some(member) = member else {
            return expand(granted);
        };

        let roles = match self.workspaces.list_roles(&workspace_id).await {
            Ok(roles) => roles,
            Err(err) => {
                debug!("Role lookup failed during registry resolution: {err}");
                Vec::new()
            }
        };
        for role in roles {
            if member.role_ids.contains(&role.role_id) {
                granted.extend(role.permissions.iter().cloned());
            }
        }

        expand(granted)
    }
}

/// `manage` implies `write`; `write` implies `read`.
fn expand(mut granted: HashSet<String>) -> HashSet<String> {
    if granted.contains(permissions::MANAGE) {
        granted.insert(permissions::WRITE.to_string());
    }
    if granted.contains(permissions::WRITE) {
        granted.insert(permissions::READ.to_string());
    }
    granted
}

#[async_trait]
impl RegistryResolver for DefaultRegistryResolver {
    async fn resolve(&self, principal: &Principal) -> ToolRegistryView {
        if principal.has_system_role(SYSTEM_ADMIN_ROLE) {
            return ToolRegistryView::full();
        }

        if principal.key_space == KeySpace::Service && !principal.is_anonymous() {
            let tools: Vec<ToolSpec> = gateway_tools()
                .into_iter()
                .filter(|tool| tool.service)
                .collect();
            return ToolRegistryView::new(tools);
        }

        if principal.is_anonymous() {
            return ToolRegistryView::empty();
        }

        let granted = self.member_permissions(principal).await;
        let tools: Vec<ToolSpec> = gateway_tools()
            .into_iter()
            .filter(|tool| granted.contains(tool.required_permission))
            .collect();
        ToolRegistryView::new(tools)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshgate_store::{Member, MemoryWorkspaceRepository, Role, Workspace};

    async fn rbac_repo() -> Arc<MemoryWorkspaceRepository> {
        let repo = Arc::new(MemoryWorkspaceRepository::new());
        repo.put_workspace(Workspace {
            workspace_id: "ws_1".to_string(),
            tenant_id: "default".to_string(),
            name: "Workspace 1".to_string(),
            mode: WorkspaceMode::Rbac,
            created_by: "acct_admin".to_string(),
            created_at: 1,
            updated_at: 1,
        })
        .await
        .unwrap();
        repo
    }

    async fn grant(repo: &MemoryWorkspaceRepository, account: &str, permission: &str) {
        repo.put_role(Role {
            workspace_id: "ws_1".to_string(),
            role_id: format!("role_{account}"),
            builtin: false,
            permissions: vec![permission.to_string()],
        })
        .await
        .unwrap();
        repo.put_member(Member {
            workspace_id: "ws_1".to_string(),
            account_id: account.to_string(),
            role_ids: vec![format!("role_{account}")],
            joined_at: 1,
        })
        .await
        .unwrap();
    }

    fn member(account: &str) -> Principal {
        Principal {
            key_space: KeySpace::Workspace,
            key_id: format!("key-{account}"),
            account_id: account.to_string(),
            workspace_id: Some("ws_1".to_string()),
            system_roles: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_admin_gets_full_registry() {
        let resolver = DefaultRegistryResolver::new(rbac_repo().await);
        let admin = Principal {
            system_roles: vec![SYSTEM_ADMIN_ROLE.to_string()],
            ..member("acct_admin")
        };
        let view = resolver.resolve(&admin).await;
        assert_eq!(view.len(), gateway_tools().len());
    }

    #[tokio::test]
    async fn test_anonymous_gets_nothing() {
        let resolver = DefaultRegistryResolver::new(rbac_repo().await);
        let view = resolver.resolve(&Principal::anonymous()).await;
        assert!(view.is_empty());
    }

    #[tokio::test]
    async fn test_service_key_gets_service_subset() {
        let resolver = DefaultRegistryResolver::new(rbac_repo().await);
        let service = Principal {
            key_space: KeySpace::Service,
            ..member("acct_svc")
        };
        let view = resolver.resolve(&service).await;
        assert!(view.contains("submit_job"));
        assert!(view.contains("job_status"));
        assert!(!view.contains("update_project"));
        assert!(!view.contains("workspace_get_metrics"));
    }

    #[tokio::test]
    async fn test_manage_sees_metrics_read_does_not() {
        let repo = rbac_repo().await;
        grant(&repo, "acct_mgr", permissions::MANAGE).await;
        grant(&repo, "acct_reader", permissions::READ).await;
        let resolver = DefaultRegistryResolver::new(repo);

        let manager_view = resolver.resolve(&member("acct_mgr")).await;
        assert!(manager_view.contains("workspace_get_metrics"));
        assert!(manager_view.contains("update_project"));
        assert!(manager_view.contains("workspace_read_demo"));

        let reader_view = resolver.resolve(&member("acct_reader")).await;
        assert!(!reader_view.contains("workspace_get_metrics"));
        assert!(!reader_view.contains("update_project"));
        assert!(reader_view.contains("workspace_read_demo"));
    }

    #[tokio::test]
    async fn test_demotion_is_visible_on_next_resolve() {
        let repo = rbac_repo().await;
        grant(&repo, "acct_a", permissions::MANAGE).await;
        let resolver = DefaultRegistryResolver::new(repo.clone());

        assert!(resolver
            .resolve(&member("acct_a"))
            .await
            .contains("workspace_get_metrics"));

        // Hot demotion: replace the role's grants.
        repo.put_role(Role {
            workspace_id: "ws_1".to_string(),
            role_id: "role_acct_a".to_string(),
            builtin: false,
            permissions: vec![permissions::READ.to_string()],
        })
        .await
        .unwrap();

        let view = resolver.resolve(&member("acct_a")).await;
        assert!(!view.contains("workspace_get_metrics"));
        assert!(view.contains("workspace_read_demo"));
    }

    #[tokio::test]
    async fn test_all_open_member_gets_read_write() {
        let repo = Arc::new(MemoryWorkspaceRepository::new());
        repo.put_workspace(Workspace {
            workspace_id: "ws_1".to_string(),
            tenant_id: "default".to_string(),
            name: "Open".to_string(),
            mode: WorkspaceMode::AllOpen,
            created_by: "acct_admin".to_string(),
            created_at: 1,
            updated_at: 1,
        })
        .await
        .unwrap();
        let resolver = DefaultRegistryResolver::new(repo);

        let view = resolver.resolve(&member("acct_any")).await;
        assert!(view.contains("update_project"));
        assert!(!view.contains("workspace_get_metrics"));
    }
}
