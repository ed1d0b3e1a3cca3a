//! Workspace membership and ACL persistence.
//!
//! A workspace owns its roles, members, and folder ACL rows; deleting a
//! workspace cascades. Accounts with no rows anywhere still see one default
//! `all_open` workspace so a fresh deployment is usable without setup.

use async_trait::async_trait;
use meshgate_protocol::DEFAULT_WORKSPACE_ID;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::project::RepoError;

/// Authorization mode of a workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceMode {
    /// Every account may read and write
    AllOpen,
    /// Role-based access control via members + folder ACLs
    Rbac,
}

/// A tenant-scoped container of projects.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workspace {
    pub workspace_id: String,
    pub tenant_id: String,
    pub name: String,
    pub mode: WorkspaceMode,
    pub created_by: String,
    pub created_at: u64,
    pub updated_at: u64,
}

/// A named permission bundle inside a workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Role {
    pub workspace_id: String,
    pub role_id: String,
    #[serde(default)]
    pub builtin: bool,
    /// Permission strings, e.g. `workspace:read`, `workspace:write`,
    /// `workspace:manage`
    pub permissions: Vec<String>,
}

/// Account membership in a workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    pub workspace_id: String,
    pub account_id: String,
    pub role_ids: Vec<String>,
    pub joined_at: u64,
}

/// Allow/deny decision on an ACL row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AclDecision {
    Allow,
    Deny,
}

/// Folder-level ACL row. `folder_id = None` is the workspace root.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderAcl {
    pub workspace_id: String,
    pub folder_id: Option<String>,
    pub role_id: String,
    pub read: AclDecision,
    pub write: AclDecision,
}

/// Workspace persistence port.
#[async_trait]
pub trait WorkspaceRepository: Send + Sync {
    async fn get_workspace(&self, workspace_id: &str) -> Result<Option<Workspace>, RepoError>;

    async fn put_workspace(&self, workspace: Workspace) -> Result<(), RepoError>;

    /// Cascades roles, members, and ACL rows.
    async fn delete_workspace(&self, workspace_id: &str) -> Result<(), RepoError>;

    async fn put_role(&self, role: Role) -> Result<(), RepoError>;

    async fn list_roles(&self, workspace_id: &str) -> Result<Vec<Role>, RepoError>;

    async fn put_member(&self, member: Member) -> Result<(), RepoError>;

    async fn get_member(
        &self,
        workspace_id: &str,
        account_id: &str,
    ) -> Result<Option<Member>, RepoError>;

    async fn put_folder_acl(&self, acl: FolderAcl) -> Result<(), RepoError>;

    async fn list_folder_acls(&self, workspace_id: &str) -> Result<Vec<FolderAcl>, RepoError>;

    /// Workspaces visible to an account. Never empty: accounts with no
    /// memberships see the default `all_open` workspace.
    async fn list_workspaces_by_account(
        &self,
        account_id: &str,
    ) -> Result<Vec<Workspace>, RepoError>;
}

/// In-memory adapter.
#[derive(Default)]
pub struct MemoryWorkspaceRepository {
    inner: Mutex<Tables>,
}

#[derive(Default)]
struct Tables {
    workspaces: HashMap<String, Workspace>,
    roles: HashMap<String, Vec<Role>>,
    members: HashMap<String, Vec<Member>>,
    acls: HashMap<String, Vec<FolderAcl>>,
}

impl MemoryWorkspaceRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn default_workspace() -> Workspace {
        Workspace {
            workspace_id: DEFAULT_WORKSPACE_ID.to_string(),
            tenant_id: "default".to_string(),
            name: "Default Workspace".to_string(),
            mode: WorkspaceMode::AllOpen,
            created_by: "system".to_string(),
            created_at: 0,
            updated_at: 0,
        }
    }
}

#[async_trait]
impl WorkspaceRepository for MemoryWorkspaceRepository {
    async fn get_workspace(&self, workspace_id: &str) -> Result<Option<Workspace>, RepoError> {
        let tables = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Ok(tables.workspaces.get(workspace_id).cloned())
    }

    async fn put_workspace(&self, workspace: Workspace) -> Result<(), RepoError> {
        let mut tables = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        tables
            .workspaces
            .insert(workspace.workspace_id.clone(), workspace);
        Ok(())
    }

    async fn delete_workspace(&self, workspace_id: &str) -> Result<(), RepoError> {
        let mut tables = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        tables.workspaces.remove(workspace_id);
        tables.roles.remove(workspace_id);
        tables.members.remove(workspace_id);
        tables.acls.remove(workspace_id);
        Ok(())
    }

    async fn put_role(&self, role: Role) -> Result<(), RepoError> {
        let mut tables = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let roles = tables.roles.entry(role.workspace_id.clone()).or_default();
        roles.retain(|r| r.role_id != role.role_id);
        roles.push(role);
        Ok(())
    }

    async fn list_roles(&self, workspace_id: &str) -> Result<Vec<Role>, RepoError> {
        let tables = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Ok(tables.roles.get(workspace_id).cloned().unwrap_or_default())
    }

    async fn put_member(&self, member: Member) -> Result<(), RepoError> {
        let mut tables = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let members = tables
            .members
            .entry(member.workspace_id.clone())
            .or_default();
        members.retain(|m| m.account_id != member.account_id);
        members.push(member);
        Ok(())
    }

    async fn get_member(
        &self,
        workspace_id: &str,
        account_id: &str,
    ) -> Result<Option<Member>, RepoError> {
        let tables = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Ok(tables
            .members
            .get(workspace_id)
            .and_then(|members| members.iter().find(|m| m.account_id == account_id))
            .cloned())
    }

    async fn put_folder_acl(&self, acl: FolderAcl) -> Result<(), RepoError> {
        let mut tables = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let acls = tables.acls.entry(acl.workspace_id.clone()).or_default();
        acls.retain(|row| !(row.folder_id == acl.folder_id && row.role_id == acl.role_id));
        acls.push(acl);
        Ok(())
    }

    async fn list_folder_acls(&self, workspace_id: &str) -> Result<Vec<FolderAcl>, RepoError> {
        let tables = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Ok(tables.acls.get(workspace_id).cloned().unwrap_or_default())
    }

    async fn list_workspaces_by_account(
        &self,
        account_id: &str,
    ) -> Result<Vec<Workspace>, RepoError> {
        let mut tables = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut visible: Vec<Workspace> = tables
            .members
            .values()
            .flatten()
            .filter(|m| m.account_id == account_id)
            .filter_map(|m| tables.workspaces.get(&m.workspace_id))
            .cloned()
            .collect();

        if visible.is_empty() {
            let seed = tables
                .workspaces
                .entry(DEFAULT_WORKSPACE_ID.to_string())
                .or_insert_with(Self::default_workspace)
                .clone();
            visible.push(seed);
        }
        Ok(visible)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workspace(id: &str, mode: WorkspaceMode) -> Workspace {
        Workspace {
            workspace_id: id.to_string(),
            tenant_id: "default".to_string(),
            name: id.to_string(),
            mode,
            created_by: "acct_admin".to_string(),
            created_at: 1,
            updated_at: 1,
        }
    }

    #[tokio::test]
    async fn test_account_with_no_rows_sees_default_seed() {
        let repo = MemoryWorkspaceRepository::new();
        let visible = repo.list_workspaces_by_account("acct_new").await.unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].workspace_id, DEFAULT_WORKSPACE_ID);
        assert_eq!(visible[0].mode, WorkspaceMode::AllOpen);
    }

    #[tokio::test]
    async fn test_membership_drives_visibility() {
        let repo = MemoryWorkspaceRepository::new();
        repo.put_workspace(workspace("ws_a", WorkspaceMode::Rbac))
            .await
            .unwrap();
        repo.put_member(Member {
            workspace_id: "ws_a".to_string(),
            account_id: "acct_1".to_string(),
            role_ids: vec!["editor".to_string()],
            joined_at: 1,
        })
        .await
        .unwrap();

        let visible = repo.list_workspaces_by_account("acct_1").await.unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].workspace_id, "ws_a");
    }

    #[tokio::test]
    async fn test_delete_cascades() {
        let repo = MemoryWorkspaceRepository::new();
        repo.put_workspace(workspace("ws_a", WorkspaceMode::Rbac))
            .await
            .unwrap();
        repo.put_role(Role {
            workspace_id: "ws_a".to_string(),
            role_id: "editor".to_string(),
            builtin: false,
            permissions: vec!["workspace:write".to_string()],
        })
        .await
        .unwrap();
        repo.put_folder_acl(FolderAcl {
            workspace_id: "ws_a".to_string(),
            folder_id: None,
            role_id: "editor".to_string(),
            read: AclDecision::Allow,
            write: AclDecision::Allow,
        })
        .await
        .unwrap();

        repo.delete_workspace("ws_a").await.unwrap();
        assert!(repo.get_workspace("ws_a").await.unwrap().is_none());
        assert!(repo.list_roles("ws_a").await.unwrap().is_empty());
        assert!(repo.list_folder_acls("ws_a").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_put_role_replaces() {
        let repo = MemoryWorkspaceRepository::new();
        for permissions in [vec!["workspace:read"], vec!["workspace:write"]] {
            repo.put_role(Role {
                workspace_id: "ws_a".to_string(),
                role_id: "editor".to_string(),
                builtin: false,
                permissions: permissions.into_iter().map(String::from).collect(),
            })
            .await
            .unwrap();
        }
        let roles = repo.list_roles("ws_a").await.unwrap();
        assert_eq!(roles.len(), 1);
        assert_eq!(roles[0].permissions, vec!["workspace:write"]);
    }
}
