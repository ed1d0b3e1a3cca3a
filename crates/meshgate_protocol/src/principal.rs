//! The authenticated identity attached to a session.

use serde::{Deserialize, Serialize};

/// Which credential namespace a key came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeySpace {
    /// Machine-to-machine service key
    Service,
    /// Workspace-scoped agent key
    Workspace,
}

/// Authentication outcome for a request. Anonymous requests get a principal
/// too; what an anonymous principal may do is the registry resolver's call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Principal {
    pub key_space: KeySpace,

    /// Identifier of the presented key; empty for anonymous
    pub key_id: String,

    /// Account the key belongs to; empty for anonymous
    pub account_id: String,

    /// Workspace binding for workspace keys
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<String>,

    /// System-wide roles (e.g. `system_admin`)
    #[serde(default)]
    pub system_roles: Vec<String>,
}

impl Principal {
    /// Principal for a request that presented no credentials.
    pub fn anonymous() -> Self {
        Self {
            key_space: KeySpace::Workspace,
            key_id: String::new(),
            account_id: String::new(),
            workspace_id: None,
            system_roles: Vec::new(),
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.key_id.is_empty()
    }

    pub fn has_system_role(&self, role: &str) -> bool {
        self.system_roles.iter().any(|r| r == role)
    }
}
