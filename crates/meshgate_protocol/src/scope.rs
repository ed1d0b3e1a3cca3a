//! Project scoping.
//!
//! A scope addresses one mutable project instance as
//! `(tenant_id, workspace_id, project_id)`. Lock, event, and job state is
//! partitioned by this triple; the tenant dimension is a namespacing
//! constant for single-tenant deployments.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Tenant used when the payload names none.
pub const DEFAULT_TENANT_ID: &str = "default";

/// Workspace used when neither payload nor principal names one.
pub const DEFAULT_WORKSPACE_ID: &str = "ws_default";

/// Project used when the payload names neither id nor name.
pub const DEFAULT_PROJECT_ID: &str = "prj_default";

/// Composite key addressing one project instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scope {
    pub tenant_id: String,
    pub workspace_id: String,
    pub project_id: String,
}

impl Scope {
    pub fn new(
        tenant_id: impl Into<String>,
        workspace_id: impl Into<String>,
        project_id: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            workspace_id: workspace_id.into(),
            project_id: project_id.into(),
        }
    }

    /// The lock/event partition key (tenant dropped).
    pub fn project_key(&self) -> ProjectKey {
        ProjectKey {
            workspace_id: self.workspace_id.clone(),
            project_id: self.project_id.clone(),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.tenant_id, self.workspace_id, self.project_id)
    }
}

/// Partition key for locks and event streams: `(workspace_id, project_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectKey {
    pub workspace_id: String,
    pub project_id: String,
}

impl ProjectKey {
    pub fn new(workspace_id: impl Into<String>, project_id: impl Into<String>) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            project_id: project_id.into(),
        }
    }
}

impl fmt::Display for ProjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.workspace_id, self.project_id)
    }
}

/// Derive a stable project id from a human-chosen project name.
///
/// `prj_` + first 12 hex chars of sha256(name). Stable across processes so
/// agents can address a project by name before its record exists.
pub fn derive_project_id(name: &str) -> String {
    let digest = Sha256::digest(name.as_bytes());
    format!("prj_{}", &hex::encode(digest)[..12])
}
