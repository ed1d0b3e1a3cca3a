//! Gateway tool surface.
//!
//! The ordered tool table is the contract between the gateway and its
//! agents: names, input schemas, read/write classification, and the
//! permission each tool demands. The registry hash is a pure function of
//! the ordered `(name, inputSchema)` sequence; clients cache schemas
//! against it and re-fetch on mismatch.

pub mod resolver;

pub use resolver::{DefaultRegistryResolver, RegistryResolver};

use meshgate_protocol::ToolDefinition;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

/// Whether a tool mutates project state. Mutating tools take the project
/// lock and require write authorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolAccess {
    ReadOnly,
    Mutating,
}

/// Permission strings used by role grants.
pub mod permissions {
    pub const READ: &str = "workspace:read";
    pub const WRITE: &str = "workspace:write";
    pub const MANAGE: &str = "workspace:manage";
}

/// Static description of one tool.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: &'static str,
    pub title: &'static str,
    pub description: &'static str,
    pub access: ToolAccess,
    /// Permission a workspace member needs to see and call this tool
    pub required_permission: &'static str,
    /// Whether service keys see this tool
    pub service: bool,
    schema: fn() -> Value,
}

impl ToolSpec {
    pub fn input_schema(&self) -> Value {
        (self.schema)()
    }

    pub fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name.to_string(),
            title: Some(self.title.to_string()),
            description: Some(self.description.to_string()),
            input_schema: self.input_schema(),
        }
    }

    pub fn is_mutating(&self) -> bool {
        self.access == ToolAccess::Mutating
    }
}

fn project_selector_properties() -> Value {
    json!({
        "projectId": { "type": "string" },
        "projectName": { "type": "string" },
        "workspaceId": { "type": "string" },
        "backend": { "type": "string" },
        "folderPath": {
            "type": "array",
            "items": { "type": "string" }
        }
    })
}

fn merge_properties(base: Value, extra: Value) -> Value {
    let mut merged = base;
    if let (Some(target), Some(source)) = (merged.as_object_mut(), extra.as_object()) {
        for (key, value) in source {
            target.insert(key.clone(), value.clone());
        }
    }
    merged
}

fn object_schema(extra_properties: Value, required: &[&str]) -> Value {
    json!({
        "type": "object",
        "properties": merge_properties(project_selector_properties(), extra_properties),
        "required": required,
        "additionalProperties": false
    })
}

/// The ordered gateway tool table.
pub fn gateway_tools() -> Vec<ToolSpec> {
    vec![
        ToolSpec {
            name: "list_capabilities",
            title: "List capabilities",
            description: "Describe gateway limits, formats, and the tool registry fingerprint",
            access: ToolAccess::ReadOnly,
            required_permission: permissions::READ,
            service: true,
            schema: || json!({ "type": "object", "properties": {}, "additionalProperties": false }),
        },
        ToolSpec {
            name: "list_backends",
            title: "List backends",
            description: "Enumerate registered modeling backends and the default",
            access: ToolAccess::ReadOnly,
            required_permission: permissions::READ,
            service: true,
            schema: || json!({ "type": "object", "properties": {}, "additionalProperties": false }),
        },
        ToolSpec {
            name: "get_project_state",
            title: "Get project state",
            description: "Read a project's revision and, optionally, its full state",
            access: ToolAccess::ReadOnly,
            required_permission: permissions::READ,
            service: false,
            schema: || {
                object_schema(
                    json!({ "detail": { "type": "string", "enum": ["summary", "full"] } }),
                    &[],
                )
            },
        },
        ToolSpec {
            name: "create_project",
            title: "Create project",
            description: "Create a project with an optional initial state",
            access: ToolAccess::Mutating,
            required_permission: permissions::WRITE,
            service: false,
            schema: || object_schema(json!({ "state": { "type": "object" } }), &[]),
        },
        ToolSpec {
            name: "update_project",
            title: "Update project",
            description: "Replace project state, guarded by ifRevision",
            access: ToolAccess::Mutating,
            required_permission: permissions::WRITE,
            service: false,
            schema: || {
                object_schema(
                    json!({
                        "state": { "type": "object" },
                        "ifRevision": { "type": "string" },
                        "includeState": { "type": "boolean" },
                        "includeDiff": { "type": "boolean" }
                    }),
                    &["state"],
                )
            },
        },
        ToolSpec {
            name: "delete_project",
            title: "Delete project",
            description: "Remove a project and its stored state",
            access: ToolAccess::Mutating,
            required_permission: permissions::WRITE,
            service: false,
            schema: || object_schema(json!({}), &[]),
        },
        ToolSpec {
            name: "submit_job",
            title: "Submit job",
            description: "Queue an asynchronous backend job (export, bake, ...)",
            access: ToolAccess::Mutating,
            required_permission: permissions::WRITE,
            service: true,
            schema: || {
                object_schema(
                    json!({
                        "kind": { "type": "string" },
                        "payload": { "type": "object" },
                        "maxAttempts": { "type": "number" },
                        "leaseMs": { "type": "number" }
                    }),
                    &["kind"],
                )
            },
        },
        ToolSpec {
            name: "job_status",
            title: "Job status",
            description: "Read the current state of a submitted job",
            access: ToolAccess::ReadOnly,
            required_permission: permissions::READ,
            service: true,
            schema: || {
                json!({
                    "type": "object",
                    "properties": { "jobId": { "type": "string" } },
                    "required": ["jobId"],
                    "additionalProperties": false
                })
            },
        },
        ToolSpec {
            name: "list_jobs",
            title: "List jobs",
            description: "List jobs for a project, optionally filtered by status",
            access: ToolAccess::ReadOnly,
            required_permission: permissions::READ,
            service: true,
            schema: || {
                object_schema(
                    json!({
                        "status": {
                            "type": "string",
                            "enum": ["queued", "running", "completed", "failed"]
                        }
                    }),
                    &[],
                )
            },
        },
        ToolSpec {
            name: "workspace_read_demo",
            title: "Workspace read probe",
            description: "Read-permission probe returning the resolved workspace",
            access: ToolAccess::ReadOnly,
            required_permission: permissions::READ,
            service: false,
            schema: || object_schema(json!({}), &[]),
        },
        ToolSpec {
            name: "workspace_get_metrics",
            title: "Workspace metrics",
            description: "Operational counters for a workspace (manage only)",
            access: ToolAccess::ReadOnly,
            required_permission: permissions::MANAGE,
            service: false,
            schema: || object_schema(json!({}), &[]),
        },
    ]
}

/// Look up a tool in the full table.
pub fn find_tool(name: &str) -> Option<ToolSpec> {
    gateway_tools().into_iter().find(|tool| tool.name == name)
}

/// Deterministic fingerprint over the ordered `(name, inputSchema)` pairs.
pub fn registry_hash(tools: &[ToolSpec]) -> String {
    let mut hasher = Sha256::new();
    for tool in tools {
        hasher.update(tool.name.as_bytes());
        hasher.update([0u8]);
        // serde_json renders object keys sorted, so this is canonical.
        let schema = serde_json::to_string(&tool.input_schema()).unwrap_or_default();
        hasher.update(schema.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())[..16].to_string()
}

/// A principal's visible slice of the registry, in table order.
#[derive(Clone)]
pub struct ToolRegistryView {
    tools: Vec<ToolSpec>,
    hash: String,
}

impl ToolRegistryView {
    pub fn new(tools: Vec<ToolSpec>) -> Self {
        let hash = registry_hash(&tools);
        Self { tools, hash }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn full() -> Self {
        Self::new(gateway_tools())
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.iter().any(|tool| tool.name == name)
    }

    pub fn get(&self, name: &str) -> Option<&ToolSpec> {
        self.tools.iter().find(|tool| tool.name == name)
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(ToolSpec::definition).collect()
    }
}
