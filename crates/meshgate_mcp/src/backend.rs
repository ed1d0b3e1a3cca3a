//! Backend registry.
//!
//! A backend is whatever actually edits models: the built-in engine, a
//! Blockbench bridge, or anything else conforming to [`Backend`]. The
//! registry maps a kind string to an adapter and knows the default.
//! Registration happens at startup only; afterwards the registry is
//! read-only and shared.

use async_trait::async_trait;
use meshgate_protocol::{Principal, Scope, ToolResponse};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Per-call context handed to a backend.
#[derive(Debug, Clone)]
pub struct BackendContext {
    pub scope: Scope,
    pub principal: Principal,
    pub session_id: Option<String>,
}

/// A tool-executing backend adapter.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Kind string this adapter registers under.
    fn kind(&self) -> &str;

    /// Execute a synchronous tool call.
    async fn handle_tool(&self, name: &str, payload: &Value, ctx: &BackendContext)
        -> ToolResponse;

    /// Execute an asynchronous job previously submitted through the queue.
    async fn execute_job(&self, kind: &str, payload: &Value, scope: &Scope)
        -> Result<Value, String>;
}

/// Kind-to-adapter mapping with a configured default.
pub struct BackendRegistry {
    backends: HashMap<String, Arc<dyn Backend>>,
    default_kind: String,
}

impl BackendRegistry {
    pub fn new(default_kind: impl Into<String>) -> Self {
        Self {
            backends: HashMap::new(),
            default_kind: default_kind.into(),
        }
    }

    /// Register an adapter under a kind. Startup-only.
    pub fn register(&mut self, kind: impl Into<String>, backend: Arc<dyn Backend>) {
        self.backends.insert(kind.into(), backend);
    }

    /// Adapter for a kind, or `None`.
    pub fn resolve(&self, kind: &str) -> Option<Arc<dyn Backend>> {
        self.backends.get(kind).cloned()
    }

    /// The configured default adapter.
    pub fn default_backend(&self) -> Option<Arc<dyn Backend>> {
        self.resolve(&self.default_kind)
    }

    pub fn default_kind(&self) -> &str {
        &self.default_kind
    }

    /// Registered kinds, sorted for stable output.
    pub fn list_kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.backends.keys().cloned().collect();
        kinds.sort();
        kinds
    }
}
