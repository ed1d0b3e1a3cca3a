//! Meshgate MCP gateway.
//!
//! Agents speak JSON-RPC 2.0 over HTTP (with SSE streaming) to the router;
//! the dispatcher serializes mutations per project, enforces workspace
//! authorization, guards revisions, and forwards tool calls to registered
//! modeling backends. A job queue carries the asynchronous work the worker
//! plane drains.
//!
//! # Architecture
//!
//! ```text
//! POST /mcp ──▶ HttpServer ──▶ Router ──▶ Dispatcher ──▶ Backend
//!                 │              │            │
//!                 │              │            ├─ LockManager (per-project)
//!                 │              │            ├─ PolicyEngine (ACLs)
//!                 │              │            └─ JobQueue ──▶ Worker
//!                 │              └─ SessionStore / RegistryResolver
//!                 └─ GET /mcp (SSE) ◀── SseBroker ◀── EventLog
//! ```

pub mod backend;
pub mod dispatch;
pub mod engine;
pub mod http;
pub mod resources;
pub mod router;
pub mod server;
pub mod sse;
pub mod tools;

pub use backend::{Backend, BackendContext, BackendRegistry};
pub use dispatch::{
    DispatchContext, DispatchPolicy, Dispatcher, TraceRecorder, ViewportNotifier,
};
pub use engine::EngineBackend;
pub use http::{HttpConfig, HttpServer};
pub use resources::{MemoryResourceStore, ResourceStore};
pub use router::{JsonReply, Router, RouterConfig};
pub use server::{Gateway, GatewayConfig};
pub use sse::{SseBroker, SseConnection};
pub use tools::{
    gateway_tools, registry_hash, DefaultRegistryResolver, RegistryResolver, ToolAccess,
    ToolRegistryView, ToolSpec,
};
