//! Wire types shared across the Meshgate gateway.
//!
//! Everything an agent sees on the wire lives here: the JSON-RPC 2.0
//! envelope, the MCP method surface, the `ToolResponse` union returned by
//! tool calls, project scoping, and the capabilities advertisement.

pub mod capabilities;
pub mod defaults;
pub mod ids;
pub mod jsonrpc;
pub mod mcp;
pub mod principal;
pub mod scope;
pub mod tool_response;

pub use capabilities::{AuthoringCapabilities, CapabilitiesEnvelope, Limits, ToolRegistryInfo};
pub use ids::{InvalidJobId, JobId};
pub use jsonrpc::{ErrorCode, JsonRpcError, JsonRpcRequest, JsonRpcResponse, RequestId, JSONRPC_VERSION};
pub use mcp::{
    headers, methods, CallToolResult, ClientInfo, ContentBlock, InitializeParams,
    InitializeResult, ServerCapabilities, ServerInfo, ToolCallParams, ToolDefinition,
    ToolsCapability, ToolsListResult, SUPPORTED_PROTOCOL_VERSIONS,
};
pub use principal::{KeySpace, Principal};
pub use scope::{derive_project_id, ProjectKey, Scope, DEFAULT_PROJECT_ID, DEFAULT_TENANT_ID, DEFAULT_WORKSPACE_ID};
pub use tool_response::{NextAction, ToolError, ToolErrorCode, ToolResponse};
