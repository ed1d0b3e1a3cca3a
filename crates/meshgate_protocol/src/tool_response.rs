//! The structured result of a dispatched tool call.
//!
//! Every backend returns a `ToolResponse`; the dispatcher enriches it with
//! state/diff/next-action metadata before the router wraps it into a
//! `CallToolResult`. Failures inside a tool call are data, not errors:
//! transport-level JSON-RPC errors are reserved for malformed envelopes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Discriminated result of a tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResponse {
    pub ok: bool,

    /// Payload on success
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    /// Error branch on failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolError>,

    /// Suggested follow-up tool calls, deduped by tool name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_actions: Option<Vec<NextAction>>,

    /// Attached project state (policy- or payload-opted)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<Value>,

    /// Attached state diff (policy- or payload-opted)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diff: Option<Value>,

    /// Project revision after the call, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
}

impl ToolResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
            next_actions: None,
            state: None,
            diff: None,
            revision: None,
        }
    }

    pub fn err(error: ToolError) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(error),
            next_actions: None,
            state: None,
            diff: None,
            revision: None,
        }
    }

    pub fn with_revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = Some(revision.into());
        self
    }

    /// Machine reason from the error details, when present.
    pub fn error_reason(&self) -> Option<&str> {
        self.error
            .as_ref()
            .and_then(|e| e.details.as_ref())
            .and_then(|d| d.get("reason"))
            .and_then(|r| r.as_str())
    }
}

/// Structured tool error.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolError {
    pub code: ToolErrorCode,

    /// Plain-English description
    pub message: String,

    /// Actionable remediation, when one exists
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fix: Option<String>,

    /// Machine-readable details; `details.reason` is the recovery code
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ToolError {
    pub fn new(code: ToolErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            fix: None,
            details: None,
        }
    }

    pub fn with_fix(mut self, fix: impl Into<String>) -> Self {
        self.fix = Some(fix.into());
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Tool error taxonomy. `Unknown` is the fallthrough and must stay rare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorCode {
    InvalidPayload,
    InvalidState,
    NotImplemented,
    IoError,
    NoChange,
    ToolExecutionFailed,
    Unknown,
}

/// A follow-up call the agent should consider next.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NextAction {
    /// Tool to call
    pub tool: String,

    /// Arguments, possibly containing `$ref(...)` placeholders resolved by
    /// the client from earlier responses
    #[serde(default)]
    pub arguments: Value,

    /// Why this action is suggested
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ok_response_shape() {
        let resp = ToolResponse::ok(serde_json::json!({"projects": []})).with_revision("rev-1");
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["ok"], true);
        assert_eq!(json["revision"], "rev-1");
        assert!(json.get("error").is_none());
    }

    #[test]
    fn test_error_codes_snake_case() {
        let err = ToolError::new(ToolErrorCode::InvalidState, "project is locked");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["code"], "invalid_state");
    }

    #[test]
    fn test_error_reason_extraction() {
        let resp = ToolResponse::err(
            ToolError::new(ToolErrorCode::InvalidState, "missing ifRevision")
                .with_details(serde_json::json!({"reason": "missing_ifRevision"})),
        );
        assert_eq!(resp.error_reason(), Some("missing_ifRevision"));
    }
}
