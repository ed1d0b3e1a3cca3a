//! Conservative JSON-Schema subset validation.
//!
//! Tool input schemas stay inside a deliberately small subset: `type`
//! (object/array/string/number/boolean), `enum`, `required`, `properties`,
//! `additionalProperties: false`, `items`, `minItems`, `maxItems`, `anyOf`.
//! Validation stops at the first violation and reports it with a dotted
//! path, a machine reason, and enough detail to repair the payload.
//!
//! Check ordering is part of the contract: objects check `required`, then
//! recurse per property, then reject unknown keys; arrays check `minItems`,
//! then `maxItems`, then recurse per element.

mod validator;

pub use validator::validate;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Why a value failed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ViolationReason {
    Type,
    Enum,
    AnyOf,
    MinItems,
    MaxItems,
    Required,
    AdditionalProperties,
}

impl fmt::Display for ViolationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Type => "type",
            Self::Enum => "enum",
            Self::AnyOf => "anyOf",
            Self::MinItems => "minItems",
            Self::MaxItems => "maxItems",
            Self::Required => "required",
            Self::AdditionalProperties => "additionalProperties",
        };
        f.write_str(s)
    }
}

/// A single structured validation failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaViolation {
    /// Dotted path with `[idx]` segments, e.g. `elements[2].size`
    pub path: String,

    /// Machine reason
    pub reason: ViolationReason,

    /// Human message, e.g. `"elements[2].size must be number"`
    pub message: String,

    /// Expected / actual / candidates, depending on the reason
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl SchemaViolation {
    pub(crate) fn new(
        path: &str,
        reason: ViolationReason,
        message: impl Into<String>,
        details: Option<Value>,
    ) -> Self {
        Self {
            path: path.to_string(),
            reason,
            message: message.into(),
            details,
        }
    }
}

impl fmt::Display for SchemaViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for SchemaViolation {}
