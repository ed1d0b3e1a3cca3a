//! Job identifiers.
//!
//! Jobs are the only gateway entity addressed by a server-generated UUID;
//! sessions use unguessable hex tokens minted by the session store, and
//! project/workspace ids are caller-supplied strings scoped by [`crate::Scope`].

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// UUID-backed job id, kept as its canonical string form on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Mint a fresh id.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Accept a caller-supplied id, rejecting anything that is not a UUID.
    pub fn parse(value: &str) -> Result<Self, InvalidJobId> {
        Uuid::parse_str(value).map_err(|_| InvalidJobId(value.to_string()))?;
        Ok(Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = InvalidJobId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// A job id that failed to parse as a UUID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidJobId(String);

impl fmt::Display for InvalidJobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid job id: {}", self.0)
    }
}

impl std::error::Error for InvalidJobId {}
