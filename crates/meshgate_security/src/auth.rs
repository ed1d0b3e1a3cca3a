//! Request authentication port.

use async_trait::async_trait;
use meshgate_protocol::{KeySpace, Principal};
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;
use tracing::debug;

/// Authentication failure: credentials were presented and rejected.
/// Absent credentials are not an error; they resolve to an anonymous
/// principal.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid credentials")]
    InvalidCredentials,
}

/// Header-driven authenticator port. Header names arrive lowercased.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(
        &self,
        headers: &HashMap<String, String>,
    ) -> Result<Principal, AuthError>;
}

/// Key-table authenticator for single-process deployments and tests.
/// Looks for `Authorization: Bearer <key>` or `X-Api-Key: <key>`.
#[derive(Default)]
pub struct StaticKeyAuthenticator {
    keys: Mutex<HashMap<String, Principal>>,
}

impl StaticKeyAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a key for a principal.
    pub fn register(&self, key: impl Into<String>, principal: Principal) {
        self.keys
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.into(), principal);
    }

    /// Convenience: a workspace-scoped agent key.
    pub fn register_workspace_key(
        &self,
        key: impl Into<String>,
        account_id: impl Into<String>,
        workspace_id: impl Into<String>,
    ) {
        let key = key.into();
        self.register(
            key.clone(),
            Principal {
                key_space: KeySpace::Workspace,
                key_id: key,
                account_id: account_id.into(),
                workspace_id: Some(workspace_id.into()),
                system_roles: Vec::new(),
            },
        );
    }

    fn presented_key(headers: &HashMap<String, String>) -> Option<String> {
        if let Some(auth) = headers.get("authorization") {
            if let Some(token) = auth.strip_prefix("Bearer ").or_else(|| auth.strip_prefix("bearer "))
            {
                return Some(token.trim().to_string());
            }
        }
        headers.get("x-api-key").map(|k| k.trim().to_string())
    }
}

#[async_trait]
impl Authenticator for StaticKeyAuthenticator {
    async fn authenticate(
        &self,
        headers: &HashMap<String, String>,
    ) -> Result<Principal, AuthError> {
        let Some(key) = Self::presented_key(headers) else {
            debug!("No credentials presented, resolving anonymous principal");
            return Ok(Principal::anonymous());
        };

        self.keys
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key)
            .cloned()
            .ok_or(AuthError::InvalidCredentials)
    }
}
