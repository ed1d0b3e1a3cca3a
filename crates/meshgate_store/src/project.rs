//! Project record persistence.
//!
//! The repository stores one record per scope with an opaque revision tag
//! for optimistic concurrency. `save_if_revision` is the compare-and-set
//! primitive the dispatcher's revision guard rests on: `None` means create
//! only, `Some(rev)` means update only if the stored revision matches.
//!
//! Document stores guard concurrent writers with a lock sidecar rather than
//! transactions; the in-memory adapter models that. A writer polls for the
//! sidecar with a bounded timeout, overwrites an expired sidecar in place,
//! and gives up with a lock-timeout error once the budget is spent.

use async_trait::async_trait;
use meshgate_protocol::Scope;
use meshgate_state::{Clock, Sleeper};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

/// Stored project state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectRecord {
    pub scope: Scope,

    /// Opaque revision tag; changes on every successful mutation
    pub revision: String,

    /// Backend-owned state blob
    pub state: Value,

    /// Epoch ms; immutable once set
    pub created_at: u64,

    /// Epoch ms; never behind `created_at`
    pub updated_at: u64,
}

/// Repository failures.
#[derive(Debug, Error)]
pub enum RepoError {
    #[error("lock acquisition timed out for {scope}")]
    LockTimeout { scope: String },

    #[error("storage failure: {0}")]
    Io(String),
}

/// Project persistence port. Every method is a transaction boundary.
#[async_trait]
pub trait ProjectRepository: Send + Sync {
    async fn find(&self, scope: &Scope) -> Result<Option<ProjectRecord>, RepoError>;

    /// Unconditional upsert.
    async fn save(&self, record: ProjectRecord) -> Result<(), RepoError>;

    /// Compare-and-set. `expected = None` creates only (false if a record
    /// exists); `expected = Some(rev)` updates only when the stored revision
    /// equals `rev`. On success the revision, state, and `updated_at` of the
    /// stored record change; `created_at` does not.
    async fn save_if_revision(
        &self,
        record: ProjectRecord,
        expected: Option<&str>,
    ) -> Result<bool, RepoError>;

    async fn remove(&self, scope: &Scope) -> Result<(), RepoError>;
}

/// Write-lock sidecar tuning.
#[derive(Debug, Clone, Copy)]
pub struct WriteLockConfig {
    /// Give up after this long waiting for the sidecar
    pub lock_timeout_ms: u64,
    /// Poll interval while waiting
    pub lock_retry_ms: u64,
    /// Lifetime stamped on a freshly taken sidecar
    pub lock_ttl_ms: u64,
}

impl Default for WriteLockConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 5_000,
            lock_retry_ms: 25,
            lock_ttl_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone)]
struct WriteLock {
    holder: String,
    expires_at: u64,
}

/// In-memory adapter with the full CAS + sidecar contract.
pub struct MemoryProjectRepository {
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    config: WriteLockConfig,
    records: Mutex<HashMap<Scope, ProjectRecord>>,
    write_locks: Mutex<HashMap<Scope, WriteLock>>,
}

impl MemoryProjectRepository {
    pub fn new(clock: Arc<dyn Clock>, sleeper: Arc<dyn Sleeper>) -> Self {
        Self::with_config(clock, sleeper, WriteLockConfig::default())
    }

    pub fn with_config(
        clock: Arc<dyn Clock>,
        sleeper: Arc<dyn Sleeper>,
        config: WriteLockConfig,
    ) -> Self {
        Self {
            clock,
            sleeper,
            config,
            records: Mutex::new(HashMap::new()),
            write_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Install a write-lock sidecar directly. Models another writer holding
    /// the document; tests use it to exercise the timeout path.
    pub fn install_write_lock(&self, scope: &Scope, holder: impl Into<String>, expires_at: u64) {
        self.write_locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                scope.clone(),
                WriteLock {
                    holder: holder.into(),
                    expires_at,
                },
            );
    }

    /// Acquire the sidecar for `scope`, overwriting a stale one, polling up
    /// to the configured timeout. Returns the holder token to release with.
    async fn take_write_lock(&self, scope: &Scope) -> Result<String, RepoError> {
        let started = self.clock.now_ms();
        loop {
            let now = self.clock.now_ms();
            {
                let mut locks = self.write_locks.lock().unwrap_or_else(|e| e.into_inner());
                let stale_or_absent = locks
                    .get(scope)
                    .map(|lock| lock.expires_at <= now)
                    .unwrap_or(true);
                if stale_or_absent {
                    let holder = Uuid::new_v4().to_string();
                    locks.insert(
                        scope.clone(),
                        WriteLock {
                            holder: holder.clone(),
                            expires_at: now + self.config.lock_ttl_ms,
                        },
                    );
                    return Ok(holder);
                }
            }

            if now.saturating_sub(started) >= self.config.lock_timeout_ms {
                debug!("Write-lock wait exhausted for {}", scope);
                return Err(RepoError::LockTimeout {
                    scope: scope.to_string(),
                });
            }
            self.sleeper.sleep_ms(self.config.lock_retry_ms).await;
        }
    }

    fn release_write_lock(&self, scope: &Scope, holder: &str) {
        let mut locks = self.write_locks.lock().unwrap_or_else(|e| e.into_inner());
        if locks.get(scope).map(|l| l.holder == holder).unwrap_or(false) {
            locks.remove(scope);
        }
    }
}

#[async_trait]
impl ProjectRepository for MemoryProjectRepository {
    async fn find(&self, scope: &Scope) -> Result<Option<ProjectRecord>, RepoError> {
        Ok(self
            .records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(scope)
            .cloned())
    }

    async fn save(&self, mut record: ProjectRecord) -> Result<(), RepoError> {
        let scope = record.scope.clone();
        let holder = self.take_write_lock(&scope).await?;
        let now = self.clock.now_ms();
        {
            let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
            let existing_created_at = records.get(&scope).map(|r| r.created_at);
            if let Some(created_at) = existing_created_at {
                record.created_at = created_at;
            }
            record.updated_at = now.max(record.created_at);
            records.insert(scope.clone(), record);
        }
        self.release_write_lock(&scope, &holder);
        Ok(())
    }

    async fn save_if_revision(
        &self,
        mut record: ProjectRecord,
        expected: Option<&str>,
    ) -> Result<bool, RepoError> {
        let scope = record.scope.clone();
        let holder = self.take_write_lock(&scope).await?;
        let now = self.clock.now_ms();
        let saved = {
            let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
            let existing = records
                .get(&scope)
                .map(|r| (r.revision.clone(), r.created_at));
            match (existing, expected) {
                // Create-only: fails when any record exists.
                (Some(_), None) => false,
                (None, None) => {
                    record.created_at = now;
                    record.updated_at = now;
                    records.insert(scope.clone(), record);
                    true
                }
                // Update-only: fails when absent or revision mismatch.
                (None, Some(_)) => false,
                (Some((revision, created_at)), Some(expected_revision)) => {
                    if revision != expected_revision {
                        false
                    } else {
                        record.created_at = created_at;
                        record.updated_at = now.max(created_at);
                        records.insert(scope.clone(), record);
                        true
                    }
                }
            }
        };
        self.release_write_lock(&scope, &holder);
        Ok(saved)
    }

    async fn remove(&self, scope: &Scope) -> Result<(), RepoError> {
        let holder = self.take_write_lock(scope).await?;
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(scope);
        self.release_write_lock(scope, &holder);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshgate_state::{ManualClock, ManualSleeper};
    use serde_json::json;

    fn scope() -> Scope {
        Scope::new("default", "ws_1", "prj_1")
    }

    fn record(revision: &str, state: Value) -> ProjectRecord {
        ProjectRecord {
            scope: scope(),
            revision: revision.to_string(),
            state,
            created_at: 0,
            updated_at: 0,
        }
    }

    fn repo_with(config: WriteLockConfig) -> (Arc<ManualClock>, MemoryProjectRepository) {
        let clock = Arc::new(ManualClock::new(1_000));
        let sleeper = Arc::new(ManualSleeper::new(Arc::clone(&clock)));
        let repo = MemoryProjectRepository::with_config(
            clock.clone() as Arc<dyn Clock>,
            sleeper as Arc<dyn Sleeper>,
            config,
        );
        (clock, repo)
    }

    fn repo() -> (Arc<ManualClock>, MemoryProjectRepository) {
        repo_with(WriteLockConfig::default())
    }

    #[tokio::test]
    async fn test_revision_cas_round_trip() {
        let (_, repo) = repo();
        repo.save(record("rev-1", json!({"ok": true, "items": [1, 2, 3]})))
            .await
            .unwrap();

        let stale = repo
            .save_if_revision(record("rev-3", json!({"ok": true})), Some("wrong"))
            .await
            .unwrap();
        assert!(!stale);

        let applied = repo
            .save_if_revision(record("rev-3", json!({"ok": true})), Some("rev-1"))
            .await
            .unwrap();
        assert!(applied);

        let found = repo.find(&scope()).await.unwrap().unwrap();
        assert_eq!(found.revision, "rev-3");
    }

    #[tokio::test]
    async fn test_create_only_semantics() {
        let (_, repo) = repo();
        assert!(repo
            .save_if_revision(record("rev-1", json!({})), None)
            .await
            .unwrap());
        // Second create fails until the record is removed.
        assert!(!repo
            .save_if_revision(record("rev-2", json!({})), None)
            .await
            .unwrap());

        repo.remove(&scope()).await.unwrap();
        assert!(repo
            .save_if_revision(record("rev-2", json!({})), None)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_update_missing_record_fails() {
        let (_, repo) = repo();
        assert!(!repo
            .save_if_revision(record("rev-1", json!({})), Some("rev-0"))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_created_at_immutable_updated_at_advances() {
        let (clock, repo) = repo();
        repo.save_if_revision(record("rev-1", json!({})), None)
            .await
            .unwrap();
        let first = repo.find(&scope()).await.unwrap().unwrap();

        clock.advance(5_000);
        repo.save_if_revision(record("rev-2", json!({})), Some("rev-1"))
            .await
            .unwrap();
        let second = repo.find(&scope()).await.unwrap().unwrap();

        assert_eq!(second.created_at, first.created_at);
        assert!(second.updated_at > first.updated_at);
        assert!(second.updated_at >= second.created_at);
    }

    #[tokio::test]
    async fn test_active_write_lock_times_out() {
        let (_, repo) = repo_with(WriteLockConfig {
            lock_timeout_ms: 20,
            lock_retry_ms: 1,
            lock_ttl_ms: 5_000,
        });
        repo.install_write_lock(&scope(), "other-writer", 2_999);

        let err = repo
            .save_if_revision(record("rev-3", json!({})), Some("rev-1"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("lock acquisition timed out"));
    }

    #[tokio::test]
    async fn test_stale_write_lock_is_overwritten() {
        let (clock, repo) = repo();
        // Expired sidecar: a fresh writer takes over without waiting.
        repo.install_write_lock(&scope(), "dead-writer", clock.now_ms());

        assert!(repo
            .save_if_revision(record("rev-1", json!({})), None)
            .await
            .unwrap());
    }
}
