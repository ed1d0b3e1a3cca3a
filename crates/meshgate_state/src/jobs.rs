//! Asynchronous job queue.
//!
//! State machine: `queued → running → completed | queued (retry) | failed
//! (dead letter)`. Claims carry a lease; a running job whose lease expires
//! is reclaimed to `queued` with its attempt count retained, so another
//! worker can pick it up.
//!
//! Retry backoff is exponential with base `lease_ms / 2`, doubling per
//! attempt, capped at five minutes.

use meshgate_protocol::defaults::{clamp_lease_ms, clamp_max_attempts, MAX_RETRY_BACKOFF_MS};
use meshgate_protocol::{JobId, ProjectKey};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::events::{EventKind, EventLog};

/// Job lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// A queued backend job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub workspace_id: String,
    pub project_id: String,

    /// Backend job kind (opaque to the queue)
    pub kind: String,

    /// Backend payload (opaque to the queue)
    pub payload: Value,

    pub status: JobStatus,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub lease_ms: u64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease_expires_at: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub dead_letter: bool,

    pub submitted_at: u64,
    pub updated_at: u64,
}

impl Job {
    pub fn project_key(&self) -> ProjectKey {
        ProjectKey::new(self.workspace_id.clone(), self.project_id.clone())
    }
}

/// Submission input; unset clamps take defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitJobInput {
    pub workspace_id: String,
    pub project_id: String,
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub lease_ms: Option<u64>,
}

/// Queue operation failures.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("job {id} is {status}, cannot {action}")]
    InvalidTransition {
        id: JobId,
        status: &'static str,
        action: &'static str,
    },

    #[error("job {id} lease is not held by worker {worker_id}")]
    LeaseNotHeld { id: JobId, worker_id: String },
}

/// In-process job table with lease-based claiming.
pub struct JobQueue {
    clock: Arc<dyn Clock>,
    events: Arc<EventLog>,
    jobs: Mutex<HashMap<JobId, Job>>,
}

impl JobQueue {
    pub fn new(clock: Arc<dyn Clock>, events: Arc<EventLog>) -> Self {
        Self {
            clock,
            events,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    /// Validate, clamp, enqueue, and announce a job.
    pub fn submit(&self, input: SubmitJobInput) -> Job {
        let now = self.clock.now_ms();
        let job = Job {
            id: JobId::new(),
            workspace_id: input.workspace_id,
            project_id: input.project_id,
            kind: input.kind,
            payload: input.payload,
            status: JobStatus::Queued,
            attempt_count: 0,
            max_attempts: clamp_max_attempts(input.max_attempts),
            lease_ms: clamp_lease_ms(input.lease_ms),
            lease_expires_at: None,
            next_retry_at: None,
            worker_id: None,
            error: None,
            result: None,
            dead_letter: false,
            submitted_at: now,
            updated_at: now,
        };

        let key = job.project_key();
        self.events.append(
            &key,
            EventKind::JobSubmitted,
            json!({
                "jobId": job.id,
                "kind": job.kind,
                "maxAttempts": job.max_attempts,
                "leaseMs": job.lease_ms,
            }),
        );
        self.events.ensure_snapshot(&key);

        info!("Submitted job {} ({}) for {}", job.id, job.kind, key);
        self.jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(job.id.clone(), job.clone());
        job
    }

    /// Claim the next eligible job for `worker_id`.
    ///
    /// Expired leases are reclaimed first (running back to queued, attempt
    /// count retained). Eligible queued jobs are taken fairly by submit
    /// time, tie-broken by id.
    pub fn claim_next(&self, worker_id: &str) -> Option<Job> {
        let now = self.clock.now_ms();
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());

        for job in jobs.values_mut() {
            if job.status == JobStatus::Running
                && job.lease_expires_at.map(|at| at <= now).unwrap_or(true)
            {
                warn!(
                    "Reclaiming job {} from worker {:?} (lease expired)",
                    job.id, job.worker_id
                );
                job.status = JobStatus::Queued;
                job.worker_id = None;
                job.lease_expires_at = None;
                job.updated_at = now;
            }
        }

        let mut eligible: Vec<&Job> = jobs
            .values()
            .filter(|job| {
                job.status == JobStatus::Queued
                    && job.next_retry_at.map(|at| at <= now).unwrap_or(true)
            })
            .collect();
        eligible.sort_by(|a, b| {
            a.submitted_at
                .cmp(&b.submitted_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        let id = eligible.first().map(|job| job.id.clone())?;

        let job = jobs.get_mut(&id)?;
        job.status = JobStatus::Running;
        job.worker_id = Some(worker_id.to_string());
        job.attempt_count += 1;
        job.lease_expires_at = Some(now + job.lease_ms);
        job.next_retry_at = None;
        job.updated_at = now;
        let claimed = job.clone();
        drop(jobs);

        self.events.append(
            &claimed.project_key(),
            EventKind::JobClaimed,
            json!({
                "jobId": claimed.id,
                "workerId": worker_id,
                "attempt": claimed.attempt_count,
                "leaseExpiresAt": claimed.lease_expires_at,
            }),
        );
        debug!(
            "Claimed job {} for worker {} (attempt {})",
            claimed.id, worker_id, claimed.attempt_count
        );
        Some(claimed)
    }

    /// Extend the lease of a running job. Fails when the job is no longer
    /// running under `worker_id`; the caller must then abandon the job.
    pub fn renew_lease(&self, id: &JobId, worker_id: &str) -> Result<u64, QueueError> {
        let now = self.clock.now_ms();
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| QueueError::NotFound(id.clone()))?;

        let held = job.status == JobStatus::Running
            && job.worker_id.as_deref() == Some(worker_id)
            && job.lease_expires_at.map(|at| at > now).unwrap_or(false);
        if !held {
            return Err(QueueError::LeaseNotHeld {
                id: id.clone(),
                worker_id: worker_id.to_string(),
            });
        }

        let expires = now + job.lease_ms;
        job.lease_expires_at = Some(expires);
        job.updated_at = now;
        Ok(expires)
    }

    /// Mark a running job completed.
    pub fn complete(&self, id: &JobId, result: Option<Value>) -> Result<Job, QueueError> {
        let now = self.clock.now_ms();
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| QueueError::NotFound(id.clone()))?;

        if job.status != JobStatus::Running {
            return Err(QueueError::InvalidTransition {
                id: id.clone(),
                status: job.status.as_str(),
                action: "complete",
            });
        }

        job.status = JobStatus::Completed;
        job.result = result;
        job.lease_expires_at = None;
        job.updated_at = now;
        let done = job.clone();
        drop(jobs);

        self.events.append(
            &done.project_key(),
            EventKind::JobCompleted,
            json!({ "jobId": done.id, "result": done.result }),
        );
        info!("Completed job {}", done.id);
        Ok(done)
    }

    /// Mark a running job failed. Retries until the attempt budget is
    /// exhausted, then dead-letters.
    pub fn fail(&self, id: &JobId, error: impl Into<String>) -> Result<Job, QueueError> {
        let error = error.into();
        let now = self.clock.now_ms();
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| QueueError::NotFound(id.clone()))?;

        if job.status != JobStatus::Running {
            return Err(QueueError::InvalidTransition {
                id: id.clone(),
                status: job.status.as_str(),
                action: "fail",
            });
        }

        job.error = Some(error.clone());
        job.worker_id = None;
        job.lease_expires_at = None;
        job.updated_at = now;

        let failed = if job.attempt_count < job.max_attempts {
            let delay = retry_backoff_ms(job.attempt_count, job.lease_ms);
            job.status = JobStatus::Queued;
            job.next_retry_at = Some(now + delay);
            let failed = job.clone();
            drop(jobs);

            self.events.append(
                &failed.project_key(),
                EventKind::JobFailed,
                json!({
                    "jobId": failed.id,
                    "error": error,
                    "attempt": failed.attempt_count,
                    "maxAttempts": failed.max_attempts,
                    "nextRetryAt": failed.next_retry_at,
                }),
            );
            warn!(
                "Job {} failed (attempt {}/{}), retrying: {}",
                failed.id, failed.attempt_count, failed.max_attempts, error
            );
            failed
        } else {
            job.status = JobStatus::Failed;
            job.dead_letter = true;
            let failed = job.clone();
            drop(jobs);

            self.events.append(
                &failed.project_key(),
                EventKind::JobDeadLetter,
                json!({
                    "jobId": failed.id,
                    "error": error,
                    "attempt": failed.attempt_count,
                }),
            );
            warn!("Job {} dead-lettered: {}", failed.id, error);
            failed
        };

        Ok(failed)
    }

    /// Get a job by id.
    pub fn get(&self, id: &JobId) -> Option<Job> {
        self.jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    /// List jobs, optionally filtered by project and status, newest first.
    pub fn list(&self, key: Option<&ProjectKey>, status: Option<JobStatus>) -> Vec<Job> {
        let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<Job> = jobs
            .values()
            .filter(|job| key.map(|k| &job.project_key() == k).unwrap_or(true))
            .filter(|job| status.map(|s| job.status == s).unwrap_or(true))
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            b.submitted_at
                .cmp(&a.submitted_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        out
    }
}

/// Exponential backoff: `lease_ms/2 × 2^(attempt-1)`, capped.
fn retry_backoff_ms(attempt: u32, lease_ms: u64) -> u64 {
    let base = lease_ms / 2;
    let factor = 1u64 << attempt.saturating_sub(1).min(16);
    base.saturating_mul(factor).min(MAX_RETRY_BACKOFF_MS)
}
