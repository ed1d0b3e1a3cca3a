//! Job worker.
//!
//! Claim-next, execute, complete-or-fail, with a heartbeat task renewing
//! the lease while the job runs. Losing the lease (another worker may
//! already be running the job) aborts execution locally without touching
//! the job record.
//!
//! The worker is colocated with the gateway by default but only touches the
//! queue, so a remote deployment just needs a queue handle.

use async_trait::async_trait;
use meshgate_state::{Job, JobQueue};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Executes claimed jobs. The gateway wires this to the backend registry.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, job: &Job) -> Result<Value, String>;
}

/// Worker tuning.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    /// Sleep between empty claim attempts
    pub idle_backoff_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", &Uuid::new_v4().simple().to_string()[..8]),
            idle_backoff_ms: 500,
        }
    }
}

/// The worker loop.
pub struct Worker {
    config: WorkerConfig,
    queue: Arc<JobQueue>,
    executor: Arc<dyn JobExecutor>,
}

impl Worker {
    pub fn new(config: WorkerConfig, queue: Arc<JobQueue>, executor: Arc<dyn JobExecutor>) -> Self {
        Self {
            config,
            queue,
            executor,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Run until `shutdown` flips. Jobs in flight finish their current
    /// execution before the loop exits.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("Worker {} entering claim loop", self.config.worker_id);

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.queue.claim_next(&self.config.worker_id) {
                Some(job) => self.process(job).await,
                None => {
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(self.config.idle_backoff_ms)) => {}
                        _ = shutdown.changed() => break,
                    }
                }
            }
        }

        info!("Worker {} stopped", self.config.worker_id);
    }

    /// Execute one claimed job under a heartbeat.
    async fn process(&self, job: Job) {
        debug!(
            "Worker {} executing job {} ({}, attempt {})",
            self.config.worker_id, job.id, job.kind, job.attempt_count
        );

        let (stop_tx, stop_rx) = watch::channel(false);
        let (lost_tx, mut lost_rx) = watch::channel(false);
        let heartbeat = tokio::spawn(heartbeat_loop(
            self.queue.clone(),
            job.clone(),
            self.config.worker_id.clone(),
            stop_rx,
            lost_tx,
        ));

        let outcome = tokio::select! {
            result = self.executor.execute(&job) => Some(result),
            _ = lost_rx.changed() => None,
        };

        let _ = stop_tx.send(true);
        let _ = heartbeat.await;

        match outcome {
            None => {
                // Lease lost mid-flight; the queue will hand the job to
                // someone else. Touching it now would race the new holder.
                warn!(
                    "Worker {} abandoned job {} after losing its lease",
                    self.config.worker_id, job.id
                );
            }
            Some(Ok(value)) => {
                if let Err(err) = self.queue.complete(&job.id, Some(value)) {
                    warn!("Worker {} could not complete job {}: {}", self.config.worker_id, job.id, err);
                }
            }
            Some(Err(message)) => {
                error!(
                    "Worker {} job {} failed: {}",
                    self.config.worker_id, job.id, message
                );
                if let Err(err) = self.queue.fail(&job.id, message) {
                    warn!("Worker {} could not fail job {}: {}", self.config.worker_id, job.id, err);
                }
            }
        }
    }
}

/// Renew the lease at a quarter of its duration until stopped. Signals
/// `lost` on renewal failure so the worker aborts locally.
async fn heartbeat_loop(
    queue: Arc<JobQueue>,
    job: Job,
    worker_id: String,
    mut stop: watch::Receiver<bool>,
    lost: watch::Sender<bool>,
) {
    let period = Duration::from_millis((job.lease_ms / 4).max(500));
    loop {
        tokio::select! {
            _ = tokio::time::sleep(period) => {}
            _ = stop.changed() => return,
        }
        if *stop.borrow() {
            return;
        }

        match queue.renew_lease(&job.id, &worker_id) {
            Ok(expires) => debug!("Heartbeat renewed job {} lease to {}", job.id, expires),
            Err(err) => {
                warn!("Heartbeat lost job {}: {}", job.id, err);
                let _ = lost.send(true);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshgate_state::{Clock, EventLog, JobStatus, SubmitJobInput, SystemClock};
    use serde_json::json;

    struct EchoExecutor;

    #[async_trait]
    impl JobExecutor for EchoExecutor {
        async fn execute(&self, job: &Job) -> Result<Value, String> {
            match job.kind.as_str() {
                "echo" => Ok(job.payload.clone()),
                other => Err(format!("unsupported job kind: {other}")),
            }
        }
    }

    fn queue() -> Arc<JobQueue> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let events = Arc::new(EventLog::new(clock.clone()));
        Arc::new(JobQueue::new(clock, events))
    }

    fn submit(queue: &JobQueue, kind: &str) -> Job {
        queue.submit(SubmitJobInput {
            workspace_id: "ws_1".to_string(),
            project_id: "prj_1".to_string(),
            kind: kind.to_string(),
            payload: json!({"value": 42}),
            max_attempts: Some(1),
            lease_ms: None,
        })
    }

    #[tokio::test]
    async fn test_worker_completes_echo_job() {
        let queue = queue();
        let job = submit(&queue, "echo");

        let worker = Worker::new(
            WorkerConfig {
                worker_id: "worker-test".to_string(),
                idle_backoff_ms: 10,
            },
            queue.clone(),
            Arc::new(EchoExecutor),
        );

        let claimed = queue.claim_next("worker-test").unwrap();
        worker.process(claimed).await;

        let done = queue.get(&job.id).unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.result.unwrap()["value"], 42);
    }

    #[tokio::test]
    async fn test_worker_dead_letters_unsupported_kind() {
        let queue = queue();
        let job = submit(&queue, "unknown");

        let worker = Worker::new(
            WorkerConfig {
                worker_id: "worker-test".to_string(),
                idle_backoff_ms: 10,
            },
            queue.clone(),
            Arc::new(EchoExecutor),
        );

        let claimed = queue.claim_next("worker-test").unwrap();
        worker.process(claimed).await;

        let failed = queue.get(&job.id).unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert!(failed.dead_letter);
        assert!(failed.error.unwrap().contains("unsupported job kind"));
    }

    #[tokio::test]
    async fn test_run_drains_queue_until_shutdown() {
        let queue = queue();
        let job_a = submit(&queue, "echo");
        let job_b = submit(&queue, "echo");

        let worker = Worker::new(
            WorkerConfig {
                worker_id: "worker-test".to_string(),
                idle_backoff_ms: 10,
            },
            queue.clone(),
            Arc::new(EchoExecutor),
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let run = tokio::spawn(async move { worker.run(shutdown_rx).await });

        // Poll until both jobs settle.
        for _ in 0..100 {
            let a = queue.get(&job_a.id).unwrap().status;
            let b = queue.get(&job_b.id).unwrap().status;
            if a == JobStatus::Completed && b == JobStatus::Completed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let _ = shutdown_tx.send(true);
        let _ = run.await;

        assert_eq!(queue.get(&job_a.id).unwrap().status, JobStatus::Completed);
        assert_eq!(queue.get(&job_b.id).unwrap().status, JobStatus::Completed);
    }
}
