// backend/src/worker/mod.rs
//
// The long-running worker process. Each worker loop reserves one job at a
// time, hands it to the orchestrator, and settles the outcome; loops
// coordinate with each other only through the broker.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::broker::{with_backoff, Broker, RequeueDisposition};
use crate::config::Config;
use crate::models::jobs::JobErrorKind;
use crate::services::orchestrator::{Orchestrator, RunError};

/// How long one reserve call blocks before re-checking for shutdown.
const RESERVE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct WorkerPool {
    broker: Arc<dyn Broker>,
    orchestrator: Arc<Orchestrator>,
    config: Arc<Config>,
}

impl WorkerPool {
    pub fn new(
        broker: Arc<dyn Broker>,
        orchestrator: Arc<Orchestrator>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            broker,
            orchestrator,
            config,
        }
    }

    /// Run `worker_count` independent worker loops until shutdown is
    /// signaled. Each loop drains its current job before exiting.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        let count = self.config.worker_count.max(1);
        info!(workers = count, "Starting worker pool");

        let mut handles = Vec::with_capacity(count);
        for _ in 0..count {
            let worker = WorkerLoop {
                id: Uuid::new_v4(),
                broker: Arc::clone(&self.broker),
                orchestrator: Arc::clone(&self.orchestrator),
                shutdown: shutdown.clone(),
            };
            handles.push(tokio::spawn(async move { worker.run().await }));
        }

        for handle in handles {
            if let Err(err) = handle.await {
                error!(error = %err, "Worker loop aborted");
            }
        }
        info!("Worker pool stopped");
    }
}

struct WorkerLoop {
    id: Uuid,
    broker: Arc<dyn Broker>,
    orchestrator: Arc<Orchestrator>,
    shutdown: watch::Receiver<bool>,
}

impl WorkerLoop {
    #[instrument(skip(self), fields(worker_id = %self.id))]
    async fn run(self) {
        info!("Worker loop started");
        loop {
            if *self.shutdown.borrow() {
                info!("Shutdown requested; worker loop stopping");
                return;
            }

            let reserved = {
                let broker = Arc::clone(&self.broker);
                with_backoff("reserve", || {
                    let broker = Arc::clone(&broker);
                    async move { broker.reserve(RESERVE_TIMEOUT).await }
                })
                .await
            };

            let (job, lease) = match reserved {
                Ok(Some(pair)) => pair,
                Ok(None) => continue,
                Err(err) => {
                    error!(error = %err, "Reserve failed after backoff; pausing");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    continue;
                }
            };

            let job_id = job.id.clone();
            info!(job_id = %job_id, "Reserved job");

            // The orchestrator runs in its own task so a panic inside it is
            // an uncaught exception to escalate, not a dead worker.
            let run = {
                let orchestrator = Arc::clone(&self.orchestrator);
                let lease = lease.clone();
                let shutdown = self.shutdown.clone();
                tokio::spawn(async move { orchestrator.run(job, lease, shutdown).await })
            };

            match run.await {
                Ok(Ok(())) => {}
                Ok(Err(RunError::Requeue { kind, reason })) => {
                    self.nack(&lease, kind, &reason).await;
                }
                Ok(Err(RunError::LeaseLost)) => {
                    warn!(job_id = %job_id, "Lease lost mid-run; job abandoned for reclaim");
                }
                Ok(Err(RunError::Broker(err))) => {
                    warn!(job_id = %job_id, error = %err, "Broker unavailable mid-run");
                    self.nack(&lease, JobErrorKind::BrokerError, &err.to_string())
                        .await;
                }
                Err(join_err) => {
                    error!(job_id = %job_id, error = %join_err, "Orchestrator panicked");
                    self.nack(
                        &lease,
                        JobErrorKind::Internal,
                        &format!("worker crashed while running the job: {join_err}"),
                    )
                    .await;
                }
            }
        }
    }

    async fn nack(&self, lease: &crate::models::jobs::Lease, kind: JobErrorKind, reason: &str) {
        let broker = Arc::clone(&self.broker);
        let lease = lease.clone();
        let reason_owned = reason.to_string();
        let result = with_backoff("fail_and_requeue", || {
            let broker = Arc::clone(&broker);
            let lease = lease.clone();
            let reason = reason_owned.clone();
            async move { broker.fail_and_requeue(&lease, kind, &reason).await }
        })
        .await;
        match result {
            Ok(RequeueDisposition::Requeued) => {
                info!(job_id = %lease.job_id, reason = %reason_owned, "Job requeued")
            }
            Ok(RequeueDisposition::Failed) => {
                warn!(job_id = %lease.job_id, reason = %reason_owned, "Job failed after final attempt")
            }
            Err(err) => {
                // Lease expiry will get the job back into the queue.
                warn!(job_id = %lease.job_id, error = %err, "Nack failed; leaving job to reclaim")
            }
        }
    }
}
