// backend/src/broker/mod.rs
//
// Durable queue and result-store primitives over a pluggable backend. The
// broker is the single source of truth for job state; workers hold
// time-bounded leases and every terminal transition happens exactly once.

use async_trait::async_trait;
use futures::stream::Stream;
use rand::Rng;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

use crate::models::jobs::{
    Job, JobErrorKind, JobOutcome, JobStatus, Lease, NewJob, ProgressEvent, ProgressUpdate,
};

pub mod memory;
pub mod redis;

pub use self::memory::MemoryBroker;
pub use self::redis::RedisBroker;

pub type ProgressStream = Pin<Box<dyn Stream<Item = Result<ProgressEvent, BrokerError>> + Send>>;

#[derive(Error, Debug, Clone)]
pub enum BrokerError {
    /// Backend connectivity fault; transient, retried with backoff.
    #[error("broker connection error: {0}")]
    Connection(String),

    /// The lease was reclaimed out from under the caller.
    #[error("lease lost: {0}")]
    LeaseLost(String),

    #[error("unknown job: {0}")]
    UnknownJob(String),

    #[error("corrupt broker record: {0}")]
    Corrupt(String),
}

/// What `fail_and_requeue` did with the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequeueDisposition {
    Requeued,
    Failed,
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Atomically persist the job as PENDING and enqueue it. Idempotent when
    /// the caller supplies an id: resubmitting an existing id returns it
    /// without a second enqueue.
    async fn submit(&self, job: NewJob) -> Result<String, BrokerError>;

    /// Block up to `timeout` for an eligible job; exactly one reserver
    /// succeeds per enqueue. `None` when the timeout elapses empty-handed.
    async fn reserve(&self, timeout: Duration) -> Result<Option<(Job, Lease)>, BrokerError>;

    /// Push the lease expiry forward. Fails with `LeaseLost` when the lease
    /// already expired and was reclaimed.
    async fn extend(&self, lease: &Lease, duration: Duration) -> Result<Lease, BrokerError>;

    /// Move a reserved job to RUNNING.
    async fn mark_running(&self, lease: &Lease) -> Result<(), BrokerError>;

    /// Append an event to the job's progress stream; `seq` is assigned here
    /// by monotone increment and returned.
    async fn publish_progress(
        &self,
        job_id: &str,
        update: ProgressUpdate,
    ) -> Result<u64, BrokerError>;

    /// Ordered events with `seq >= from_seq`, ending after a terminal event.
    async fn subscribe_progress(
        &self,
        job_id: &str,
        from_seq: u64,
    ) -> Result<ProgressStream, BrokerError>;

    /// Atomically set the terminal state, publish the terminal progress
    /// event, and release the lease. Idempotent by lease token.
    async fn complete(&self, lease: &Lease, outcome: JobOutcome) -> Result<(), BrokerError>;

    /// Nack: return to PENDING with `attempts` incremented when the ceiling
    /// allows, otherwise transition to FAILED.
    async fn fail_and_requeue(
        &self,
        lease: &Lease,
        kind: JobErrorKind,
        reason: &str,
    ) -> Result<RequeueDisposition, BrokerError>;

    /// Single-shot status read; `None` for unknown (or expired) jobs.
    async fn status(&self, job_id: &str) -> Result<Option<JobStatus>, BrokerError>;

    /// Best-effort cancellation flag, observed by the orchestrator at state
    /// boundaries. Returns false when the job is unknown or already terminal.
    async fn request_cancel(&self, job_id: &str) -> Result<bool, BrokerError>;

    async fn cancel_requested(&self, job_id: &str) -> Result<bool, BrokerError>;

    /// Return expired-lease jobs to PENDING (attempts++), failing those past
    /// their attempt ceiling. Returns how many jobs were reclaimed.
    async fn reclaim_expired(&self) -> Result<u64, BrokerError>;
}

/// Retry ceiling for transient backend faults.
const BACKOFF_MAX_RETRIES: u32 = 5;
const BACKOFF_INITIAL: Duration = Duration::from_millis(100);
const BACKOFF_CAP: Duration = Duration::from_secs(5);

/// Run a broker operation, retrying connection faults with exponential
/// backoff and jitter. Non-transient errors pass through untouched.
pub async fn with_backoff<T, F, Fut>(label: &str, mut op: F) -> Result<T, BrokerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BrokerError>>,
{
    let mut delay = BACKOFF_INITIAL;
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(BrokerError::Connection(err)) if attempt < BACKOFF_MAX_RETRIES => {
                attempt += 1;
                let jitter_ms = rand::thread_rng().gen_range(0..=delay.as_millis() as u64 / 2 + 1);
                let wait = delay + Duration::from_millis(jitter_ms);
                warn!(
                    op = label,
                    attempt,
                    wait_ms = wait.as_millis() as u64,
                    error = %err,
                    "Transient broker fault, backing off"
                );
                tokio::time::sleep(wait).await;
                delay = (delay * 2).min(BACKOFF_CAP);
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn backoff_retries_connection_faults() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, _> = with_backoff("test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(BrokerError::Connection("down".to_string()))
                } else {
                    Ok(7)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn backoff_passes_through_non_transient_errors() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_backoff("test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(BrokerError::LeaseLost("gone".to_string())) }
        })
        .await;
        assert!(matches!(result, Err(BrokerError::LeaseLost(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
