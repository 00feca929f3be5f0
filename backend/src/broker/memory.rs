// backend/src/broker/memory.rs
//
// In-process broker backend. Single-process deployments and the test suite
// use it; the contract is identical to the Redis backend.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use super::{Broker, BrokerError, ProgressStream, RequeueDisposition};
use crate::models::jobs::{
    Job, JobError, JobErrorKind, JobOutcome, JobState, JobStatus, Lease, NewJob, ProgressEvent,
    ProgressUpdate,
};

const SUBSCRIBE_POLL: Duration = Duration::from_millis(25);

#[derive(Debug)]
struct JobRecord {
    job: Job,
    lease_token: Option<String>,
    lease_expires_at: Option<DateTime<Utc>>,
    cancel_requested: bool,
}

#[derive(Default)]
struct Inner {
    jobs: HashMap<String, JobRecord>,
    queue: VecDeque<String>,
    progress: HashMap<String, Vec<ProgressEvent>>,
}

pub struct MemoryBroker {
    inner: Arc<Mutex<Inner>>,
    enqueued: Arc<Notify>,
    lease_duration: Duration,
    max_attempts: u32,
}

impl MemoryBroker {
    pub fn new(lease_duration: Duration, max_attempts: u32) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            enqueued: Arc::new(Notify::new()),
            lease_duration,
            max_attempts,
        }
    }

    fn push_event(progress: &mut HashMap<String, Vec<ProgressEvent>>, id: &str, update: ProgressUpdate) -> u64 {
        let events = progress.entry(id.to_string()).or_default();
        let seq = events.len() as u64 + 1;
        events.push(ProgressEvent {
            seq,
            at: Utc::now(),
            phase: update.phase,
            detail: update.detail,
            partial_output: update.partial_output,
        });
        seq
    }

    fn apply_terminal(record: &mut JobRecord, outcome: &JobOutcome) {
        record.job.state = outcome.terminal_state();
        match outcome {
            JobOutcome::Succeeded { result } => {
                record.job.result = Some(result.clone());
            }
            JobOutcome::Failed { kind, message } => {
                record.job.error = Some(JobError {
                    kind: *kind,
                    message: message.clone(),
                });
            }
            JobOutcome::Canceled { message } => {
                record.job.error = Some(JobError {
                    kind: JobErrorKind::Canceled,
                    message: message.clone(),
                });
            }
        }
        // The token survives the terminal write so a worker retrying its own
        // `complete` is recognized.
        record.lease_expires_at = None;
    }

    /// Reclaim expired leases under the lock; returns reclaimed job count.
    fn reclaim_inner(inner: &mut Inner, now: DateTime<Utc>) -> u64 {
        let expired: Vec<String> = inner
            .jobs
            .iter()
            .filter(|(_, rec)| {
                matches!(rec.job.state, JobState::Reserved | JobState::Running)
                    && rec.lease_expires_at.is_some_and(|at| at <= now)
            })
            .map(|(id, _)| id.clone())
            .collect();

        let mut reclaimed = 0;
        for id in expired {
            let Some(record) = inner.jobs.get_mut(&id) else {
                continue;
            };
            record.job.attempts += 1;
            record.lease_token = None;
            record.lease_expires_at = None;
            if record.job.attempts < record.job.max_attempts {
                record.job.state = JobState::Pending;
                inner.queue.push_back(id.clone());
            } else {
                let attempts = record.job.attempts;
                Self::apply_terminal(
                    record,
                    &JobOutcome::Failed {
                        kind: JobErrorKind::BrokerError,
                        message: format!("lease expired after {attempts} attempt(s)"),
                    },
                );
                let event = JobOutcome::Failed {
                    kind: JobErrorKind::BrokerError,
                    message: format!("lease expired after {attempts} attempt(s)"),
                }
                .terminal_event();
                Self::push_event(&mut inner.progress, &id, event);
            }
            reclaimed += 1;
        }
        reclaimed
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn submit(&self, job: NewJob) -> Result<String, BrokerError> {
        let id = job.id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());
        let mut inner = self.inner.lock().expect("broker mutex poisoned");
        if inner.jobs.contains_key(&id) {
            return Ok(id);
        }
        inner.jobs.insert(
            id.clone(),
            JobRecord {
                job: Job {
                    id: id.clone(),
                    question: job.question,
                    primary_file: job.primary_file,
                    submitted_at: Utc::now(),
                    state: JobState::Pending,
                    attempts: 0,
                    max_attempts: self.max_attempts,
                    result: None,
                    error: None,
                },
                lease_token: None,
                lease_expires_at: None,
                cancel_requested: false,
            },
        );
        Self::push_event(
            &mut inner.progress,
            &id,
            ProgressUpdate::new(crate::models::jobs::Phase::Queued, "job accepted"),
        );
        inner.queue.push_back(id.clone());
        drop(inner);
        self.enqueued.notify_waiters();
        debug!(job_id = %id, "Job submitted");
        Ok(id)
    }

    async fn reserve(&self, timeout: Duration) -> Result<Option<(Job, Lease)>, BrokerError> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut inner = self.inner.lock().expect("broker mutex poisoned");
                Self::reclaim_inner(&mut inner, Utc::now());
                while let Some(id) = inner.queue.pop_front() {
                    let Some(record) = inner.jobs.get_mut(&id) else {
                        continue;
                    };
                    if record.job.state != JobState::Pending {
                        continue;
                    }
                    let token = Lease::new_token();
                    let expires_at = Utc::now()
                        + chrono::Duration::from_std(self.lease_duration)
                            .expect("lease duration fits chrono");
                    record.job.state = JobState::Reserved;
                    record.lease_token = Some(token.clone());
                    record.lease_expires_at = Some(expires_at);
                    let job = record.job.clone();
                    return Ok(Some((
                        job,
                        Lease {
                            job_id: id,
                            token,
                            expires_at,
                        },
                    )));
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::select! {
                _ = self.enqueued.notified() => {}
                _ = tokio::time::sleep_until(deadline) => return Ok(None),
            }
        }
    }

    async fn extend(&self, lease: &Lease, duration: Duration) -> Result<Lease, BrokerError> {
        let mut inner = self.inner.lock().expect("broker mutex poisoned");
        let record = inner
            .jobs
            .get_mut(&lease.job_id)
            .ok_or_else(|| BrokerError::UnknownJob(lease.job_id.clone()))?;
        let held = record.lease_token.as_deref() == Some(lease.token.as_str())
            && matches!(record.job.state, JobState::Reserved | JobState::Running);
        if !held {
            return Err(BrokerError::LeaseLost(lease.job_id.clone()));
        }
        let expires_at =
            Utc::now() + chrono::Duration::from_std(duration).expect("duration fits chrono");
        record.lease_expires_at = Some(expires_at);
        Ok(Lease {
            job_id: lease.job_id.clone(),
            token: lease.token.clone(),
            expires_at,
        })
    }

    async fn mark_running(&self, lease: &Lease) -> Result<(), BrokerError> {
        let mut inner = self.inner.lock().expect("broker mutex poisoned");
        let record = inner
            .jobs
            .get_mut(&lease.job_id)
            .ok_or_else(|| BrokerError::UnknownJob(lease.job_id.clone()))?;
        if record.lease_token.as_deref() != Some(lease.token.as_str()) {
            return Err(BrokerError::LeaseLost(lease.job_id.clone()));
        }
        if record.job.state == JobState::Reserved {
            record.job.state = JobState::Running;
        }
        Ok(())
    }

    async fn publish_progress(
        &self,
        job_id: &str,
        update: ProgressUpdate,
    ) -> Result<u64, BrokerError> {
        let mut inner = self.inner.lock().expect("broker mutex poisoned");
        if !inner.jobs.contains_key(job_id) {
            return Err(BrokerError::UnknownJob(job_id.to_string()));
        }
        Ok(Self::push_event(&mut inner.progress, job_id, update))
    }

    async fn subscribe_progress(
        &self,
        job_id: &str,
        from_seq: u64,
    ) -> Result<ProgressStream, BrokerError> {
        let inner = Arc::clone(&self.inner);
        let job_id = job_id.to_string();
        let stream = async_stream::stream! {
            let mut next_seq = from_seq.max(1);
            loop {
                let (batch, job_known) = {
                    let inner = inner.lock().expect("broker mutex poisoned");
                    let events = inner
                        .progress
                        .get(&job_id)
                        .map(|events| {
                            events
                                .iter()
                                .filter(|e| e.seq >= next_seq)
                                .cloned()
                                .collect::<Vec<_>>()
                        })
                        .unwrap_or_default();
                    (events, inner.jobs.contains_key(&job_id))
                };
                let mut saw_terminal = false;
                for event in batch {
                    next_seq = event.seq + 1;
                    saw_terminal = event.phase.is_terminal();
                    yield Ok(event);
                    if saw_terminal {
                        break;
                    }
                }
                if saw_terminal || !job_known {
                    break;
                }
                tokio::time::sleep(SUBSCRIBE_POLL).await;
            }
        };
        Ok(Box::pin(stream))
    }

    async fn complete(&self, lease: &Lease, outcome: JobOutcome) -> Result<(), BrokerError> {
        let mut inner = self.inner.lock().expect("broker mutex poisoned");
        let record = inner
            .jobs
            .get_mut(&lease.job_id)
            .ok_or_else(|| BrokerError::UnknownJob(lease.job_id.clone()))?;

        if record.job.state.is_terminal() {
            // A worker retrying its own terminal write is a no-op; anyone
            // else has lost the race.
            return if record.lease_token.as_deref() == Some(lease.token.as_str()) {
                Ok(())
            } else {
                Err(BrokerError::LeaseLost(lease.job_id.clone()))
            };
        }
        if record.lease_token.as_deref() != Some(lease.token.as_str()) {
            return Err(BrokerError::LeaseLost(lease.job_id.clone()));
        }
        Self::apply_terminal(record, &outcome);
        let id = lease.job_id.clone();
        Self::push_event(&mut inner.progress, &id, outcome.terminal_event());
        debug!(job_id = %id, state = %outcome.terminal_state(), "Job completed");
        Ok(())
    }

    async fn fail_and_requeue(
        &self,
        lease: &Lease,
        kind: JobErrorKind,
        reason: &str,
    ) -> Result<RequeueDisposition, BrokerError> {
        let mut inner = self.inner.lock().expect("broker mutex poisoned");
        let record = inner
            .jobs
            .get_mut(&lease.job_id)
            .ok_or_else(|| BrokerError::UnknownJob(lease.job_id.clone()))?;
        if record.job.state.is_terminal()
            || record.lease_token.as_deref() != Some(lease.token.as_str())
        {
            return Err(BrokerError::LeaseLost(lease.job_id.clone()));
        }
        record.job.attempts += 1;
        record.lease_token = None;
        record.lease_expires_at = None;
        if record.job.attempts < record.job.max_attempts {
            record.job.state = JobState::Pending;
            let id = lease.job_id.clone();
            inner.queue.push_back(id);
            drop(inner);
            self.enqueued.notify_waiters();
            Ok(RequeueDisposition::Requeued)
        } else {
            let outcome = JobOutcome::Failed {
                kind,
                message: reason.to_string(),
            };
            Self::apply_terminal(record, &outcome);
            let id = lease.job_id.clone();
            Self::push_event(&mut inner.progress, &id, outcome.terminal_event());
            Ok(RequeueDisposition::Failed)
        }
    }

    async fn status(&self, job_id: &str) -> Result<Option<JobStatus>, BrokerError> {
        let inner = self.inner.lock().expect("broker mutex poisoned");
        Ok(inner.jobs.get(job_id).map(|record| JobStatus {
            state: record.job.state,
            result: record.job.result.clone(),
            error: record.job.error.clone(),
        }))
    }

    async fn request_cancel(&self, job_id: &str) -> Result<bool, BrokerError> {
        let mut inner = self.inner.lock().expect("broker mutex poisoned");
        match inner.jobs.get_mut(job_id) {
            Some(record) if !record.job.state.is_terminal() => {
                record.cancel_requested = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn cancel_requested(&self, job_id: &str) -> Result<bool, BrokerError> {
        let inner = self.inner.lock().expect("broker mutex poisoned");
        Ok(inner
            .jobs
            .get(job_id)
            .is_some_and(|record| record.cancel_requested))
    }

    async fn reclaim_expired(&self) -> Result<u64, BrokerError> {
        let mut inner = self.inner.lock().expect("broker mutex poisoned");
        Ok(Self::reclaim_inner(&mut inner, Utc::now()))
    }
}
