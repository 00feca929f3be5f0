// backend/src/broker/redis.rs
//
// Redis-backed broker. Layout per job:
//   tabula:queue              list of pending job ids (LPUSH / RPOP, FIFO)
//   tabula:job:{id}           hash with the job record fields
//   tabula:job:{id}:progress  list of JSON progress events; seq = index + 1
//   tabula:leases             zset of job ids scored by lease expiry (ms)
//
// State transitions run as Lua scripts so each is a single atomic step; the
// progress list length doubles as the monotone seq counter.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{AsyncCommands, Script};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::{Broker, BrokerError, ProgressStream, RequeueDisposition};
use crate::models::jobs::{
    Job, JobError, JobErrorKind, JobOutcome, JobState, JobStatus, Lease, NewJob, Phase,
    ProgressEvent, ProgressUpdate,
};

const QUEUE_KEY: &str = "tabula:queue";
const LEASES_KEY: &str = "tabula:leases";

const RESERVE_POLL: Duration = Duration::from_millis(250);
const SUBSCRIBE_POLL: Duration = Duration::from_millis(250);

/// Claim a popped job id: PENDING -> RESERVED with a fresh lease.
/// KEYS: job hash, leases zset. ARGV: token, expiry_ms, job id.
const CLAIM_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[1], 'state') ~= 'PENDING' then return 0 end
redis.call('HSET', KEYS[1], 'state', 'RESERVED', 'lease_token', ARGV[1], 'lease_expires_at', ARGV[2])
redis.call('ZADD', KEYS[2], ARGV[2], ARGV[3])
return 1
"#;

/// KEYS: job hash, leases zset. ARGV: token, new expiry_ms, job id.
const EXTEND_SCRIPT: &str = r#"
local state = redis.call('HGET', KEYS[1], 'state')
if state ~= 'RESERVED' and state ~= 'RUNNING' then return 0 end
if redis.call('HGET', KEYS[1], 'lease_token') ~= ARGV[1] then return 0 end
redis.call('HSET', KEYS[1], 'lease_expires_at', ARGV[2])
redis.call('ZADD', KEYS[2], ARGV[2], ARGV[3])
return 1
"#;

/// KEYS: job hash. ARGV: token.
const MARK_RUNNING_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[1], 'lease_token') ~= ARGV[1] then return 0 end
if redis.call('HGET', KEYS[1], 'state') == 'RESERVED' then
  redis.call('HSET', KEYS[1], 'state', 'RUNNING')
end
return 1
"#;

/// Stamp seq = LLEN + 1 into a pre-serialized event body (an object whose
/// text starts with '{') and append it.
/// KEYS: progress list. ARGV: event JSON without the seq field.
const PUBLISH_SCRIPT: &str = r#"
local seq = redis.call('LLEN', KEYS[1]) + 1
local event = '{"seq":' .. seq .. ',' .. string.sub(ARGV[1], 2)
redis.call('RPUSH', KEYS[1], event)
return seq
"#;

/// Terminal write, idempotent by lease token.
/// KEYS: job hash, progress list, leases zset.
/// ARGV: token, state, result, error_kind, error_message, terminal event
///       JSON (seq-less), job id, retention seconds.
const COMPLETE_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[1], 'lease_token') ~= ARGV[1] then return 0 end
local state = redis.call('HGET', KEYS[1], 'state')
if state == 'SUCCEEDED' or state == 'FAILED' or state == 'CANCELED' then return 1 end
redis.call('HSET', KEYS[1], 'state', ARGV[2], 'result', ARGV[3], 'error_kind', ARGV[4], 'error_message', ARGV[5])
local seq = redis.call('LLEN', KEYS[2]) + 1
local event = '{"seq":' .. seq .. ',' .. string.sub(ARGV[6], 2)
redis.call('RPUSH', KEYS[2], event)
redis.call('ZREM', KEYS[3], ARGV[7])
redis.call('EXPIRE', KEYS[1], ARGV[8])
redis.call('EXPIRE', KEYS[2], ARGV[8])
return 1
"#;

/// Nack. Returns 1 when requeued, 2 when the attempt ceiling failed the job,
/// 0 when the lease no longer holds.
/// KEYS: job hash, progress list, leases zset, queue.
/// ARGV: token, job id, error_kind, error_message, terminal event JSON
///       (seq-less), retention seconds.
const FAIL_REQUEUE_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[1], 'lease_token') ~= ARGV[1] then return 0 end
local state = redis.call('HGET', KEYS[1], 'state')
if state == 'SUCCEEDED' or state == 'FAILED' or state == 'CANCELED' then return 0 end
local attempts = tonumber(redis.call('HINCRBY', KEYS[1], 'attempts', 1))
local max = tonumber(redis.call('HGET', KEYS[1], 'max_attempts'))
redis.call('ZREM', KEYS[3], ARGV[2])
if attempts < max then
  redis.call('HSET', KEYS[1], 'state', 'PENDING', 'lease_token', '')
  redis.call('LPUSH', KEYS[4], ARGV[2])
  return 1
end
redis.call('HSET', KEYS[1], 'state', 'FAILED', 'error_kind', ARGV[3], 'error_message', ARGV[4])
local seq = redis.call('LLEN', KEYS[2]) + 1
local event = '{"seq":' .. seq .. ',' .. string.sub(ARGV[5], 2)
redis.call('RPUSH', KEYS[2], event)
redis.call('EXPIRE', KEYS[1], ARGV[6])
redis.call('EXPIRE', KEYS[2], ARGV[6])
return 2
"#;

/// Reclaim one expired lease, without a token. Same disposition codes as
/// FAIL_REQUEUE_SCRIPT.
/// KEYS: job hash, progress list, leases zset, queue.
/// ARGV: job id, now_ms, terminal event JSON (seq-less), retention seconds,
///       error message.
const RECLAIM_SCRIPT: &str = r#"
local state = redis.call('HGET', KEYS[1], 'state')
if state ~= 'RESERVED' and state ~= 'RUNNING' then
  redis.call('ZREM', KEYS[3], ARGV[1])
  return 0
end
local expiry = tonumber(redis.call('HGET', KEYS[1], 'lease_expires_at'))
if expiry == nil or expiry > tonumber(ARGV[2]) then return 0 end
local attempts = tonumber(redis.call('HINCRBY', KEYS[1], 'attempts', 1))
local max = tonumber(redis.call('HGET', KEYS[1], 'max_attempts'))
redis.call('ZREM', KEYS[3], ARGV[1])
if attempts < max then
  redis.call('HSET', KEYS[1], 'state', 'PENDING', 'lease_token', '')
  redis.call('LPUSH', KEYS[4], ARGV[1])
  return 1
end
redis.call('HSET', KEYS[1], 'state', 'FAILED', 'error_kind', 'BrokerError', 'error_message', ARGV[5])
local seq = redis.call('LLEN', KEYS[2]) + 1
local event = '{"seq":' .. seq .. ',' .. string.sub(ARGV[3], 2)
redis.call('RPUSH', KEYS[2], event)
redis.call('EXPIRE', KEYS[1], ARGV[4])
redis.call('EXPIRE', KEYS[2], ARGV[4])
return 2
"#;

/// Submit: create the record, push the queued event, enqueue. No-op when the
/// id already exists.
/// KEYS: job hash, progress list, queue.
/// ARGV: id, question, primary_file, submitted_at, max_attempts, queued
///       event JSON (seq-less).
const SUBMIT_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then return 0 end
redis.call('HSET', KEYS[1], 'id', ARGV[1], 'question', ARGV[2], 'primary_file', ARGV[3], 'submitted_at', ARGV[4], 'state', 'PENDING', 'attempts', '0', 'max_attempts', ARGV[5], 'cancel', '0', 'lease_token', '', 'result', '', 'error_kind', '', 'error_message', '')
local event = '{"seq":1,' .. string.sub(ARGV[6], 2)
redis.call('RPUSH', KEYS[2], event)
redis.call('LPUSH', KEYS[3], ARGV[1])
return 1
"#;

pub struct RedisBroker {
    client: Arc<redis::Client>,
    lease_duration: Duration,
    max_attempts: u32,
    retention: Duration,
}

impl RedisBroker {
    pub fn new(
        address: &str,
        lease_duration: Duration,
        max_attempts: u32,
        retention: Duration,
    ) -> Result<Self, BrokerError> {
        let client = redis::Client::open(address)
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        Ok(Self {
            client: Arc::new(client),
            lease_duration,
            max_attempts,
            retention,
        })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, BrokerError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))
    }

    fn job_key(id: &str) -> String {
        format!("tabula:job:{id}")
    }

    fn progress_key(id: &str) -> String {
        format!("tabula:job:{id}:progress")
    }

    /// Serialize a progress update as a seq-less event body the Lua scripts
    /// splice a seq into.
    fn event_body(update: &ProgressUpdate) -> String {
        let mut value = serde_json::json!({
            "at": Utc::now(),
            "phase": update.phase,
            "detail": update.detail,
        });
        if let Some(partial) = &update.partial_output {
            value["partial_output"] = serde_json::Value::String(partial.clone());
        }
        value.to_string()
    }

    fn job_from_hash(map: &HashMap<String, String>) -> Result<Job, BrokerError> {
        let get = |field: &str| -> Result<&str, BrokerError> {
            map.get(field)
                .map(String::as_str)
                .ok_or_else(|| BrokerError::Corrupt(format!("missing field {field}")))
        };
        let state: JobState = get("state")?
            .parse()
            .map_err(BrokerError::Corrupt)?;
        let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());
        let error = match map.get("error_kind").map(String::as_str) {
            Some("") | None => None,
            Some(kind_str) => {
                let kind: JobErrorKind = serde_json::from_value(serde_json::Value::String(
                    kind_str.to_string(),
                ))
                .map_err(|e| BrokerError::Corrupt(format!("bad error kind: {e}")))?;
                Some(JobError {
                    kind,
                    message: map.get("error_message").cloned().unwrap_or_default(),
                })
            }
        };
        Ok(Job {
            id: get("id")?.to_string(),
            question: get("question")?.to_string(),
            primary_file: non_empty(get("primary_file").unwrap_or_default()),
            submitted_at: get("submitted_at")?
                .parse::<DateTime<Utc>>()
                .map_err(|e| BrokerError::Corrupt(format!("bad submitted_at: {e}")))?,
            state,
            attempts: get("attempts")?
                .parse()
                .map_err(|_| BrokerError::Corrupt("bad attempts".to_string()))?,
            max_attempts: get("max_attempts")?
                .parse()
                .map_err(|_| BrokerError::Corrupt("bad max_attempts".to_string()))?,
            result: non_empty(map.get("result").map(String::as_str).unwrap_or_default()),
            error,
        })
    }

    fn outcome_fields(outcome: &JobOutcome) -> (String, String, String, String) {
        match outcome {
            JobOutcome::Succeeded { result } => (
                "SUCCEEDED".to_string(),
                result.clone(),
                String::new(),
                String::new(),
            ),
            JobOutcome::Failed { kind, message } => (
                "FAILED".to_string(),
                String::new(),
                kind.to_string(),
                message.clone(),
            ),
            JobOutcome::Canceled { message } => (
                "CANCELED".to_string(),
                String::new(),
                JobErrorKind::Canceled.to_string(),
                message.clone(),
            ),
        }
    }
}

#[async_trait]
impl Broker for RedisBroker {
    #[instrument(skip(self, job))]
    async fn submit(&self, job: NewJob) -> Result<String, BrokerError> {
        let id = job.id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());
        let queued = Self::event_body(&ProgressUpdate::new(Phase::Queued, "job accepted"));
        let mut conn = self.connection().await?;
        let created: i64 = Script::new(SUBMIT_SCRIPT)
            .key(Self::job_key(&id))
            .key(Self::progress_key(&id))
            .key(QUEUE_KEY)
            .arg(&id)
            .arg(&job.question)
            .arg(job.primary_file.as_deref().unwrap_or(""))
            .arg(Utc::now().to_rfc3339())
            .arg(self.max_attempts)
            .arg(queued)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        debug!(job_id = %id, created = created == 1, "Job submitted");
        Ok(id)
    }

    async fn reserve(&self, timeout: Duration) -> Result<Option<(Job, Lease)>, BrokerError> {
        let deadline = Instant::now() + timeout;
        loop {
            self.reclaim_expired().await?;

            let mut conn = self.connection().await?;
            let popped: Option<String> = conn
                .rpop(QUEUE_KEY, None)
                .await
                .map_err(|e| BrokerError::Connection(e.to_string()))?;

            if let Some(id) = popped {
                let token = Lease::new_token();
                let expires_at = Utc::now()
                    + chrono::Duration::from_std(self.lease_duration)
                        .expect("lease duration fits chrono");
                let claimed: i64 = Script::new(CLAIM_SCRIPT)
                    .key(Self::job_key(&id))
                    .key(LEASES_KEY)
                    .arg(&token)
                    .arg(expires_at.timestamp_millis())
                    .arg(&id)
                    .invoke_async(&mut conn)
                    .await
                    .map_err(|e| BrokerError::Connection(e.to_string()))?;
                if claimed == 1 {
                    let map: HashMap<String, String> = conn
                        .hgetall(Self::job_key(&id))
                        .await
                        .map_err(|e| BrokerError::Connection(e.to_string()))?;
                    let job = Self::job_from_hash(&map)?;
                    return Ok(Some((
                        job,
                        Lease {
                            job_id: id,
                            token,
                            expires_at,
                        },
                    )));
                }
                // Stale queue entry; keep draining.
                continue;
            }

            if Instant::now() + RESERVE_POLL >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(RESERVE_POLL).await;
        }
    }

    async fn extend(&self, lease: &Lease, duration: Duration) -> Result<Lease, BrokerError> {
        let expires_at =
            Utc::now() + chrono::Duration::from_std(duration).expect("duration fits chrono");
        let mut conn = self.connection().await?;
        let extended: i64 = Script::new(EXTEND_SCRIPT)
            .key(Self::job_key(&lease.job_id))
            .key(LEASES_KEY)
            .arg(&lease.token)
            .arg(expires_at.timestamp_millis())
            .arg(&lease.job_id)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        if extended == 1 {
            Ok(Lease {
                job_id: lease.job_id.clone(),
                token: lease.token.clone(),
                expires_at,
            })
        } else {
            Err(BrokerError::LeaseLost(lease.job_id.clone()))
        }
    }

    async fn mark_running(&self, lease: &Lease) -> Result<(), BrokerError> {
        let mut conn = self.connection().await?;
        let ok: i64 = Script::new(MARK_RUNNING_SCRIPT)
            .key(Self::job_key(&lease.job_id))
            .arg(&lease.token)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        if ok == 1 {
            Ok(())
        } else {
            Err(BrokerError::LeaseLost(lease.job_id.clone()))
        }
    }

    async fn publish_progress(
        &self,
        job_id: &str,
        update: ProgressUpdate,
    ) -> Result<u64, BrokerError> {
        let mut conn = self.connection().await?;
        let body = Self::event_body(&update);
        let seq: i64 = Script::new(PUBLISH_SCRIPT)
            .key(Self::progress_key(job_id))
            .arg(body)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        Ok(seq as u64)
    }

    async fn subscribe_progress(
        &self,
        job_id: &str,
        from_seq: u64,
    ) -> Result<ProgressStream, BrokerError> {
        let client = Arc::clone(&self.client);
        let progress_key = Self::progress_key(job_id);
        let job_key = Self::job_key(job_id);
        let stream = async_stream::stream! {
            let mut next_seq = from_seq.max(1);
            loop {
                let mut conn = match client.get_multiplexed_async_connection().await {
                    Ok(conn) => conn,
                    Err(e) => {
                        yield Err(BrokerError::Connection(e.to_string()));
                        break;
                    }
                };
                let raw: Vec<String> = match conn
                    .lrange(&progress_key, next_seq as isize - 1, -1)
                    .await
                {
                    Ok(items) => items,
                    Err(e) => {
                        yield Err(BrokerError::Connection(e.to_string()));
                        break;
                    }
                };
                let mut saw_terminal = false;
                for item in raw {
                    match serde_json::from_str::<ProgressEvent>(&item) {
                        Ok(event) => {
                            next_seq = event.seq + 1;
                            saw_terminal = event.phase.is_terminal();
                            yield Ok(event);
                            if saw_terminal {
                                break;
                            }
                        }
                        Err(e) => {
                            yield Err(BrokerError::Corrupt(format!("bad progress event: {e}")));
                        }
                    }
                }
                if saw_terminal {
                    break;
                }
                let exists: bool = conn.exists(&job_key).await.unwrap_or(false);
                if !exists && next_seq > 1 {
                    // Record expired mid-stream; nothing further will come.
                    break;
                }
                tokio::time::sleep(SUBSCRIBE_POLL).await;
            }
        };
        Ok(Box::pin(stream))
    }

    #[instrument(skip(self, outcome), fields(job_id = %lease.job_id))]
    async fn complete(&self, lease: &Lease, outcome: JobOutcome) -> Result<(), BrokerError> {
        let (state, result, error_kind, error_message) = Self::outcome_fields(&outcome);
        let terminal = Self::event_body(&outcome.terminal_event());
        let mut conn = self.connection().await?;
        let ok: i64 = Script::new(COMPLETE_SCRIPT)
            .key(Self::job_key(&lease.job_id))
            .key(Self::progress_key(&lease.job_id))
            .key(LEASES_KEY)
            .arg(&lease.token)
            .arg(state)
            .arg(result)
            .arg(error_kind)
            .arg(error_message)
            .arg(terminal)
            .arg(&lease.job_id)
            .arg(self.retention.as_secs())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        if ok == 1 {
            Ok(())
        } else {
            Err(BrokerError::LeaseLost(lease.job_id.clone()))
        }
    }

    async fn fail_and_requeue(
        &self,
        lease: &Lease,
        kind: JobErrorKind,
        reason: &str,
    ) -> Result<RequeueDisposition, BrokerError> {
        let terminal = Self::event_body(
            &JobOutcome::Failed {
                kind,
                message: reason.to_string(),
            }
            .terminal_event(),
        );
        let mut conn = self.connection().await?;
        let disposition: i64 = Script::new(FAIL_REQUEUE_SCRIPT)
            .key(Self::job_key(&lease.job_id))
            .key(Self::progress_key(&lease.job_id))
            .key(LEASES_KEY)
            .key(QUEUE_KEY)
            .arg(&lease.token)
            .arg(&lease.job_id)
            .arg(kind.to_string())
            .arg(reason)
            .arg(terminal)
            .arg(self.retention.as_secs())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        match disposition {
            1 => Ok(RequeueDisposition::Requeued),
            2 => Ok(RequeueDisposition::Failed),
            _ => Err(BrokerError::LeaseLost(lease.job_id.clone())),
        }
    }

    async fn status(&self, job_id: &str) -> Result<Option<JobStatus>, BrokerError> {
        let mut conn = self.connection().await?;
        let map: HashMap<String, String> = conn
            .hgetall(Self::job_key(job_id))
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        if map.is_empty() {
            return Ok(None);
        }
        let job = Self::job_from_hash(&map)?;
        Ok(Some(JobStatus {
            state: job.state,
            result: job.result,
            error: job.error,
        }))
    }

    async fn request_cancel(&self, job_id: &str) -> Result<bool, BrokerError> {
        let mut conn = self.connection().await?;
        let map: HashMap<String, String> = conn
            .hgetall(Self::job_key(job_id))
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        if map.is_empty() {
            return Ok(false);
        }
        let state: JobState = map
            .get("state")
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| BrokerError::Corrupt("missing state".to_string()))?;
        if state.is_terminal() {
            return Ok(false);
        }
        let _: () = conn
            .hset(Self::job_key(job_id), "cancel", "1")
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        Ok(true)
    }

    async fn cancel_requested(&self, job_id: &str) -> Result<bool, BrokerError> {
        let mut conn = self.connection().await?;
        let flag: Option<String> = conn
            .hget(Self::job_key(job_id), "cancel")
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        Ok(flag.as_deref() == Some("1"))
    }

    async fn reclaim_expired(&self) -> Result<u64, BrokerError> {
        let now = Utc::now();
        let mut conn = self.connection().await?;
        let expired: Vec<String> = conn
            .zrangebyscore(LEASES_KEY, 0, now.timestamp_millis())
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        let mut reclaimed = 0;
        for id in expired {
            let message = "lease expired without completion";
            let terminal = Self::event_body(
                &JobOutcome::Failed {
                    kind: JobErrorKind::BrokerError,
                    message: message.to_string(),
                }
                .terminal_event(),
            );
            let disposition: i64 = Script::new(RECLAIM_SCRIPT)
                .key(Self::job_key(&id))
                .key(Self::progress_key(&id))
                .key(LEASES_KEY)
                .key(QUEUE_KEY)
                .arg(&id)
                .arg(now.timestamp_millis())
                .arg(terminal)
                .arg(self.retention.as_secs())
                .arg(message)
                .invoke_async(&mut conn)
                .await
                .map_err(|e| BrokerError::Connection(e.to_string()))?;
            if disposition > 0 {
                warn!(job_id = %id, requeued = disposition == 1, "Reclaimed expired lease");
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }
}
