// backend/src/models/jobs.rs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Lifecycle of a submitted analysis job.
///
/// Terminal states are absorbing: the broker enforces at-most-one terminal
/// transition per job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Pending,
    Reserved,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Canceled
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Pending => "PENDING",
            JobState::Reserved => "RESERVED",
            JobState::Running => "RUNNING",
            JobState::Succeeded => "SUCCEEDED",
            JobState::Failed => "FAILED",
            JobState::Canceled => "CANCELED",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(JobState::Pending),
            "RESERVED" => Ok(JobState::Reserved),
            "RUNNING" => Ok(JobState::Running),
            "SUCCEEDED" => Ok(JobState::Succeeded),
            "FAILED" => Ok(JobState::Failed),
            "CANCELED" => Ok(JobState::Canceled),
            other => Err(format!("unknown job state: {other}")),
        }
    }
}

/// Error kinds that can appear on a FAILED job record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobErrorKind {
    InputRejected,
    NotFound,
    UnsupportedFormat,
    MalformedCsv,
    MalformedJson,
    MalformedExcel,
    FileTooLarge,
    ModelUnavailable,
    ModelProtocolError,
    ExecutionTimeout,
    ExecBudgetExhausted,
    WallTimeout,
    RoundLimitExceeded,
    Canceled,
    BrokerError,
    Internal,
}

impl fmt::Display for JobErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobErrorKind::InputRejected => "InputRejected",
            JobErrorKind::NotFound => "NotFound",
            JobErrorKind::UnsupportedFormat => "UnsupportedFormat",
            JobErrorKind::MalformedCsv => "MalformedCsv",
            JobErrorKind::MalformedJson => "MalformedJson",
            JobErrorKind::MalformedExcel => "MalformedExcel",
            JobErrorKind::FileTooLarge => "FileTooLarge",
            JobErrorKind::ModelUnavailable => "ModelUnavailable",
            JobErrorKind::ModelProtocolError => "ModelProtocolError",
            JobErrorKind::ExecutionTimeout => "ExecutionTimeout",
            JobErrorKind::ExecBudgetExhausted => "ExecBudgetExhausted",
            JobErrorKind::WallTimeout => "WallTimeout",
            JobErrorKind::RoundLimitExceeded => "RoundLimitExceeded",
            JobErrorKind::Canceled => "Canceled",
            JobErrorKind::BrokerError => "BrokerError",
            JobErrorKind::Internal => "Internal",
        };
        f.write_str(s)
    }
}

/// Error payload on a FAILED job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: JobErrorKind,
    pub message: String,
}

/// A job submission before the broker has assigned identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    /// Caller-supplied id makes `submit` idempotent; `None` lets the broker
    /// assign one.
    pub id: Option<String>,
    pub question: String,
    pub primary_file: Option<String>,
}

impl NewJob {
    pub fn new(question: impl Into<String>, primary_file: Option<String>) -> Self {
        Self {
            id: None,
            question: question.into(),
            primary_file,
        }
    }
}

/// A job record as held by the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub question: String,
    pub primary_file: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub state: JobState,
    pub attempts: u32,
    pub max_attempts: u32,
    pub result: Option<String>,
    pub error: Option<JobError>,
}

/// Single-shot status read returned to API clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatus {
    pub state: JobState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
}

/// A worker's time-bounded exclusive hold on a reserved job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub job_id: String,
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn new_token() -> String {
        Uuid::new_v4().to_string()
    }
}

/// Phases of a job's progress stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    Queued,
    LoadingContext,
    Prompting,
    GeneratingCode,
    ExecutingCode,
    Summarizing,
    Completed,
    Failed,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Completed | Phase::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Queued => "queued",
            Phase::LoadingContext => "loading-context",
            Phase::Prompting => "prompting",
            Phase::GeneratingCode => "generating-code",
            Phase::ExecutingCode => "executing-code",
            Phase::Summarizing => "summarizing",
            Phase::Completed => "completed",
            Phase::Failed => "failed",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One ordered entry in a job's progress stream. `seq` is assigned by the
/// broker, strictly increasing from 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub seq: u64,
    pub at: DateTime<Utc>,
    pub phase: Phase,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partial_output: Option<String>,
}

/// What the orchestrator hands the broker; the broker stamps `seq` and `at`.
#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    pub phase: Phase,
    pub detail: String,
    pub partial_output: Option<String>,
}

impl ProgressUpdate {
    pub fn new(phase: Phase, detail: impl Into<String>) -> Self {
        Self {
            phase,
            detail: detail.into(),
            partial_output: None,
        }
    }

    pub fn with_output(phase: Phase, detail: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            phase,
            detail: detail.into(),
            partial_output: Some(output.into()),
        }
    }
}

/// Terminal outcome of a job run, applied by `Broker::complete`.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Succeeded { result: String },
    Failed { kind: JobErrorKind, message: String },
    Canceled { message: String },
}

impl JobOutcome {
    pub fn terminal_state(&self) -> JobState {
        match self {
            JobOutcome::Succeeded { .. } => JobState::Succeeded,
            JobOutcome::Failed { .. } => JobState::Failed,
            JobOutcome::Canceled { .. } => JobState::Canceled,
        }
    }

    /// The terminal progress event for this outcome. Cancellation reports
    /// under the "failed" phase so the progress stream stays within its
    /// closed phase set.
    pub fn terminal_event(&self) -> ProgressUpdate {
        match self {
            JobOutcome::Succeeded { result } => {
                ProgressUpdate::new(Phase::Completed, result.clone())
            }
            JobOutcome::Failed { kind, message } => {
                ProgressUpdate::new(Phase::Failed, format!("{kind}: {message}"))
            }
            JobOutcome::Canceled { message } => {
                ProgressUpdate::new(Phase::Failed, format!("Canceled: {message}"))
            }
        }
    }
}
