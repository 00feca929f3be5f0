// backend/src/services/orchestrator/mod.rs
//
// Drives a single job from RESERVED to terminal:
//
//   prepare  -> context      (deadline installed, lease ticker running)
//   context  -> generate     (prompt assembled)
//   generate -> execute      (model returned a code block)
//   generate -> summarize    (model returned a textual answer)
//   execute  -> generate     (observation fed back)
//   summarize-> done
//   any      -> canceled | error
//
// The one discipline that matters most: an exception inside generated code
// is an observation fed back to the model, never a job failure. Only the
// orchestrator's own bounds (rounds, per-exec timeout, exec budget, wall
// clock, model-request timeout), cancellation, and transport faults are
// terminal here.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::broker::{with_backoff, Broker, BrokerError};
use crate::config::Config;
use crate::llm::{parse_reply, ChatMessage, ModelClient, ModelError, ModelReply};
use crate::loader::FileLoader;
use crate::models::files::list_data_files;
use crate::models::jobs::{
    Job, JobErrorKind, JobOutcome, Lease, Phase, ProgressUpdate,
};
use crate::prompt_builder::{self, PromptContext};
use crate::services::executor::{CodeExecutor, ExecError};
use crate::services::inflation::InflationCache;
use crate::services::schema_inspector::SchemaInspector;

/// Characters of execution output carried in a progress event.
const PROGRESS_TAIL_CHARS: usize = 400;

/// Remaining wall time granted to an in-flight job once shutdown begins.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(60);

/// Consecutive lease-extension failures before the job is abandoned.
const MAX_EXTEND_FAILURES: u32 = 3;

/// Why a run could not reach its own terminal write.
#[derive(Debug)]
pub enum RunError {
    /// Transport-level fault; the worker should nack so another attempt can
    /// happen.
    Requeue { kind: JobErrorKind, reason: String },
    /// The lease was reclaimed; abandon without touching the job.
    LeaseLost,
    /// The broker stayed down through backoff.
    Broker(BrokerError),
}

impl From<BrokerError> for RunError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::LeaseLost(_) => RunError::LeaseLost,
            other => RunError::Broker(other),
        }
    }
}

/// How the generate/execute loop left things.
enum LoopVerdict {
    Answer(String),
    Bounded(JobErrorKind, String),
    Canceled,
}

pub struct Orchestrator {
    broker: Arc<dyn Broker>,
    model: Arc<dyn ModelClient>,
    executor: Arc<dyn CodeExecutor>,
    inflation: Arc<InflationCache>,
    config: Arc<Config>,
}

impl Orchestrator {
    pub fn new(
        broker: Arc<dyn Broker>,
        model: Arc<dyn ModelClient>,
        executor: Arc<dyn CodeExecutor>,
        inflation: Arc<InflationCache>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            broker,
            model,
            executor,
            inflation,
            config,
        }
    }

    /// Run one reserved job to its terminal write.
    #[instrument(skip(self, job, lease, shutdown), fields(job_id = %job.id, attempt = job.attempts))]
    pub async fn run(
        &self,
        job: Job,
        lease: Lease,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), RunError> {
        // prepare: overall deadline, lease-extension ticker.
        let mut deadline = Instant::now() + self.config.per_job_wall_timeout();
        let abandoned = Arc::new(AtomicBool::new(false));
        let ticker = self.spawn_lease_ticker(lease.clone(), Arc::clone(&abandoned));

        let result = self
            .run_inner(&job, &lease, &mut deadline, &mut shutdown, &abandoned)
            .await;

        ticker.abort();
        result
    }

    async fn run_inner(
        &self,
        job: &Job,
        lease: &Lease,
        deadline: &mut Instant,
        shutdown: &mut watch::Receiver<bool>,
        abandoned: &Arc<AtomicBool>,
    ) -> Result<(), RunError> {
        self.broker.mark_running(lease).await?;

        if self.boundary_canceled(job, lease, deadline, shutdown, abandoned).await? {
            return self
                .finish(
                    lease,
                    JobOutcome::Canceled {
                        message: "canceled by client request".to_string(),
                    },
                )
                .await;
        }

        // context
        self.publish(
            &job.id,
            ProgressUpdate::new(Phase::LoadingContext, "inspecting data files"),
        )
        .await?;

        let messages = match self.assemble_context(job).await {
            Ok(messages) => messages,
            Err((kind, message)) => {
                return self
                    .finish(lease, JobOutcome::Failed { kind, message })
                    .await;
            }
        };

        self.publish(&job.id, ProgressUpdate::new(Phase::Prompting, "prompt assembled"))
            .await?;

        let verdict = self
            .generate_execute_loop(job, lease, messages, deadline, shutdown, abandoned)
            .await?;

        match verdict {
            LoopVerdict::Answer(result) => {
                self.publish(
                    &job.id,
                    ProgressUpdate::new(Phase::Summarizing, "final answer captured"),
                )
                .await?;
                self.finish(lease, JobOutcome::Succeeded { result }).await
            }
            LoopVerdict::Bounded(kind, message) => {
                self.finish(lease, JobOutcome::Failed { kind, message }).await
            }
            LoopVerdict::Canceled => {
                self.finish(
                    lease,
                    JobOutcome::Canceled {
                        message: "canceled by client request".to_string(),
                    },
                )
                .await
            }
        }
    }

    /// The generate <-> execute rounds.
    async fn generate_execute_loop(
        &self,
        job: &Job,
        lease: &Lease,
        mut messages: Vec<ChatMessage>,
        deadline: &mut Instant,
        shutdown: &mut watch::Receiver<bool>,
        abandoned: &Arc<AtomicBool>,
    ) -> Result<LoopVerdict, RunError> {
        let mut exec_spent = Duration::ZERO;

        for round in 1..=self.config.max_rounds {
            if self.boundary_canceled(job, lease, deadline, shutdown, abandoned).await? {
                return Ok(LoopVerdict::Canceled);
            }
            if Instant::now() >= *deadline {
                return Ok(LoopVerdict::Bounded(
                    JobErrorKind::WallTimeout,
                    format!(
                        "job exceeded its {}s wall-clock ceiling",
                        self.config.per_job_wall_timeout_secs
                    ),
                ));
            }

            self.publish(
                &job.id,
                ProgressUpdate::new(Phase::GeneratingCode, format!("model round {round}")),
            )
            .await?;

            let remaining = deadline.saturating_duration_since(Instant::now());
            let request_timeout = self.config.per_model_request_timeout().min(remaining);
            let content = match tokio::time::timeout(
                request_timeout,
                self.model.complete(&messages),
            )
            .await
            {
                Ok(Ok(content)) => content,
                Ok(Err(ModelError::Protocol(detail))) => {
                    return Ok(LoopVerdict::Bounded(JobErrorKind::ModelProtocolError, detail));
                }
                Ok(Err(err @ (ModelError::Unavailable(_) | ModelError::Timeout(_)))) => {
                    return Err(RunError::Requeue {
                        kind: JobErrorKind::ModelUnavailable,
                        reason: err.to_string(),
                    });
                }
                Err(_) => {
                    return Err(RunError::Requeue {
                        kind: JobErrorKind::ModelUnavailable,
                        reason: format!(
                            "model request exceeded {}s",
                            request_timeout.as_secs()
                        ),
                    });
                }
            };

            if content.trim().is_empty() {
                return Ok(LoopVerdict::Bounded(
                    JobErrorKind::ModelProtocolError,
                    "model returned an empty reply".to_string(),
                ));
            }

            match parse_reply(&content) {
                ModelReply::Answer(answer) => {
                    debug!(round, "Model produced a textual answer");
                    return Ok(LoopVerdict::Answer(answer));
                }
                ModelReply::CodeBlock(code) => {
                    // A model request may have run across the cancel; its
                    // output is discarded here if cancellation came first.
                    if self.boundary_canceled(job, lease, deadline, shutdown, abandoned).await? {
                        return Ok(LoopVerdict::Canceled);
                    }

                    if exec_spent >= self.config.per_job_exec_budget() {
                        return Ok(LoopVerdict::Bounded(
                            JobErrorKind::ExecBudgetExhausted,
                            format!(
                                "cumulative execution time {}s exceeded the {}s budget",
                                exec_spent.as_secs(),
                                self.config.per_job_exec_budget_secs
                            ),
                        ));
                    }

                    messages.push(ChatMessage::assistant(&content));
                    let outcome = match self
                        .executor
                        .execute(&code, self.config.per_exec_timeout())
                        .await
                    {
                        Ok(outcome) => outcome,
                        Err(ExecError::Timeout(limit)) => {
                            return Ok(LoopVerdict::Bounded(
                                JobErrorKind::ExecutionTimeout,
                                format!("code execution exceeded {}s", limit.as_secs()),
                            ));
                        }
                        Err(err) => {
                            return Ok(LoopVerdict::Bounded(
                                JobErrorKind::Internal,
                                format!("code execution tool failed: {err}"),
                            ));
                        }
                    };

                    exec_spent += outcome.duration;
                    self.publish(
                        &job.id,
                        ProgressUpdate::with_output(
                            Phase::ExecutingCode,
                            format!(
                                "round {round} executed in {:.1}s (exit {})",
                                outcome.duration.as_secs_f64(),
                                outcome
                                    .exit_status
                                    .map_or("?".to_string(), |c| c.to_string()),
                            ),
                            outcome.output_tail(PROGRESS_TAIL_CHARS),
                        ),
                    )
                    .await?;

                    if exec_spent > self.config.per_job_exec_budget() {
                        return Ok(LoopVerdict::Bounded(
                            JobErrorKind::ExecBudgetExhausted,
                            format!(
                                "cumulative execution time {}s exceeded the {}s budget",
                                exec_spent.as_secs(),
                                self.config.per_job_exec_budget_secs
                            ),
                        ));
                    }

                    // Failures inside generated code are observations, not
                    // job failures; the model gets to correct itself.
                    messages.push(ChatMessage::user(observation_message(&outcome)));
                }
            }
        }

        Ok(LoopVerdict::Bounded(
            JobErrorKind::RoundLimitExceeded,
            format!(
                "no final answer after {} model rounds",
                self.config.max_rounds
            ),
        ))
    }

    /// Enumerate files, derive schemas, pull inflation context when needed,
    /// and produce the opening conversation. A context-assembly fault is
    /// terminal with the loader's own error kind.
    async fn assemble_context(
        &self,
        job: &Job,
    ) -> Result<Vec<ChatMessage>, (JobErrorKind, String)> {
        let data_dir = self.config.data_dir.clone();
        let files = list_data_files(&data_dir).map_err(|e| {
            (
                JobErrorKind::Internal,
                format!("cannot list data directory: {e}"),
            )
        })?;
        if files.is_empty() {
            return Err((
                JobErrorKind::InputRejected,
                "no data files available".to_string(),
            ));
        }
        if let Some(primary) = &job.primary_file {
            if !files.iter().any(|f| &f.name == primary) {
                return Err((
                    JobErrorKind::NotFound,
                    format!("primary file '{primary}' not found"),
                ));
            }
        }

        let loader = FileLoader::new(self.config.max_file_bytes);
        let inspector = SchemaInspector::new(loader);
        let (schemas, failures) = inspector
            .inspect_dir(&data_dir)
            .map_err(|e| (JobErrorKind::Internal, format!("inspection failed: {e}")))?;

        // The primary file failing to parse is unrecoverable during context
        // assembly; other files degrade to a prompt note.
        if let Some(primary) = &job.primary_file {
            if let Some((_, err)) = failures.iter().find(|(name, _)| name == primary) {
                return Err((err.job_error_kind(), err.to_string()));
            }
        }
        let failure_notes: Vec<(String, String)> = failures
            .iter()
            .map(|(name, err)| (name.clone(), err.to_string()))
            .collect();

        let inflation_summary = match prompt_builder::detect_inflation_span(&job.question) {
            Some((start, end)) => {
                let snapshot = self.inflation.refresh(false).await;
                if snapshot.stale {
                    warn!("Serving stale inflation table to prompt");
                }
                Some(snapshot.table.summary(start, end))
            }
            None => None,
        };

        let ctx = PromptContext {
            question: &job.question,
            primary_file: job.primary_file.as_deref(),
            files: &files,
            schemas: &schemas,
            schema_failures: &failure_notes,
            inflation_summary: inflation_summary.as_deref(),
        };

        Ok(vec![
            ChatMessage::system(prompt_builder::build_system_prompt()),
            ChatMessage::user(prompt_builder::build_user_prompt(&ctx)),
        ])
    }

    /// Boundary check: abandoned lease, shutdown clamp, cancellation. On a
    /// cancel the terminal write happens here and `true` comes back.
    async fn boundary_canceled(
        &self,
        job: &Job,
        _lease: &Lease,
        deadline: &mut Instant,
        shutdown: &mut watch::Receiver<bool>,
        abandoned: &Arc<AtomicBool>,
    ) -> Result<bool, RunError> {
        if abandoned.load(Ordering::SeqCst) {
            warn!(job_id = %job.id, "Lease abandoned; giving up the job");
            return Err(RunError::LeaseLost);
        }
        if *shutdown.borrow() {
            let clamped = Instant::now() + SHUTDOWN_GRACE;
            if clamped < *deadline {
                info!(job_id = %job.id, "Shutdown in progress; shortening job deadline");
                *deadline = clamped;
            }
        }
        let canceled = self.broker.cancel_requested(&job.id).await?;
        Ok(canceled)
    }

    async fn publish(&self, job_id: &str, update: ProgressUpdate) -> Result<u64, RunError> {
        let broker = Arc::clone(&self.broker);
        let job_id = job_id.to_string();
        with_backoff("publish_progress", || {
            let broker = Arc::clone(&broker);
            let job_id = job_id.clone();
            let update = update.clone();
            async move { broker.publish_progress(&job_id, update).await }
        })
        .await
        .map_err(RunError::from)
    }

    /// The single terminal write.
    async fn finish(&self, lease: &Lease, outcome: JobOutcome) -> Result<(), RunError> {
        let broker = Arc::clone(&self.broker);
        let lease = lease.clone();
        let state = outcome.terminal_state();
        with_backoff("complete", || {
            let broker = Arc::clone(&broker);
            let lease = lease.clone();
            let outcome = outcome.clone();
            async move { broker.complete(&lease, outcome).await }
        })
        .await?;
        info!(job_id = %lease.job_id, %state, "Job reached terminal state");
        Ok(())
    }

    /// Extend the lease at the configured cadence. Repeated failure flips
    /// the abandoned flag; the broker will reclaim the job.
    fn spawn_lease_ticker(
        &self,
        lease: Lease,
        abandoned: Arc<AtomicBool>,
    ) -> tokio::task::JoinHandle<()> {
        let broker = Arc::clone(&self.broker);
        let interval = self.config.lease_extension_interval();
        let duration = self.config.lease_duration();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // first tick fires immediately
            let mut failures = 0u32;
            loop {
                ticker.tick().await;
                match broker.extend(&lease, duration).await {
                    Ok(_) => failures = 0,
                    Err(BrokerError::LeaseLost(_)) => {
                        error!(job_id = %lease.job_id, "Lease reclaimed while running");
                        abandoned.store(true, Ordering::SeqCst);
                        return;
                    }
                    Err(err) => {
                        failures += 1;
                        warn!(
                            job_id = %lease.job_id,
                            failures,
                            error = %err,
                            "Lease extension failed"
                        );
                        if failures >= MAX_EXTEND_FAILURES {
                            abandoned.store(true, Ordering::SeqCst);
                            return;
                        }
                    }
                }
            }
        })
    }
}

/// Render an execution outcome as the observation fed back to the model.
fn observation_message(outcome: &crate::services::executor::ExecutionOutcome) -> String {
    let mut text = String::from("Observation from executing your code:\n");
    match outcome.exit_status {
        Some(0) => text.push_str("The code ran to completion.\n"),
        Some(code) => {
            writeln!(text, "The code exited with status {code}.")
                .expect("writing to String cannot fail");
        }
        None => text.push_str("The process was terminated by a signal.\n"),
    }
    if !outcome.stdout.trim().is_empty() {
        writeln!(text, "stdout:\n{}", outcome.stdout.trim_end())
            .expect("writing to String cannot fail");
    }
    if !outcome.stderr.trim().is_empty() {
        writeln!(text, "stderr:\n{}", outcome.stderr.trim_end())
            .expect("writing to String cannot fail");
    }
    if let Some(final_value) = &outcome.final_value {
        writeln!(text, "final value: {final_value}").expect("writing to String cannot fail");
    }
    text.push_str(
        "If this answers the question, reply with plain text and no code \
         block. Otherwise reply with a corrected code block.\n",
    );
    text
}
