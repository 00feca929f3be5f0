// backend/tests/orchestrator_tests.rs
//
// State-machine tests for the orchestrator: scripted model and executor,
// in-memory broker, real schema inspection over a temp data directory.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::watch;

use tabula_backend::broker::{Broker, MemoryBroker};
use tabula_backend::config::Config;
use tabula_backend::llm::{ChatMessage, ChatRole, ModelClient, ModelError};
use tabula_backend::models::jobs::{Job, JobErrorKind, JobState, Lease, NewJob, Phase};
use tabula_backend::services::executor::{CodeExecutor, ExecError, ExecutionOutcome};
use tabula_backend::services::inflation::InflationCache;
use tabula_backend::services::orchestrator::{Orchestrator, RunError};

// --- Scripted collaborators --------------------------------------------------

struct ScriptedModel {
    replies: Mutex<VecDeque<Result<String, ModelError>>>,
    delay: Duration,
    requests: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedModel {
    fn new(replies: Vec<Result<String, ModelError>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            delay: Duration::ZERO,
            requests: Mutex::new(Vec::new()),
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn first_request(&self) -> Vec<ChatMessage> {
        self.requests.lock().unwrap().first().cloned().unwrap()
    }
}

#[async_trait]
impl ModelClient for ScriptedModel {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, ModelError> {
        self.requests.lock().unwrap().push(messages.to_vec());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok("I have no further ideas.".to_string()))
    }
}

struct ScriptedExecutor {
    outcomes: Mutex<VecDeque<Result<ExecutionOutcome, ExecError>>>,
}

impl ScriptedExecutor {
    fn new(outcomes: Vec<Result<ExecutionOutcome, ExecError>>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.into()),
        }
    }

    fn success(stdout: &str, duration: Duration) -> ExecutionOutcome {
        ExecutionOutcome {
            stdout: stdout.to_string(),
            stderr: String::new(),
            exit_status: Some(0),
            final_value: stdout
                .lines()
                .rev()
                .find(|l| !l.trim().is_empty())
                .map(str::to_string),
            duration,
        }
    }

    fn failure(stderr: &str) -> ExecutionOutcome {
        ExecutionOutcome {
            stdout: String::new(),
            stderr: stderr.to_string(),
            exit_status: Some(1),
            final_value: None,
            duration: Duration::from_millis(30),
        }
    }
}

#[async_trait]
impl CodeExecutor for ScriptedExecutor {
    async fn execute(&self, _code: &str, _timeout: Duration) -> Result<ExecutionOutcome, ExecError> {
        self.outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(ScriptedExecutor::success("ok", Duration::from_millis(10))))
    }
}

// --- Harness -----------------------------------------------------------------

struct Harness {
    broker: Arc<MemoryBroker>,
    orchestrator: Orchestrator,
    _data_dir: tempfile::TempDir,
}

fn code_reply(code: &str) -> Result<String, ModelError> {
    Ok(format!("```python\n{code}\n```"))
}

fn harness(
    model: Arc<ScriptedModel>,
    executor: Arc<ScriptedExecutor>,
    tune: impl FnOnce(&mut Config),
) -> Harness {
    let data_dir = tempfile::tempdir().unwrap();
    std::fs::write(
        data_dir.path().join("prices.csv"),
        "Avg_Price\n110.92\n127.24\n101.71\n112.48\n113.50\n",
    )
    .unwrap();

    let mut config = Config {
        data_dir: data_dir.path().to_path_buf(),
        ..Config::default()
    };
    tune(&mut config);
    let config = Arc::new(config);

    let broker = Arc::new(MemoryBroker::new(
        config.lease_duration(),
        config.max_job_attempts,
    ));
    let inflation = Arc::new(InflationCache::new(
        data_dir.path().join("inflation.json"),
        "http://127.0.0.1:1/unreachable",
        30,
        Duration::from_millis(200),
    ));
    let orchestrator = Orchestrator::new(broker.clone(), model, executor, inflation, config);
    Harness {
        broker,
        orchestrator,
        _data_dir: data_dir,
    }
}

async fn submit_and_reserve(broker: &MemoryBroker, question: &str) -> (String, Job, Lease) {
    let id = broker
        .submit(NewJob::new(question, Some("prices.csv".to_string())))
        .await
        .unwrap();
    let (job, lease) = broker
        .reserve(Duration::from_millis(100))
        .await
        .unwrap()
        .expect("job reservable");
    (id, job, lease)
}

fn no_shutdown() -> watch::Receiver<bool> {
    // A receiver keeps serving the last value after the sender is gone.
    let (_tx, rx) = watch::channel(false);
    rx
}

// --- Tests -------------------------------------------------------------------

#[tokio::test]
async fn happy_path_ends_succeeded_with_phases_in_order() {
    let model = Arc::new(ScriptedModel::new(vec![
        code_reply("print(112.48)"),
        Ok("The median Avg_Price is 112.48.".to_string()),
    ]));
    let executor = Arc::new(ScriptedExecutor::new(vec![Ok(ScriptedExecutor::success(
        "112.48",
        Duration::from_millis(20),
    ))]));
    let h = harness(model, executor, |_| {});

    let (id, job, lease) = submit_and_reserve(&h.broker, "what is the median Avg_Price?").await;
    h.orchestrator.run(job, lease, no_shutdown()).await.unwrap();

    let status = h.broker.status(&id).await.unwrap().unwrap();
    assert_eq!(status.state, JobState::Succeeded);
    assert!(status.result.unwrap().contains("112.48"));

    let phases: Vec<Phase> = h
        .broker
        .subscribe_progress(&id, 1)
        .await
        .unwrap()
        .map(|e| e.unwrap().phase)
        .collect()
        .await;
    assert_eq!(
        phases,
        vec![
            Phase::Queued,
            Phase::LoadingContext,
            Phase::Prompting,
            Phase::GeneratingCode,
            Phase::ExecutingCode,
            Phase::GeneratingCode,
            Phase::Summarizing,
            Phase::Completed,
        ]
    );
}

#[tokio::test]
async fn prompt_carries_question_schema_and_loader_instructions() {
    let model = Arc::new(ScriptedModel::new(vec![Ok("The answer is 5.".to_string())]));
    let executor = Arc::new(ScriptedExecutor::new(vec![]));
    let h = harness(model.clone(), executor, |_| {});

    let (_, job, lease) = submit_and_reserve(&h.broker, "how many rows are there?").await;
    h.orchestrator.run(job, lease, no_shutdown()).await.unwrap();

    let request = model.first_request();
    assert_eq!(request[0].role, ChatRole::System);
    assert!(request[0].content.contains("tabula-load"));
    assert_eq!(request[1].role, ChatRole::User);
    assert!(request[1].content.contains("how many rows are there?"));
    assert!(request[1].content.contains("prices.csv"));
    assert!(request[1].content.contains("Avg_Price"));
    assert!(request[1].content.contains("primary file"));
}

#[tokio::test]
async fn code_failure_is_an_observation_not_a_job_failure() {
    // Round 1: bad code; round 2: good code; round 3: final answer.
    let model = Arc::new(ScriptedModel::new(vec![
        code_reply("print(pdd.median())"),
        code_reply("print(112.48)"),
        Ok("The mean of the numeric column is 112.48.".to_string()),
    ]));
    let executor = Arc::new(ScriptedExecutor::new(vec![
        Ok(ScriptedExecutor::failure(
            "NameError: name 'pdd' is not defined",
        )),
        Ok(ScriptedExecutor::success("112.48", Duration::from_millis(20))),
    ]));
    let h = harness(model.clone(), executor, |_| {});

    let (id, job, lease) = submit_and_reserve(&h.broker, "mean of the numeric column?").await;
    h.orchestrator.run(job, lease, no_shutdown()).await.unwrap();

    let status = h.broker.status(&id).await.unwrap().unwrap();
    assert_eq!(status.state, JobState::Succeeded, "error: {:?}", status.error);
    assert!(status.result.unwrap().contains("112.48"));

    // The failure came back to the model as an observation.
    let requests = model.requests.lock().unwrap();
    let second = &requests[1];
    let observation = &second.last().unwrap().content;
    assert!(observation.contains("NameError"));
    assert!(observation.contains("exited with status 1"));
}

#[tokio::test]
async fn round_limit_breach_is_terminal() {
    let model = Arc::new(ScriptedModel::new(
        (0..10).map(|i| code_reply(&format!("print({i})"))).collect(),
    ));
    let executor = Arc::new(ScriptedExecutor::new(vec![]));
    let h = harness(model, executor, |config| {
        config.max_rounds = 3;
    });

    let (id, job, lease) = submit_and_reserve(&h.broker, "loop forever").await;
    h.orchestrator.run(job, lease, no_shutdown()).await.unwrap();

    let status = h.broker.status(&id).await.unwrap().unwrap();
    assert_eq!(status.state, JobState::Failed);
    assert_eq!(status.error.unwrap().kind, JobErrorKind::RoundLimitExceeded);
}

#[tokio::test]
async fn wall_deadline_breach_is_terminal() {
    let model = Arc::new(ScriptedModel::new(vec![code_reply("print(1)")]));
    let executor = Arc::new(ScriptedExecutor::new(vec![]));
    let h = harness(model, executor, |config| {
        config.per_job_wall_timeout_secs = 0;
    });

    let (id, job, lease) = submit_and_reserve(&h.broker, "anything").await;
    h.orchestrator.run(job, lease, no_shutdown()).await.unwrap();

    let status = h.broker.status(&id).await.unwrap().unwrap();
    assert_eq!(status.state, JobState::Failed);
    assert_eq!(status.error.unwrap().kind, JobErrorKind::WallTimeout);
}

#[tokio::test]
async fn per_execution_timeout_is_terminal() {
    let model = Arc::new(ScriptedModel::new(vec![code_reply("while True: pass")]));
    let executor = Arc::new(ScriptedExecutor::new(vec![Err(ExecError::Timeout(
        Duration::from_secs(120),
    ))]));
    let h = harness(model, executor, |_| {});

    let (id, job, lease) = submit_and_reserve(&h.broker, "hang").await;
    h.orchestrator.run(job, lease, no_shutdown()).await.unwrap();

    let status = h.broker.status(&id).await.unwrap().unwrap();
    assert_eq!(status.state, JobState::Failed);
    assert_eq!(status.error.unwrap().kind, JobErrorKind::ExecutionTimeout);
}

#[tokio::test]
async fn cumulative_exec_budget_breach_is_terminal() {
    // Each execution is well under the per-exec ceiling, but together they
    // blow the 1-second budget.
    let model = Arc::new(ScriptedModel::new(
        (0..5).map(|i| code_reply(&format!("print({i})"))).collect(),
    ));
    let executor = Arc::new(ScriptedExecutor::new(
        (0..5)
            .map(|_| Ok(ScriptedExecutor::success("ok", Duration::from_millis(600))))
            .collect(),
    ));
    let h = harness(model, executor, |config| {
        config.per_job_exec_budget_secs = 1;
    });

    let (id, job, lease) = submit_and_reserve(&h.broker, "slow grind").await;
    h.orchestrator.run(job, lease, no_shutdown()).await.unwrap();

    let status = h.broker.status(&id).await.unwrap().unwrap();
    assert_eq!(status.state, JobState::Failed);
    assert_eq!(status.error.unwrap().kind, JobErrorKind::ExecBudgetExhausted);
}

#[tokio::test]
async fn cancel_lands_within_a_round_boundary() {
    // A slow model gives the cancel request a window mid-round.
    let model = Arc::new(
        ScriptedModel::new((0..5).map(|i| code_reply(&format!("print({i})"))).collect())
            .with_delay(Duration::from_millis(100)),
    );
    let executor = Arc::new(ScriptedExecutor::new(vec![]));
    let h = harness(model, executor, |_| {});

    let (id, job, lease) = submit_and_reserve(&h.broker, "long job").await;

    let broker = h.broker.clone();
    let watcher_id = id.clone();
    let canceler = tokio::spawn(async move {
        // Wait for the first generating-code event, then cancel.
        let mut stream = broker.subscribe_progress(&watcher_id, 1).await.unwrap();
        while let Some(Ok(event)) = stream.next().await {
            if event.phase == Phase::GeneratingCode {
                broker.request_cancel(&watcher_id).await.unwrap();
                break;
            }
        }
    });

    h.orchestrator.run(job, lease, no_shutdown()).await.unwrap();
    canceler.await.unwrap();

    let status = h.broker.status(&id).await.unwrap().unwrap();
    assert_eq!(status.state, JobState::Canceled);
    assert_eq!(status.error.unwrap().kind, JobErrorKind::Canceled);
}

#[tokio::test]
async fn model_transport_fault_requests_requeue() {
    let model = Arc::new(ScriptedModel::new(vec![Err(ModelError::Unavailable(
        "connection refused".to_string(),
    ))]));
    let executor = Arc::new(ScriptedExecutor::new(vec![]));
    let h = harness(model, executor, |_| {});

    let (id, job, lease) = submit_and_reserve(&h.broker, "q").await;
    let err = h
        .orchestrator
        .run(job, lease.clone(), no_shutdown())
        .await
        .unwrap_err();
    match err {
        RunError::Requeue { kind, .. } => assert_eq!(kind, JobErrorKind::ModelUnavailable),
        other => panic!("expected requeue, got {other:?}"),
    }

    // The worker's escalation path settles the job.
    h.broker
        .fail_and_requeue(&lease, JobErrorKind::ModelUnavailable, "connection refused")
        .await
        .unwrap();
    let status = h.broker.status(&id).await.unwrap().unwrap();
    assert_eq!(status.state, JobState::Failed);
    assert_eq!(status.error.unwrap().kind, JobErrorKind::ModelUnavailable);
}

#[tokio::test]
async fn model_protocol_fault_is_terminal() {
    let model = Arc::new(ScriptedModel::new(vec![Err(ModelError::Protocol(
        "completion has no message content".to_string(),
    ))]));
    let executor = Arc::new(ScriptedExecutor::new(vec![]));
    let h = harness(model, executor, |_| {});

    let (id, job, lease) = submit_and_reserve(&h.broker, "q").await;
    h.orchestrator.run(job, lease, no_shutdown()).await.unwrap();

    let status = h.broker.status(&id).await.unwrap().unwrap();
    assert_eq!(status.state, JobState::Failed);
    assert_eq!(status.error.unwrap().kind, JobErrorKind::ModelProtocolError);
}

#[tokio::test]
async fn missing_primary_file_is_terminal_not_found() {
    let model = Arc::new(ScriptedModel::new(vec![]));
    let executor = Arc::new(ScriptedExecutor::new(vec![]));
    let h = harness(model, executor, |_| {});

    let id = h
        .broker
        .submit(NewJob::new("q", Some("ghost.csv".to_string())))
        .await
        .unwrap();
    let (job, lease) = h
        .broker
        .reserve(Duration::from_millis(100))
        .await
        .unwrap()
        .unwrap();
    h.orchestrator.run(job, lease, no_shutdown()).await.unwrap();

    let status = h.broker.status(&id).await.unwrap().unwrap();
    assert_eq!(status.state, JobState::Failed);
    assert_eq!(status.error.unwrap().kind, JobErrorKind::NotFound);
}

#[tokio::test]
async fn inflation_question_injects_summary_into_prompt() {
    let model = Arc::new(ScriptedModel::new(vec![Ok(
        "About $153.74 in 2026 dollars.".to_string()
    )]));
    let executor = Arc::new(ScriptedExecutor::new(vec![]));
    let h = harness(model.clone(), executor, |_| {});

    let (id, job, lease) =
        submit_and_reserve(&h.broker, "a $119.85 price in 2019 adjusted to 2026").await;
    h.orchestrator.run(job, lease, no_shutdown()).await.unwrap();

    let status = h.broker.status(&id).await.unwrap().unwrap();
    assert_eq!(status.state, JobState::Succeeded);

    // The unreachable source leaves the cache empty; the prompt still gets
    // the assumed-rate summary block instead of failing the job.
    let request = model.first_request();
    assert!(request[1].content.contains("inflation")
        || request[1].content.contains("annual rate"));
}
