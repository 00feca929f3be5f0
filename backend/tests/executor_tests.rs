// backend/tests/executor_tests.rs
//
// Subprocess sandbox behavior, using /bin/sh as the interpreter so the
// suite has no Python dependency.

use std::time::Duration;

use tabula_backend::services::executor::{CodeExecutor, ExecError, SandboxExecutor};

fn sh_executor(dir: &std::path::Path) -> SandboxExecutor {
    SandboxExecutor::new(dir.join("sandbox"), "sh", dir.join("data"))
}

#[tokio::test]
async fn captures_stdout_and_final_value() {
    let dir = tempfile::tempdir().unwrap();
    let executor = sh_executor(dir.path());
    let outcome = executor
        .execute("echo first\necho 112.48\n", Duration::from_secs(5))
        .await
        .unwrap();
    assert!(outcome.succeeded());
    assert!(outcome.stdout.contains("first"));
    assert_eq!(outcome.final_value.as_deref(), Some("112.48"));
}

#[tokio::test]
async fn nonzero_exit_is_an_outcome_not_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let executor = sh_executor(dir.path());
    let outcome = executor
        .execute("echo boom >&2\nexit 3\n", Duration::from_secs(5))
        .await
        .unwrap();
    assert!(!outcome.succeeded());
    assert_eq!(outcome.exit_status, Some(3));
    assert!(outcome.stderr.contains("boom"));
}

#[tokio::test]
async fn timeout_kills_the_process() {
    let dir = tempfile::tempdir().unwrap();
    let executor = sh_executor(dir.path());
    let started = std::time::Instant::now();
    let err = executor
        .execute("sleep 10\n", Duration::from_millis(200))
        .await
        .unwrap_err();
    assert!(matches!(err, ExecError::Timeout(_)));
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn missing_interpreter_is_a_spawn_error() {
    let dir = tempfile::tempdir().unwrap();
    let executor = SandboxExecutor::new(
        dir.path().join("sandbox"),
        "definitely-not-an-interpreter",
        dir.path().join("data"),
    );
    let err = executor
        .execute("echo hi\n", Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(matches!(err, ExecError::Spawn(_)));
}

#[tokio::test]
async fn data_dir_is_exposed_to_the_snippet() {
    let dir = tempfile::tempdir().unwrap();
    let executor = sh_executor(dir.path());
    let outcome = executor
        .execute("echo \"$TABULA_DATA_DIR\"\n", Duration::from_secs(5))
        .await
        .unwrap();
    assert!(outcome.stdout.contains("data"));
}
