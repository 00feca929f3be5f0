// backend/src/services/executor.rs
//
// The code-execution tool. Generated code runs as a subprocess in the
// sandbox directory; the orchestrator owns its lifetime through the timeout
// it passes in. A crashing snippet is a normal outcome here, not an error:
// only spawn failures and timeouts are `ExecError`.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum ExecError {
    #[error("failed to start sandbox process: {0}")]
    Spawn(String),

    #[error("execution exceeded {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// The RPC-shaped result of running one code block.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub stdout: String,
    pub stderr: String,
    pub exit_status: Option<i32>,
    /// Last non-empty stdout line; the snippet's de-facto final value.
    pub final_value: Option<String>,
    pub duration: Duration,
}

impl ExecutionOutcome {
    pub fn succeeded(&self) -> bool {
        self.exit_status == Some(0)
    }

    /// A short tail of captured output for progress events.
    pub fn output_tail(&self, max_chars: usize) -> String {
        let combined = if self.stderr.trim().is_empty() {
            self.stdout.trim_end()
        } else {
            self.stderr.trim_end()
        };
        if combined.len() <= max_chars {
            combined.to_string()
        } else {
            let start = combined.len() - max_chars;
            // Avoid splitting a UTF-8 sequence.
            let start = (start..combined.len())
                .find(|i| combined.is_char_boundary(*i))
                .unwrap_or(combined.len());
            format!("…{}", &combined[start..])
        }
    }
}

#[async_trait]
pub trait CodeExecutor: Send + Sync {
    async fn execute(&self, code: &str, timeout: Duration) -> Result<ExecutionOutcome, ExecError>;
}

/// Runs snippets with the configured interpreter inside the sandbox
/// directory, killed hard at the timeout.
pub struct SandboxExecutor {
    sandbox_dir: PathBuf,
    command: String,
    data_dir: PathBuf,
}

impl SandboxExecutor {
    pub fn new(
        sandbox_dir: impl Into<PathBuf>,
        command: impl Into<String>,
        data_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            sandbox_dir: sandbox_dir.into(),
            command: command.into(),
            data_dir: data_dir.into(),
        }
    }
}

#[async_trait]
impl CodeExecutor for SandboxExecutor {
    #[instrument(skip(self, code), fields(bytes = code.len()))]
    async fn execute(&self, code: &str, timeout: Duration) -> Result<ExecutionOutcome, ExecError> {
        tokio::fs::create_dir_all(&self.sandbox_dir).await?;
        let snippet_path = self
            .sandbox_dir
            .join(format!("snippet-{}.py", Uuid::new_v4()));
        tokio::fs::write(&snippet_path, code).await?;

        let started = Instant::now();
        let child = Command::new(&self.command)
            .arg(&snippet_path)
            .current_dir(&self.sandbox_dir)
            .env("TABULA_DATA_DIR", &self.data_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExecError::Spawn(format!("{}: {e}", self.command)))?;

        let result = tokio::time::timeout(timeout, child.wait_with_output()).await;
        let _ = tokio::fs::remove_file(&snippet_path).await;

        let output = match result {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(ExecError::Io(e)),
            Err(_) => {
                // Dropping the timed-out future kills the child.
                warn!(timeout_secs = timeout.as_secs(), "Sandbox execution timed out");
                return Err(ExecError::Timeout(timeout));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let final_value = stdout
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .map(|l| l.trim().to_string());
        let outcome = ExecutionOutcome {
            stdout,
            stderr,
            exit_status: output.status.code(),
            final_value,
            duration: started.elapsed(),
        };
        debug!(
            exit_status = ?outcome.exit_status,
            secs = outcome.duration.as_secs_f64(),
            "Sandbox execution finished"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_tail_prefers_stderr() {
        let outcome = ExecutionOutcome {
            stdout: "fine".to_string(),
            stderr: "Traceback: NameError".to_string(),
            exit_status: Some(1),
            final_value: None,
            duration: Duration::from_millis(5),
        };
        assert_eq!(outcome.output_tail(200), "Traceback: NameError");
    }

    #[test]
    fn output_tail_truncates_long_output() {
        let outcome = ExecutionOutcome {
            stdout: "x".repeat(500),
            stderr: String::new(),
            exit_status: Some(0),
            final_value: None,
            duration: Duration::from_millis(5),
        };
        let tail = outcome.output_tail(100);
        assert!(tail.starts_with('…'));
        assert_eq!(tail.chars().count(), 101);
    }
}
