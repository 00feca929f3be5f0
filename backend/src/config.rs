// backend/src/config.rs

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Environment-driven configuration for the API server and the worker.
///
/// Every knob in the job-execution core is enumerated here; nothing reads
/// the environment directly.
#[derive(Deserialize, Clone)]
pub struct Config {
    /// Connection target for the backing queue/result store.
    #[serde(default = "default_broker_address")]
    pub broker_address: String,

    /// Location of the OpenAI-compatible language-model server.
    #[serde(default = "default_model_endpoint")]
    pub model_endpoint: String,
    #[serde(default = "default_model_name")]
    pub model_name: String,
    #[serde(default = "default_model_context_tokens")]
    pub model_context_tokens: usize,

    /// Directory containing uploaded data files (flat, no subdirectories).
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Sandbox working directory for generated-code execution.
    #[serde(default = "default_sandbox_dir")]
    pub sandbox_dir: PathBuf,
    /// Interpreter command run inside the sandbox.
    #[serde(default = "default_sandbox_command")]
    pub sandbox_command: String,

    // Inflation reference data
    #[serde(default = "default_inflation_cache_path")]
    pub inflation_cache_path: PathBuf,
    #[serde(default = "default_inflation_source_url")]
    pub inflation_source_url: String,
    #[serde(default = "default_inflation_refresh_max_age_days")]
    pub inflation_refresh_max_age_days: i64,
    #[serde(default = "default_inflation_fetch_timeout_secs")]
    pub inflation_fetch_timeout_secs: u64,

    // Worker / queue tuning
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    #[serde(default = "default_max_job_attempts")]
    pub max_job_attempts: u32,
    #[serde(default = "default_lease_duration_secs")]
    pub lease_duration_secs: u64,
    /// Defaults to half the lease duration when unset.
    pub lease_extension_interval_secs: Option<u64>,
    /// How long a finished job record is retained before expiry.
    #[serde(default = "default_job_retention_secs")]
    pub job_retention_secs: u64,

    // Orchestrator bounds
    #[serde(default = "default_per_exec_timeout_secs")]
    pub per_exec_timeout_secs: u64,
    #[serde(default = "default_per_job_exec_budget_secs")]
    pub per_job_exec_budget_secs: u64,
    #[serde(default = "default_per_job_wall_timeout_secs")]
    pub per_job_wall_timeout_secs: u64,
    #[serde(default = "default_per_model_request_timeout_secs")]
    pub per_model_request_timeout_secs: u64,
    #[serde(default = "default_max_rounds")]
    pub max_rounds: u32,

    // Loader bound
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,

    // Server config
    #[serde(default = "default_port")]
    pub port: u16,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("broker_address", &"[REDACTED]")
            .field("model_endpoint", &self.model_endpoint)
            .field("model_name", &self.model_name)
            .field("model_context_tokens", &self.model_context_tokens)
            .field("data_dir", &self.data_dir)
            .field("sandbox_dir", &self.sandbox_dir)
            .field("sandbox_command", &self.sandbox_command)
            .field("inflation_cache_path", &self.inflation_cache_path)
            .field("inflation_source_url", &self.inflation_source_url)
            .field(
                "inflation_refresh_max_age_days",
                &self.inflation_refresh_max_age_days,
            )
            .field("worker_count", &self.worker_count)
            .field("max_job_attempts", &self.max_job_attempts)
            .field("lease_duration_secs", &self.lease_duration_secs)
            .field(
                "lease_extension_interval_secs",
                &self.lease_extension_interval_secs,
            )
            .field("job_retention_secs", &self.job_retention_secs)
            .field("per_exec_timeout_secs", &self.per_exec_timeout_secs)
            .field("per_job_exec_budget_secs", &self.per_job_exec_budget_secs)
            .field("per_job_wall_timeout_secs", &self.per_job_wall_timeout_secs)
            .field(
                "per_model_request_timeout_secs",
                &self.per_model_request_timeout_secs,
            )
            .field("max_rounds", &self.max_rounds)
            .field("max_file_bytes", &self.max_file_bytes)
            .field("port", &self.port)
            .finish()
    }
}

fn default_broker_address() -> String {
    "redis://127.0.0.1:6379/0".to_string()
}
fn default_model_endpoint() -> String {
    "http://127.0.0.1:11434".to_string()
}
fn default_model_name() -> String {
    "llama3:8b".to_string()
}
const fn default_model_context_tokens() -> usize {
    8192
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("/app/data")
}
fn default_sandbox_dir() -> PathBuf {
    PathBuf::from("/app/sandbox")
}
fn default_sandbox_command() -> String {
    "python3".to_string()
}
fn default_inflation_cache_path() -> PathBuf {
    PathBuf::from("/app/cache/inflation_data.json")
}
fn default_inflation_source_url() -> String {
    "https://www.usinflationcalculator.com/inflation/historical-inflation-rates/".to_string()
}
const fn default_inflation_refresh_max_age_days() -> i64 {
    30
}
const fn default_inflation_fetch_timeout_secs() -> u64 {
    10
}
const fn default_worker_count() -> usize {
    1
}
const fn default_max_job_attempts() -> u32 {
    1
}
const fn default_lease_duration_secs() -> u64 {
    600
}
const fn default_job_retention_secs() -> u64 {
    3600
}
const fn default_per_exec_timeout_secs() -> u64 {
    120
}
const fn default_per_job_exec_budget_secs() -> u64 {
    600
}
const fn default_per_job_wall_timeout_secs() -> u64 {
    1800
}
const fn default_per_model_request_timeout_secs() -> u64 {
    600
}
const fn default_max_rounds() -> u32 {
    10
}
const fn default_max_file_bytes() -> u64 {
    100 * 1024 * 1024
}
const fn default_port() -> u16 {
    5001
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `anyhow::Error` when a variable is present but malformed.
    pub fn load() -> Result<Self, anyhow::Error> {
        envy::from_env::<Self>().map_err(anyhow::Error::from)
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.lease_duration_secs)
    }

    /// Lease-extension cadence; half the lease duration unless overridden.
    pub fn lease_extension_interval(&self) -> Duration {
        Duration::from_secs(
            self.lease_extension_interval_secs
                .unwrap_or(self.lease_duration_secs / 2)
                .max(1),
        )
    }

    pub fn per_exec_timeout(&self) -> Duration {
        Duration::from_secs(self.per_exec_timeout_secs)
    }

    pub fn per_job_exec_budget(&self) -> Duration {
        Duration::from_secs(self.per_job_exec_budget_secs)
    }

    pub fn per_job_wall_timeout(&self) -> Duration {
        Duration::from_secs(self.per_job_wall_timeout_secs)
    }

    pub fn per_model_request_timeout(&self) -> Duration {
        Duration::from_secs(self.per_model_request_timeout_secs)
    }

    pub fn inflation_fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.inflation_fetch_timeout_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            broker_address: default_broker_address(),
            model_endpoint: default_model_endpoint(),
            model_name: default_model_name(),
            model_context_tokens: default_model_context_tokens(),
            data_dir: default_data_dir(),
            sandbox_dir: default_sandbox_dir(),
            sandbox_command: default_sandbox_command(),
            inflation_cache_path: default_inflation_cache_path(),
            inflation_source_url: default_inflation_source_url(),
            inflation_refresh_max_age_days: default_inflation_refresh_max_age_days(),
            inflation_fetch_timeout_secs: default_inflation_fetch_timeout_secs(),
            worker_count: default_worker_count(),
            max_job_attempts: default_max_job_attempts(),
            lease_duration_secs: default_lease_duration_secs(),
            lease_extension_interval_secs: None,
            job_retention_secs: default_job_retention_secs(),
            per_exec_timeout_secs: default_per_exec_timeout_secs(),
            per_job_exec_budget_secs: default_per_job_exec_budget_secs(),
            per_job_wall_timeout_secs: default_per_job_wall_timeout_secs(),
            per_model_request_timeout_secs: default_per_model_request_timeout_secs(),
            max_rounds: default_max_rounds(),
            max_file_bytes: default_max_file_bytes(),
            port: default_port(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.max_job_attempts, 1);
        assert_eq!(config.lease_duration(), Duration::from_secs(600));
        assert_eq!(config.lease_extension_interval(), Duration::from_secs(300));
        assert_eq!(config.per_exec_timeout(), Duration::from_secs(120));
        assert_eq!(config.per_job_exec_budget(), Duration::from_secs(600));
        assert_eq!(config.per_job_wall_timeout(), Duration::from_secs(1800));
        assert_eq!(config.max_rounds, 10);
        assert_eq!(config.max_file_bytes, 100 * 1024 * 1024);
    }

    #[test]
    fn lease_extension_override_wins() {
        let config = Config {
            lease_extension_interval_secs: Some(45),
            ..Config::default()
        };
        assert_eq!(config.lease_extension_interval(), Duration::from_secs(45));
    }
}
