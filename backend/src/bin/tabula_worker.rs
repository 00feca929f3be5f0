// backend/src/bin/tabula_worker.rs
//
// Worker launcher: wires the broker, model client, sandbox executor, and
// inflation cache into the orchestrator and runs the worker pool until a
// shutdown signal arrives.

use std::sync::Arc;
use tokio::sync::watch;

use tabula_backend::broker::RedisBroker;
use tabula_backend::config::Config;
use tabula_backend::llm::OpenCompatClient;
use tabula_backend::logging::init_subscriber;
use tabula_backend::services::executor::SandboxExecutor;
use tabula_backend::services::inflation::InflationCache;
use tabula_backend::services::orchestrator::Orchestrator;
use tabula_backend::worker::WorkerPool;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    init_subscriber();

    tracing::info!("Starting Tabula worker...");

    let config = Arc::new(Config::load().expect("Failed to load configuration"));
    tracing::info!(config = ?config, "Configuration loaded");

    let broker = Arc::new(RedisBroker::new(
        &config.broker_address,
        config.lease_duration(),
        config.max_job_attempts,
        std::time::Duration::from_secs(config.job_retention_secs),
    )?);

    let model = OpenCompatClient::new(
        &config.model_endpoint,
        &config.model_name,
        config.per_model_request_timeout(),
        Some(config.model_context_tokens),
    )?;
    if !model.probe().await {
        tracing::warn!(
            endpoint = %config.model_endpoint,
            "Model endpoint not reachable at startup; jobs will requeue until it is"
        );
    }
    let model = Arc::new(model);

    let executor = Arc::new(SandboxExecutor::new(
        &config.sandbox_dir,
        &config.sandbox_command,
        &config.data_dir,
    ));

    let inflation = Arc::new(InflationCache::new(
        &config.inflation_cache_path,
        &config.inflation_source_url,
        config.inflation_refresh_max_age_days,
        config.inflation_fetch_timeout(),
    ));

    let orchestrator = Arc::new(Orchestrator::new(
        broker.clone(),
        model,
        executor,
        inflation,
        config.clone(),
    ));

    let pool = WorkerPool::new(broker, orchestrator, config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown signal received; draining current jobs");
            let _ = shutdown_tx.send(true);
        }
    });

    pool.run(shutdown_rx).await;
    tracing::info!("Worker exited cleanly");
    Ok(())
}
