use axum::{routing::get, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::{DefaultMakeSpan, TraceLayer};

use anyhow::Result;
use tabula_backend::broker::RedisBroker;
use tabula_backend::config::Config;
use tabula_backend::logging::init_subscriber;
use tabula_backend::routes::data::data_routes;
use tabula_backend::routes::health::health_check;
use tabula_backend::routes::jobs::job_routes;
use tabula_backend::state::AppState;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    init_subscriber();

    tracing::info!("Starting Tabula API server...");

    let config = Arc::new(Config::load().expect("Failed to load configuration"));
    tracing::info!(config = ?config, "Configuration loaded");

    let broker = Arc::new(
        RedisBroker::new(
            &config.broker_address,
            config.lease_duration(),
            config.max_job_attempts,
            std::time::Duration::from_secs(config.job_retention_secs),
        )
        .expect("Failed to create broker client"),
    );

    let app_state = AppState::new(config.clone(), broker);

    let api_routes = Router::new()
        .route("/health", get(health_check))
        .merge(job_routes())
        .merge(data_routes());

    let app = Router::new()
        .nest("/api", api_routes)
        .with_state(app_state)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::default().include_headers(false)),
        );

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    tracing::info!("Listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
