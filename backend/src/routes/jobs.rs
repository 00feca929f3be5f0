// backend/src/routes/jobs.rs
//
// The job-facing API surface: submit, status, progress stream, cancel.

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response, sse::Event, sse::KeepAlive, sse::Sse},
    routing::{get, post},
};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use tracing::{info, instrument, warn};

use crate::errors::AppError;
use crate::models::files::list_data_files;
use crate::models::jobs::NewJob;
use crate::state::AppState;

pub fn job_routes() -> Router<AppState> {
    Router::new()
        .route("/analyze", post(start_analysis))
        .route("/status/{job_id}", get(get_status))
        .route("/status/{job_id}/stream", get(stream_progress))
        .route("/status/{job_id}/cancel", post(cancel_job))
}

#[derive(Deserialize)]
pub struct AnalyzeRequest {
    question: Option<String>,
    filename: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StreamParams {
    from_seq: Option<u64>,
}

/// Kick off an analysis job. Validation happens here; the heavy lifting is
/// queued for a worker.
#[instrument(skip(state, payload))]
pub async fn start_analysis(
    State(state): State<AppState>,
    Json(payload): Json<AnalyzeRequest>,
) -> Result<impl IntoResponse, AppError> {
    let question = payload
        .question
        .as_deref()
        .map(str::trim)
        .filter(|q| !q.is_empty())
        .ok_or_else(|| AppError::InputRejected("Please provide a 'question'".to_string()))?
        .to_string();

    let files = list_data_files(&state.config.data_dir)?;
    if files.is_empty() {
        return Err(AppError::InputRejected(
            "No data files available. Please upload a file first.".to_string(),
        ));
    }

    let primary_file = match payload.filename.as_deref().map(str::trim) {
        Some("") | None => None,
        Some(name) => {
            if !files.iter().any(|f| f.name == name) {
                return Err(AppError::InputRejected(format!(
                    "Unknown primary file '{name}'"
                )));
            }
            Some(name.to_string())
        }
    };

    let job_id = state
        .broker
        .submit(NewJob::new(question, primary_file))
        .await?;
    info!(%job_id, "Analysis job queued");

    Ok((StatusCode::ACCEPTED, Json(json!({ "task_id": job_id }))))
}

/// Single-shot status read.
#[instrument(skip(state))]
pub async fn get_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let status = state
        .broker
        .status(&job_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Job '{job_id}' not found")))?;

    let mut body = json!({
        "task_id": job_id,
        "status": status.state,
    });
    if let Some(result) = status.result {
        body["result"] = json!(result);
    }
    if let Some(error) = status.error {
        body["error"] = json!(error);
    }
    Ok(Json(body))
}

/// Server-sent progress stream; one event per ProgressEvent, ending after
/// the terminal event.
#[instrument(skip(state))]
pub async fn stream_progress(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    Query(params): Query<StreamParams>,
) -> Result<Response, AppError> {
    if state.broker.status(&job_id).await?.is_none() {
        return Err(AppError::NotFound(format!("Job '{job_id}' not found")));
    }

    let from_seq = params.from_seq.unwrap_or(1);
    let events = state.broker.subscribe_progress(&job_id, from_seq).await?;

    let sse_stream = async_stream::stream! {
        futures::pin_mut!(events);
        while let Some(item) = events.next().await {
            match item {
                Ok(event) => {
                    match Event::default().json_data(&event) {
                        Ok(sse_event) => yield Ok::<_, Infallible>(sse_event),
                        Err(e) => {
                            warn!(error = %e, "Failed to encode progress event");
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Progress stream error");
                    yield Ok(Event::default().event("error").data(e.to_string()));
                    break;
                }
            }
        }
    };

    Ok(Sse::new(sse_stream)
        .keep_alive(KeepAlive::default())
        .into_response())
}

/// Best-effort cancel; the orchestrator observes the flag at its next state
/// boundary.
#[instrument(skip(state))]
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    if state.broker.status(&job_id).await?.is_none() {
        return Err(AppError::NotFound(format!("Job '{job_id}' not found")));
    }
    let accepted = state.broker.request_cancel(&job_id).await?;
    Ok(Json(json!({ "task_id": job_id, "cancel_requested": accepted })))
}
