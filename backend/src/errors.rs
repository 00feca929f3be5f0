// backend/src/errors.rs
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;
use tracing::error;

use crate::broker::BrokerError;
use crate::llm::ModelError;
use crate::loader::LoaderError;

/// Custom Error type for the application.
/// Wraps various error types and maps them to appropriate HTTP status codes.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Input rejected: {0}")]
    InputRejected(String),

    #[error("Not Found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Loader error: {0}")]
    Loader(#[from] LoaderError),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    #[error("IO Error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Multipart error: {0}")]
    MultipartError(#[from] axum::extract::multipart::MultipartError),

    #[error("Internal Server Error")]
    InternalServerError(#[from] anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::InputRejected(ref message) => (StatusCode::BAD_REQUEST, message.clone()),
            AppError::NotFound(ref message) => (StatusCode::NOT_FOUND, message.clone()),
            AppError::Conflict(ref message) => (StatusCode::CONFLICT, message.clone()),
            AppError::Loader(ref err) => {
                tracing::warn!("Loader rejected request: {}", err);
                (StatusCode::BAD_REQUEST, err.to_string())
            }
            AppError::Broker(ref err) => {
                error!("Broker Error: {:?}", err);
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "The job store is unavailable".to_string(),
                )
            }
            AppError::Model(ref err) => {
                error!("Model Error: {:?}", err);
                (
                    StatusCode::BAD_GATEWAY,
                    "An error occurred with the language model".to_string(),
                )
            }
            AppError::IoError(ref err) => {
                error!("IO Error: {:?}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "An input/output error occurred".to_string(),
                )
            }
            AppError::MultipartError(ref err) => {
                error!("Multipart Error: {:?}", err);
                (
                    StatusCode::BAD_REQUEST,
                    format!("Failed to process multipart form data: {}", err),
                )
            }
            AppError::InternalServerError(ref err) => {
                error!("Internal Server Error: {:?}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal Server Error".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

pub type Result<T, E = AppError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use axum::response::Response;
    use serde_json::Value;

    async fn get_body_json(response: Response) -> Value {
        let body = response.into_body();
        let body_bytes = to_bytes(body, usize::MAX)
            .await
            .expect("Failed to read body bytes");
        serde_json::from_slice(&body_bytes).expect("Failed to parse JSON body")
    }

    #[tokio::test]
    async fn test_input_rejected_response() {
        let msg = "Please provide a 'question'".to_string();
        let error = AppError::InputRejected(msg.clone());
        let response = error.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = get_body_json(response).await;
        assert_eq!(body["error"], msg);
    }

    #[tokio::test]
    async fn test_not_found_response() {
        let msg = "Job not found".to_string();
        let error = AppError::NotFound(msg.clone());
        let response = error.into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = get_body_json(response).await;
        assert_eq!(body["error"], msg);
    }

    #[tokio::test]
    async fn test_internal_server_error_response() {
        let error = AppError::InternalServerError(anyhow::anyhow!("Something went wrong"));
        let response = error.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = get_body_json(response).await;
        assert_eq!(body["error"], "Internal Server Error");
    }

    #[tokio::test]
    async fn test_loader_error_response_is_bad_request() {
        let error = AppError::Loader(LoaderError::UnsupportedFormat("parquet".to_string()));
        let response = error.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
