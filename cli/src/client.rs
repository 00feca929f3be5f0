// cli/src/client.rs
//
// Thin HTTP wrapper over the Tabula API.

use futures::StreamExt;
use reqwest::Client as ReqwestClient;
use serde_json::Value;
use url::Url;

use tabula_backend::models::jobs::ProgressEvent;

use crate::error::CliError;

pub struct ApiClient {
    base_url: Url,
    http: ReqwestClient,
}

impl ApiClient {
    pub fn new(base_url: Url, http: ReqwestClient) -> Self {
        Self { base_url, http }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}api/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn check(response: reqwest::Response) -> Result<Value, CliError> {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(CliError::Api { status, body });
        }
        serde_json::from_str(&body).map_err(|e| CliError::Decode(e.to_string()))
    }

    pub async fn submit(
        &self,
        question: &str,
        filename: Option<&str>,
    ) -> Result<String, CliError> {
        let mut payload = serde_json::json!({ "question": question });
        if let Some(name) = filename {
            payload["filename"] = serde_json::json!(name);
        }
        let response = self
            .http
            .post(self.endpoint("analyze"))
            .json(&payload)
            .send()
            .await?;
        let body = Self::check(response).await?;
        body["task_id"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| CliError::Decode("response missing task_id".to_string()))
    }

    pub async fn status(&self, job_id: &str) -> Result<Value, CliError> {
        let response = self
            .http
            .get(self.endpoint(&format!("status/{job_id}")))
            .send()
            .await?;
        Self::check(response).await
    }

    pub async fn cancel(&self, job_id: &str) -> Result<Value, CliError> {
        let response = self
            .http
            .post(self.endpoint(&format!("status/{job_id}/cancel")))
            .send()
            .await?;
        Self::check(response).await
    }

    pub async fn list_files(&self) -> Result<Value, CliError> {
        let response = self.http.get(self.endpoint("data")).send().await?;
        Self::check(response).await
    }

    /// Tail the SSE progress stream, invoking `on_event` per event, until
    /// the terminal event or stream end.
    pub async fn stream_progress<F>(&self, job_id: &str, mut on_event: F) -> Result<(), CliError>
    where
        F: FnMut(&ProgressEvent),
    {
        let response = self
            .http
            .get(self.endpoint(&format!("status/{job_id}/stream")))
            .header("Accept", "text/event-stream")
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(CliError::Api { status, body });
        }

        let mut buffer = String::new();
        let bytes = response.bytes_stream();
        futures::pin_mut!(bytes);
        while let Some(chunk) = bytes.next().await {
            let chunk = chunk?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));
            // SSE frames are separated by a blank line.
            while let Some(pos) = buffer.find("\n\n") {
                let frame = buffer[..pos].to_string();
                buffer.drain(..pos + 2);
                for line in frame.lines() {
                    if let Some(data) = line.strip_prefix("data: ") {
                        if let Ok(event) = serde_json::from_str::<ProgressEvent>(data) {
                            let terminal = event.phase.is_terminal();
                            on_event(&event);
                            if terminal {
                                return Ok(());
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }
}
