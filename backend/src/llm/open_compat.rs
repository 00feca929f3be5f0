// backend/src/llm/open_compat.rs
//
// ModelClient implementation against an OpenAI-compatible chat-completions
// endpoint (Ollama, llama.cpp server, vLLM and friends all speak it).

use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, instrument, warn};

use super::{ChatMessage, ModelClient, ModelError};

#[derive(Debug, Clone, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatChoice {
    message: Option<AssistantMessage>,
}

#[derive(Debug, Clone, Deserialize)]
struct AssistantMessage {
    content: Option<String>,
}

#[derive(Clone)]
pub struct OpenCompatClient {
    endpoint: String,
    model_name: String,
    max_tokens: Option<usize>,
    http: HttpClient,
}

impl OpenCompatClient {
    pub fn new(
        endpoint: impl Into<String>,
        model_name: impl Into<String>,
        request_timeout: Duration,
        max_tokens: Option<usize>,
    ) -> Result<Self, ModelError> {
        let http = HttpClient::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| ModelError::Unavailable(format!("HTTP client error: {e}")))?;
        let endpoint = endpoint.into().trim_end_matches('/').to_string();
        Ok(Self {
            endpoint,
            model_name: model_name.into(),
            max_tokens,
            http,
        })
    }

    /// Quick reachability check used at worker startup; never fatal, the
    /// outcome is only logged. An unreachable server surfaces later as
    /// `ModelUnavailable` on the first real request.
    pub async fn probe(&self) -> bool {
        let url = format!("{}/api/tags", self.endpoint);
        match self
            .http
            .get(&url)
            .timeout(Duration::from_secs(2))
            .send()
            .await
        {
            Ok(resp) if resp.status().as_u16() < 500 => {
                debug!(endpoint = %self.endpoint, "Model endpoint reachable");
                true
            }
            Ok(resp) => {
                warn!(endpoint = %self.endpoint, status = %resp.status(), "Model endpoint unhealthy");
                false
            }
            Err(e) => {
                warn!(endpoint = %self.endpoint, error = %e, "Model endpoint unreachable");
                false
            }
        }
    }
}

#[async_trait]
impl ModelClient for OpenCompatClient {
    #[instrument(skip(self, messages), fields(model = %self.model_name, messages = messages.len()))]
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, ModelError> {
        let url = format!("{}/v1/chat/completions", self.endpoint);
        let request = ChatCompletionRequest {
            model: &self.model_name,
            messages,
            stream: false,
            max_tokens: self.max_tokens,
        };

        let response = self
            .http
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ModelError::Timeout(e.to_string())
                } else {
                    ModelError::Unavailable(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ModelError::Unavailable(format!(
                "model server returned {status}: {body}"
            )));
        }

        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| ModelError::Protocol(format!("unparseable completion body: {e}")))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message)
            .and_then(|m| m.content)
            .ok_or_else(|| ModelError::Protocol("completion has no message content".to_string()))?;

        debug!(chars = content.len(), "Model completion received");
        Ok(content)
    }
}
