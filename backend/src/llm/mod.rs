// backend/src/llm/mod.rs

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod open_compat;

pub use open_compat::OpenCompatClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Error, Debug, Clone)]
pub enum ModelError {
    /// Transport-level failure reaching the model server; transient and
    /// eligible for requeue.
    #[error("model server unavailable: {0}")]
    Unavailable(String),

    /// The single-request ceiling elapsed.
    #[error("model request timed out: {0}")]
    Timeout(String),

    /// The server answered but the reply cannot be interpreted.
    #[error("model protocol error: {0}")]
    Protocol(String),
}

/// What one model turn amounts to after parsing: an executable code block or
/// a textual answer.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelReply {
    CodeBlock(String),
    Answer(String),
}

static CODE_FENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)```[a-zA-Z0-9_+-]*[ \t]*\r?\n(.*?)```").expect("fence pattern is valid")
});

/// Split a raw reply into code or answer. The first fenced block wins; a
/// reply with no fence (or an empty fence) is a textual answer.
pub fn parse_reply(content: &str) -> ModelReply {
    if let Some(captures) = CODE_FENCE.captures(content) {
        let code = captures
            .get(1)
            .map(|m| m.as_str().trim())
            .unwrap_or_default();
        if !code.is_empty() {
            return ModelReply::CodeBlock(code.to_string());
        }
    }
    ModelReply::Answer(content.trim().to_string())
}

/// The interface the orchestrator drives. One call is one blocking chat
/// completion; the tool-execution loop lives in the orchestrator, not here.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, ModelError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fenced_python_parses_as_code() {
        let reply = "Here you go:\n```python\nprint(1 + 1)\n```\nThat should do it.";
        assert_eq!(
            parse_reply(reply),
            ModelReply::CodeBlock("print(1 + 1)".to_string())
        );
    }

    #[test]
    fn untagged_fence_parses_as_code() {
        let reply = "```\nx = 2\n```";
        assert_eq!(parse_reply(reply), ModelReply::CodeBlock("x = 2".to_string()));
    }

    #[test]
    fn plain_text_parses_as_answer() {
        let reply = "The median Avg_Price is 112.48.";
        assert_eq!(
            parse_reply(reply),
            ModelReply::Answer("The median Avg_Price is 112.48.".to_string())
        );
    }

    #[test]
    fn empty_fence_falls_back_to_answer() {
        let reply = "```python\n\n```\nNothing to run.";
        assert!(matches!(parse_reply(reply), ModelReply::Answer(_)));
    }
}
