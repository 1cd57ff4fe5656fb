//! AI provider port and adapters.

pub mod gemini;

use async_trait::async_trait;
use thiserror::Error;

use crate::error::PipelineError;

pub use gemini::GeminiProvider;

/// One role-tagged message in a generation request
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: String,
    pub text: String,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            text: text.into(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            text: text.into(),
        }
    }
}

/// Errors from the AI provider boundary
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Invalid API key")]
    InvalidApiKey,

    #[error("Provider rate limited the request")]
    RateLimited,

    #[error("API error: {0}")]
    ApiError(String),

    #[error("Failed to parse response: {0}")]
    ParseError(String),

    #[error("Provider returned an empty response")]
    EmptyResponse,

    /// Generation stopped because the output hit the token budget
    #[error("Output token budget exceeded")]
    TokenBudgetExceeded,

    #[error("Provider refused the request: {0}")]
    Refused(String),
}

impl From<ProviderError> for PipelineError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::TokenBudgetExceeded => PipelineError::TokenBudgetExceeded,
            other => PipelineError::Provider(other.to_string()),
        }
    }
}

/// External AI provider: audio transcription and schema-constrained generation
#[async_trait]
pub trait AiProvider: Send + Sync {
    /// Transcribe one audio segment to plain text
    async fn transcribe(&self, audio: &[u8], mime_type: &str) -> Result<String, ProviderError>;

    /// Generate a forced-JSON-object completion under a token budget
    async fn generate_json(
        &self,
        messages: &[ChatMessage],
        max_output_tokens: u32,
    ) -> Result<String, ProviderError>;
}
