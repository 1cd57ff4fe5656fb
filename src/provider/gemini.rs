//! Gemini API provider adapter

use async_trait::async_trait;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use super::{AiProvider, ChatMessage, ProviderError};

/// Gemini API model to use
const DEFAULT_MODEL: &str = "gemini-2.0-flash";

/// Gemini API base URL
const API_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";

const TRANSCRIBE_INSTRUCTION: &str = "Transcribe the audio verbatim in its original language. \
     Output only the transcription text with no commentary.";

// Request types for the Gemini API

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<SystemInstruction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
}

#[derive(Debug, Serialize)]
struct Content {
    role: String,
    parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    inline_data: Option<InlineData>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
struct SystemInstruction {
    parts: Vec<TextPart>,
}

#[derive(Debug, Serialize)]
struct TextPart {
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    response_mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
}

// Response types for the Gemini API

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    candidates: Option<Vec<Candidate>>,
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<CandidateContent>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    parts: Option<Vec<ResponsePart>>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}

/// Gemini API provider
pub struct GeminiProvider {
    api_key: String,
    model: String,
    base_url: String,
    client: reqwest::Client,
}

impl GeminiProvider {
    /// Create a new provider with the given API key
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: DEFAULT_MODEL.to_string(),
            base_url: API_BASE_URL.to_string(),
            client: reqwest::Client::new(),
        }
    }

    /// Create a new provider with a custom model
    pub fn with_model(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
            base_url: API_BASE_URL.to_string(),
            client: reqwest::Client::new(),
        }
    }

    /// Override the API base URL (tests point this at a local mock)
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Build the API URL
    fn api_url(&self) -> String {
        format!(
            "{}/{}:generateContent?key={}",
            self.base_url, self.model, self.api_key
        )
    }

    fn build_transcribe_request(&self, audio: &[u8], mime_type: &str) -> GenerateContentRequest {
        GenerateContentRequest {
            contents: vec![Content {
                role: "user".to_string(),
                parts: vec![Part {
                    text: None,
                    inline_data: Some(InlineData {
                        mime_type: mime_type.to_string(),
                        data: base64::engine::general_purpose::STANDARD.encode(audio),
                    }),
                }],
            }],
            system_instruction: Some(SystemInstruction {
                parts: vec![TextPart {
                    text: TRANSCRIBE_INSTRUCTION.to_string(),
                }],
            }),
            generation_config: None,
        }
    }

    fn build_generate_request(
        &self,
        messages: &[ChatMessage],
        max_output_tokens: u32,
    ) -> GenerateContentRequest {
        // Gemini carries the system role in system_instruction, not contents
        let system_text: Vec<&str> = messages
            .iter()
            .filter(|m| m.role == "system")
            .map(|m| m.text.as_str())
            .collect();

        let contents = messages
            .iter()
            .filter(|m| m.role != "system")
            .map(|m| Content {
                role: m.role.clone(),
                parts: vec![Part {
                    text: Some(m.text.clone()),
                    inline_data: None,
                }],
            })
            .collect();

        GenerateContentRequest {
            contents,
            system_instruction: (!system_text.is_empty()).then(|| SystemInstruction {
                parts: vec![TextPart {
                    text: system_text.join("\n\n"),
                }],
            }),
            generation_config: Some(GenerationConfig {
                response_mime_type: Some("application/json".to_string()),
                max_output_tokens: Some(max_output_tokens),
            }),
        }
    }

    async fn send(&self, body: &GenerateContentRequest) -> Result<String, ProviderError> {
        let response = self
            .client
            .post(self.api_url())
            .json(body)
            .send()
            .await
            .map_err(|e| ProviderError::RequestFailed(e.to_string()))?;

        let status = response.status();

        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(ProviderError::InvalidApiKey);
        }

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(ProviderError::RateLimited);
        }

        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ProviderError::ApiError(format!(
                "HTTP {}: {}",
                status, error_text
            )));
        }

        let response: GenerateContentResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::ParseError(e.to_string()))?;

        if let Some(error) = response.error {
            return Err(ProviderError::ApiError(error.message));
        }

        let candidate = response
            .candidates
            .as_ref()
            .and_then(|c| c.first())
            .ok_or(ProviderError::EmptyResponse)?;

        match candidate.finish_reason.as_deref() {
            Some("MAX_TOKENS") => return Err(ProviderError::TokenBudgetExceeded),
            Some("SAFETY") | Some("PROHIBITED_CONTENT") | Some("RECITATION") => {
                return Err(ProviderError::Refused(
                    candidate.finish_reason.clone().unwrap_or_default(),
                ))
            }
            _ => {}
        }

        let text = Self::extract_text(candidate).ok_or(ProviderError::EmptyResponse)?;

        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(ProviderError::EmptyResponse);
        }

        Ok(trimmed.to_string())
    }

    /// Extract text from the first candidate
    fn extract_text(candidate: &Candidate) -> Option<String> {
        let parts: Vec<&str> = candidate
            .content
            .as_ref()?
            .parts
            .as_ref()?
            .iter()
            .filter_map(|p| p.text.as_deref())
            .collect();

        if parts.is_empty() {
            None
        } else {
            Some(parts.join(""))
        }
    }
}

#[async_trait]
impl AiProvider for GeminiProvider {
    async fn transcribe(&self, audio: &[u8], mime_type: &str) -> Result<String, ProviderError> {
        let body = self.build_transcribe_request(audio, mime_type);
        self.send(&body).await
    }

    async fn generate_json(
        &self,
        messages: &[ChatMessage],
        max_output_tokens: u32,
    ) -> Result<String, ProviderError> {
        let body = self.build_generate_request(messages, max_output_tokens);
        self.send(&body).await
    }
}
