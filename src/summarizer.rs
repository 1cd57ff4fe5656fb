//! Schema-constrained summarization over transcript chunks.
//!
//! Each chunk gets one structured-output request; when the provider stops at
//! the token budget the request is retried twice with progressively more
//! compact instructions and a larger budget, then the error propagates.
//! Multi-chunk results are merged by one aggregation request under the same
//! schema and escalation policy. `enforce_limits` is the deterministic
//! post-validation applied to everything the provider returns.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value;
use tracing::{info, warn};

use crate::chunker;
use crate::error::PipelineError;
use crate::model::SermonSummary;
use crate::provider::{AiProvider, ChatMessage};

/// Output token budget for the first attempt; doubles per escalation step
pub const BASE_TOKEN_BUDGET: u32 = 1024;

/// Initial attempt plus a fixed two-stage escalation
const MAX_ATTEMPTS: u32 = 3;

pub const MAX_THEME_WORDS: usize = 12;
pub const MAX_KEY_POINTS: usize = 7;
pub const MAX_QUOTES: usize = 5;
pub const MAX_ACTIONS: usize = 5;

pub const THEME_FALLBACK: &str = "Not mentioned";
pub const ACTION_FALLBACK: &str = "No action mentioned";

const SCHEMA_INSTRUCTION: &str = "Respond with a single JSON object with exactly these fields: \
     \"mainTheme\" (string), \"keyPoints\" (array of strings), \
     \"explicitQuotes\" (array of strings, verbatim Quran/hadith quotes mentioned), \
     \"weeklyActions\" (array of strings, concrete actions suggested for the week).";

/// Instruction prefixes per escalation stage, most compact last
const STAGE_INSTRUCTIONS: [&str; 3] = [
    "You summarize Islamic sermons for an app that helps listeners review them later. \
     Be faithful to the speaker; do not invent content.",
    "Summarize the sermon very concisely. Short phrases only, no full sentences.",
    "Extremely terse summary. At most a few words per item.",
];

/// Summarizes transcripts through the AI provider
pub struct Summarizer {
    provider: Arc<dyn AiProvider>,
}

impl Summarizer {
    pub fn new(provider: Arc<dyn AiProvider>) -> Self {
        Self { provider }
    }

    /// Full transcript pipeline: chunk, summarize each, aggregate, validate.
    pub async fn summarize(&self, transcript: &str) -> Result<SermonSummary, PipelineError> {
        let segments = chunker::chunk(
            transcript,
            chunker::DEFAULT_TARGET_CHARS,
            chunker::DEFAULT_OVERLAP_CHARS,
        );
        if segments.is_empty() {
            return Err(PipelineError::SchemaInvalid(
                "empty transcript".to_string(),
            ));
        }

        let total = segments.len();
        let mut parts = Vec::with_capacity(total);
        for (index, segment) in segments.iter().enumerate() {
            let part = self
                .summarize_chunk(segment, index, total, BASE_TOKEN_BUDGET)
                .await?;
            parts.push(part);
        }

        // A single chunk is used directly, no aggregation call
        let merged = if parts.len() > 1 {
            self.aggregate(&parts, BASE_TOKEN_BUDGET).await?
        } else {
            match parts.pop() {
                Some(part) => part,
                None => {
                    return Err(PipelineError::SchemaInvalid(
                        "no chunk summaries produced".to_string(),
                    ))
                }
            }
        };

        Ok(enforce_limits(merged)?)
    }

    /// Summarize one segment under the strict schema.
    pub async fn summarize_chunk(
        &self,
        segment: &str,
        index: usize,
        total: usize,
        token_budget: u32,
    ) -> Result<SermonSummary, PipelineError> {
        let body = format!(
            "Sermon transcript, part {} of {}:\n\n{}",
            index + 1,
            total,
            segment
        );
        self.generate_with_escalation(&body, token_budget).await
    }

    /// Merge and deduplicate per-chunk summaries into one.
    pub async fn aggregate(
        &self,
        parts: &[SermonSummary],
        token_budget: u32,
    ) -> Result<SermonSummary, PipelineError> {
        info!("Aggregating {} chunk summaries", parts.len());
        let serialized = serde_json::to_string(parts)
            .map_err(|e| PipelineError::SchemaInvalid(e.to_string()))?;
        let body = format!(
            "These JSON objects summarize consecutive parts of one sermon. \
             Merge them into a single summary, deduplicating overlapping points:\n\n{}",
            serialized
        );
        self.generate_with_escalation(&body, token_budget).await
    }

    /// Translate a completed summary into the target language, same schema.
    pub async fn translate(
        &self,
        summary: &SermonSummary,
        language: &str,
    ) -> Result<SermonSummary, PipelineError> {
        let serialized = serde_json::to_string(summary)
            .map_err(|e| PipelineError::SchemaInvalid(e.to_string()))?;
        let body = format!(
            "Translate every string value in this sermon summary into the language \
             with ISO code \"{}\", keeping the JSON structure identical:\n\n{}",
            language, serialized
        );
        let translated = self
            .generate_with_escalation(&body, BASE_TOKEN_BUDGET)
            .await?;
        Ok(enforce_limits(translated)?)
    }

    async fn generate_with_escalation(
        &self,
        body: &str,
        token_budget: u32,
    ) -> Result<SermonSummary, PipelineError> {
        for attempt in 0..MAX_ATTEMPTS {
            let budget = token_budget << attempt;
            let system = format!(
                "{}\n\n{}",
                STAGE_INSTRUCTIONS[attempt as usize], SCHEMA_INSTRUCTION
            );
            let messages = [ChatMessage::system(system), ChatMessage::user(body)];

            match self.provider.generate_json(&messages, budget).await {
                Ok(raw) => return parse_summary(&raw),
                Err(err) => {
                    let err: PipelineError = err.into();
                    if matches!(err, PipelineError::TokenBudgetExceeded)
                        && attempt + 1 < MAX_ATTEMPTS
                    {
                        warn!(
                            "Token budget {} exceeded, escalating (attempt {})",
                            budget,
                            attempt + 1
                        );
                        continue;
                    }
                    return Err(err);
                }
            }
        }
        Err(PipelineError::TokenBudgetExceeded)
    }
}

/// Parse raw provider output into a summary, rejecting shape mismatches.
pub fn parse_summary(raw: &str) -> Result<SermonSummary, PipelineError> {
    let cleaned = strip_code_fence(raw);
    let value: Value = serde_json::from_str(cleaned)
        .map_err(|e| PipelineError::SchemaInvalid(format!("not valid JSON: {e}")))?;

    let object = value
        .as_object()
        .ok_or_else(|| PipelineError::SchemaInvalid("expected a JSON object".to_string()))?;

    let main_theme = object
        .get("mainTheme")
        .and_then(Value::as_str)
        .ok_or_else(|| PipelineError::SchemaInvalid("mainTheme must be a string".to_string()))?
        .to_string();

    Ok(SermonSummary {
        main_theme,
        key_points: string_array(object.get("keyPoints"), "keyPoints")?,
        explicit_quotes: string_array(object.get("explicitQuotes"), "explicitQuotes")?,
        weekly_actions: string_array(object.get("weeklyActions"), "weeklyActions")?,
    })
}

fn string_array(value: Option<&Value>, field: &str) -> Result<Vec<String>, PipelineError> {
    let items = value
        .and_then(Value::as_array)
        .ok_or_else(|| PipelineError::SchemaInvalid(format!("{field} must be an array")))?;

    items
        .iter()
        .map(|item| {
            item.as_str().map(str::to_string).ok_or_else(|| {
                PipelineError::SchemaInvalid(format!("{field} must contain only strings"))
            })
        })
        .collect()
}

/// Providers occasionally wrap JSON in a markdown fence despite forced-JSON mode
fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|s| s.strip_suffix("```"))
        .map(str::trim)
        .unwrap_or(trimmed)
}

/// Deterministic post-validation of a parsed summary.
///
/// Deduplicates list fields preserving order, truncates the theme to a word
/// cap, caps list lengths and fills fixed fallbacks for fields left empty.
pub fn enforce_limits(summary: SermonSummary) -> Result<SermonSummary, PipelineError> {
    let mut main_theme = truncate_words(summary.main_theme.trim(), MAX_THEME_WORDS);
    if main_theme.is_empty() {
        main_theme = THEME_FALLBACK.to_string();
    }

    let mut key_points = dedupe_capped(summary.key_points, MAX_KEY_POINTS);
    if key_points.is_empty() {
        key_points = vec![THEME_FALLBACK.to_string()];
    }

    let mut explicit_quotes = dedupe_capped(summary.explicit_quotes, MAX_QUOTES);
    if explicit_quotes.is_empty() {
        explicit_quotes = vec![THEME_FALLBACK.to_string()];
    }

    let mut weekly_actions = dedupe_capped(summary.weekly_actions, MAX_ACTIONS);
    if weekly_actions.is_empty() {
        weekly_actions = vec![ACTION_FALLBACK.to_string()];
    }

    Ok(SermonSummary {
        main_theme,
        key_points,
        explicit_quotes,
        weekly_actions,
    })
}

fn truncate_words(text: &str, max_words: usize) -> String {
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.len() <= max_words {
        words.join(" ")
    } else {
        words[..max_words].join(" ")
    }
}

fn dedupe_capped(items: Vec<String>, cap: usize) -> Vec<String> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty() && seen.insert(item.to_lowercase()))
        .take(cap)
        .collect()
}
