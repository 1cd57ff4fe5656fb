//! Push-notification transport for summary-ready alerts.
//!
//! Deliveries carry a `collapse_id` keyed to the job so redelivered sends
//! coalesce on the device instead of stacking up.

use async_trait::async_trait;
use serde::Serialize;
use tracing::info;

use crate::error::PipelineError;

/// Push transport port
#[async_trait]
pub trait PushSender: Send + Sync {
    /// Notify the user that the summary for `job_id` is ready
    async fn send_summary_ready(
        &self,
        user_id: &str,
        job_id: &str,
        title: &str,
    ) -> Result<(), PipelineError>;
}

const DEFAULT_BASE_URL: &str = "https://api.onesignal.com";

#[derive(Debug, Serialize)]
struct PushRequest<'a> {
    app_id: &'a str,
    include_aliases: Aliases<'a>,
    target_channel: &'static str,
    headings: LocalizedText<'a>,
    contents: LocalizedText<'a>,
    collapse_id: &'a str,
}

#[derive(Debug, Serialize)]
struct Aliases<'a> {
    external_id: Vec<&'a str>,
}

#[derive(Debug, Serialize)]
struct LocalizedText<'a> {
    en: &'a str,
}

/// OneSignal push sender
pub struct OneSignalSender {
    app_id: String,
    api_key: String,
    base_url: String,
    client: reqwest::Client,
}

impl OneSignalSender {
    pub fn new(app_id: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            client: reqwest::Client::new(),
        }
    }

    /// Override the API base URL (tests point this at a local mock)
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[async_trait]
impl PushSender for OneSignalSender {
    async fn send_summary_ready(
        &self,
        user_id: &str,
        job_id: &str,
        title: &str,
    ) -> Result<(), PipelineError> {
        let body = PushRequest {
            app_id: &self.app_id,
            include_aliases: Aliases {
                external_id: vec![user_id],
            },
            target_channel: "push",
            headings: LocalizedText {
                en: "Your summary is ready",
            },
            contents: LocalizedText { en: title },
            collapse_id: job_id,
        };

        let response = self
            .client
            .post(format!("{}/notifications", self.base_url))
            .header("Authorization", format!("Basic {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| PipelineError::Notification(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(PipelineError::Notification(format!(
                "HTTP {}: {}",
                status, text
            )));
        }

        info!("Summary-ready push sent for job {}", job_id);
        Ok(())
    }
}
