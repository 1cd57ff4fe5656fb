//! Access to uploaded audio objects.
//!
//! Upload mechanics belong to the client-upload collaborator; the pipeline
//! only ever reads finished objects back by their storage path.

use async_trait::async_trait;

use crate::error::PipelineError;

/// Fetches uploaded audio objects from the storage collaborator
#[async_trait]
pub trait AudioFetcher: Send + Sync {
    async fn fetch(&self, object_path: &str) -> Result<Vec<u8>, PipelineError>;
}

/// Fetches objects over HTTP from the storage gateway
pub struct HttpAudioFetcher {
    base_url: String,
    client: reqwest::Client,
}

impl HttpAudioFetcher {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl AudioFetcher for HttpAudioFetcher {
    async fn fetch(&self, object_path: &str) -> Result<Vec<u8>, PipelineError> {
        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), object_path);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| PipelineError::Storage(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::Storage(format!(
                "fetching {} returned HTTP {}",
                object_path, status
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| PipelineError::Storage(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}
