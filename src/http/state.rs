use std::sync::Arc;

use crate::pipeline::Orchestrator;
use crate::store::RecordStore;

/// Shared application state for HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,

    /// Direct read access for the job-query endpoints
    pub store: Arc<dyn RecordStore>,

    /// Bearer token the billing provider must present
    pub webhook_secret: String,
}
