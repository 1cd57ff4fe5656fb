pub mod chunker;
pub mod config;
pub mod entitlement;
pub mod error;
pub mod http;
pub mod model;
pub mod notify;
pub mod objectstore;
pub mod pipeline;
pub mod provider;
pub mod quota;
pub mod ratelimit;
pub mod store;
pub mod summarizer;

pub use config::Config;
pub use error::{PipelineError, QuotaReason, RateLimitReason};
pub use http::{create_router, AppState};
pub use model::{JobRecord, JobStatus, OperationKind, Plan, RateWindow, SermonSummary, UserRecord};
pub use notify::{OneSignalSender, PushSender};
pub use objectstore::{AudioFetcher, HttpAudioFetcher};
pub use pipeline::{Orchestrator, TranslationOutcome, UploadOutcome, UploadTrigger};
pub use provider::{AiProvider, ChatMessage, GeminiProvider, ProviderError};
pub use store::{MemoryStore, RecordStore, TxDecision, Version, Versioned};
pub use summarizer::Summarizer;
