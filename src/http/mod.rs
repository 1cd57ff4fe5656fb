//! HTTP surface for external collaborators and the client UI
//!
//! - POST /billing/webhook - Billing-provider entitlement events
//! - POST /triggers/upload - Object-creation events from the uploader
//! - GET /jobs/:id - Durable job record for the client
//! - POST /jobs/:id/translations/:lang - Request a summary translation
//! - POST /jobs/:id/resubmit - Retry a quota-blocked job
//! - GET /health - Health check

mod handlers;
mod routes;
mod state;

pub use routes::create_router;
pub use state::AppState;
