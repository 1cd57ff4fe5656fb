use super::handlers;
use super::state::AppState;
use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

/// Create the HTTP router with all routes
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health check
        .route("/health", get(handlers::health_check))
        // External collaborators
        .route("/billing/webhook", post(handlers::billing_webhook))
        .route("/triggers/upload", post(handlers::upload_trigger))
        // Job queries and commands
        .route("/jobs/:job_id", get(handlers::get_job))
        .route(
            "/jobs/:job_id/translations/:language",
            post(handlers::request_translation),
        )
        .route("/jobs/:job_id/resubmit", post(handlers::resubmit_job))
        // Add tracing middleware for request logging
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
