use super::state::AppState;
use crate::entitlement::{reconcile_tx, EntitlementEvent, ReconcileOutcome};
use crate::error::PipelineError;
use crate::pipeline::{TranslationOutcome, UploadOutcome, UploadTrigger};
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json},
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadTriggerRequest {
    /// `audio/{user_id}/{job_id}.{ext}`
    pub object_path: String,
    pub content_type: String,
    pub size_bytes: u64,
    /// Recording length from upload metadata
    pub duration_seconds: f64,
}

#[derive(Debug, Serialize)]
pub struct UploadTriggerResponse {
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct TranslationResponse {
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /billing/webhook
/// Billing-provider event, bearer-token authenticated
pub async fn billing_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> impl IntoResponse {
    let authorized = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|token| token == state.webhook_secret)
        .unwrap_or(false);

    if !authorized {
        warn!("Billing webhook rejected: bad or missing bearer token");
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let payload: serde_json::Value = match serde_json::from_str(&body) {
        Ok(value) => value,
        Err(e) => {
            warn!("Billing webhook payload unparseable: {}", e);
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    let event = EntitlementEvent::parse(&payload);
    match reconcile_tx(&*state.store, &event, Utc::now()).await {
        // Stale redeliveries are dropped silently, still a success
        Ok(ReconcileOutcome::Applied) | Ok(ReconcileOutcome::Stale) => {
            StatusCode::OK.into_response()
        }
        Ok(ReconcileOutcome::Irrelevant) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => {
            error!("Failed to reconcile billing event: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// POST /triggers/upload
/// Object-creation event from the upload collaborator (at-least-once)
pub async fn upload_trigger(
    State(state): State<AppState>,
    Json(req): Json<UploadTriggerRequest>,
) -> impl IntoResponse {
    let trigger = UploadTrigger {
        object_path: req.object_path,
        content_type: req.content_type,
        size_bytes: req.size_bytes,
        duration_seconds: req.duration_seconds,
    };

    match state.orchestrator.handle_upload(&trigger).await {
        Ok(UploadOutcome::Processed) => (
            StatusCode::OK,
            Json(UploadTriggerResponse {
                status: "processed".to_string(),
            }),
        )
            .into_response(),
        Ok(UploadOutcome::Duplicate) => (
            StatusCode::OK,
            Json(UploadTriggerResponse {
                status: "duplicate".to_string(),
            }),
        )
            .into_response(),
        Err(e) => pipeline_error_response(e),
    }
}

/// GET /jobs/:job_id
/// The durable job contract with the client UI
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> impl IntoResponse {
    match state.store.load_job(&job_id).await {
        Ok(Some(job)) => (StatusCode::OK, Json(job.value)).into_response(),
        Ok(None) => not_found(&job_id),
        Err(e) => {
            error!("Failed to load job {}: {}", job_id, e);
            pipeline_error_response(e)
        }
    }
}

/// POST /jobs/:job_id/translations/:language
/// Record a translation request and run the translation worker
pub async fn request_translation(
    State(state): State<AppState>,
    Path((job_id, language)): Path<(String, String)>,
) -> impl IntoResponse {
    info!("Translation requested for job {} into {}", job_id, language);

    match state.orchestrator.request_translation(&job_id, &language).await {
        Ok(TranslationOutcome::Completed) => (
            StatusCode::OK,
            Json(TranslationResponse {
                status: "completed".to_string(),
            }),
        )
            .into_response(),
        Ok(TranslationOutcome::AlreadyTranslated) => (
            StatusCode::OK,
            Json(TranslationResponse {
                status: "already_translated".to_string(),
            }),
        )
            .into_response(),
        Ok(TranslationOutcome::Unsupported) => (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: format!("Unsupported language: {}", language),
                retry_after_ms: None,
            }),
        )
            .into_response(),
        Ok(TranslationOutcome::NotClaimed) => (
            StatusCode::CONFLICT,
            Json(ErrorResponse {
                error: "Job is not ready or translation already running".to_string(),
                retry_after_ms: None,
            }),
        )
            .into_response(),
        Err(e) => pipeline_error_response(e),
    }
}

/// POST /jobs/:job_id/resubmit
/// Manual retry for a quota-blocked job
pub async fn resubmit_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> impl IntoResponse {
    match state.orchestrator.resubmit(&job_id).await {
        Ok(()) => (
            StatusCode::OK,
            Json(UploadTriggerResponse {
                status: "resubmitted".to_string(),
            }),
        )
            .into_response(),
        Err(e) => pipeline_error_response(e),
    }
}

/// GET /health
/// Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

fn not_found(job_id: &str) -> axum::response::Response {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse {
            error: format!("Job {} not found", job_id),
            retry_after_ms: None,
        }),
    )
        .into_response()
}

fn pipeline_error_response(err: PipelineError) -> axum::response::Response {
    let (status, retry_after_ms) = match &err {
        PipelineError::InvalidUpload(_) => (StatusCode::BAD_REQUEST, None),
        PipelineError::NotFound(_) => (StatusCode::NOT_FOUND, None),
        PipelineError::RateLimitExceeded { retry_after_ms, .. } => {
            (StatusCode::TOO_MANY_REQUESTS, Some(*retry_after_ms))
        }
        PipelineError::QuotaExceeded { .. } => (StatusCode::PAYMENT_REQUIRED, None),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, None),
    };

    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
            retry_after_ms,
        }),
    )
        .into_response()
}
