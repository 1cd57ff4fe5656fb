use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Processing state of one submitted recording
///
/// Advances strictly forward; `Ready` and `Failed` are terminal, and
/// `BlockedQuota` is terminal until the caller resubmits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Processing,
    Transcribed,
    Summarizing,
    Ready,
    Failed,
    BlockedQuota,
}

/// Structured summary of one sermon recording
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SermonSummary {
    pub main_theme: String,
    pub key_points: Vec<String>,
    pub explicit_quotes: Vec<String>,
    pub weekly_actions: Vec<String>,
}

/// One record per submitted recording; created at upload, mutated only by the
/// orchestrator, and the durable contract with the client UI
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub job_id: String,
    pub user_id: String,

    /// Storage path the job was created from (`audio/{user_id}/{job_id}.{ext}`)
    pub object_path: String,

    pub status: JobStatus,

    pub duration_minutes: u32,

    /// 0 unless the ledger accepted the debit
    pub charged_minutes: u32,

    pub transcript: Option<String>,
    pub summary: Option<SermonSummary>,

    /// At-most-one-worker claim over the debit-and-transcribe stage; the
    /// loser of a concurrent duplicate trigger returns without debiting
    pub transcription_in_progress: bool,

    /// At-most-one-summarizer claim; never left set across a terminal state
    pub summary_in_progress: bool,

    /// Per-language translation claims
    pub summary_translation_in_progress: BTreeMap<String, bool>,

    /// Completed translations keyed by language code
    pub summary_translations: BTreeMap<String, SermonSummary>,

    /// Failed translations keyed by language code
    pub summary_translation_errors: BTreeMap<String, String>,

    /// Pending translation requests keyed by language code
    pub summary_translation_requests: BTreeMap<String, bool>,

    pub summary_notification_in_progress: bool,

    /// Permanent once-only marker; once set no retrigger may resend
    pub summary_notification_sent_at: Option<DateTime<Utc>>,

    /// Present only while status is BlockedQuota
    pub quota_reason: Option<String>,

    /// Present only while status is Failed
    pub error_message: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn new(
        job_id: impl Into<String>,
        user_id: impl Into<String>,
        object_path: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            user_id: user_id.into(),
            object_path: object_path.into(),
            status: JobStatus::Processing,
            duration_minutes: 0,
            charged_minutes: 0,
            transcript: None,
            summary: None,
            transcription_in_progress: false,
            summary_in_progress: false,
            summary_translation_in_progress: BTreeMap::new(),
            summary_translations: BTreeMap::new(),
            summary_translation_errors: BTreeMap::new(),
            summary_translation_requests: BTreeMap::new(),
            summary_notification_in_progress: false,
            summary_notification_sent_at: None,
            quota_reason: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// True once the job can no longer advance on its own
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            JobStatus::Ready | JobStatus::Failed | JobStatus::BlockedQuota
        )
    }
}
