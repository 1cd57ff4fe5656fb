//! Job orchestrator: the state machine driving one submitted recording
//! through transcription, summarization, optional translation and the
//! ready notification.
//!
//! Triggers arrive at least once and many workers can run concurrently, so
//! every stage entry is either idempotent or guarded by a transactional
//! claim on the job record. Long-running external calls always happen
//! outside the claim transactions; a losing worker returns without side
//! effects.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use tracing::{error, info, warn};

use crate::error::PipelineError;
use crate::model::{JobRecord, JobStatus, OperationKind};
use crate::notify::PushSender;
use crate::objectstore::AudioFetcher;
use crate::provider::AiProvider;
use crate::quota;
use crate::ratelimit;
use crate::store::{with_job, RecordStore, TxDecision};
use crate::summarizer::Summarizer;

/// Upload objects larger than this are rejected at the trigger boundary
pub const MAX_UPLOAD_BYTES: u64 = 100 * 1024 * 1024;

/// Audio is transcribed in segments no larger than this so each provider
/// call stays under inline-payload limits
pub const AUDIO_SEGMENT_BYTES: usize = 24 * 1024 * 1024;

/// Translation target languages the app offers
pub const SUPPORTED_LANGUAGES: &[&str] =
    &["ar", "ur", "fr", "de", "es", "tr", "id", "ms", "bn", "sw"];

/// Attempts to pass the rate limiter before giving the trigger back to the
/// platform for redelivery
const MAX_ADMIT_ATTEMPTS: u32 = 5;

/// Object-creation event from the upload collaborator
#[derive(Debug, Clone)]
pub struct UploadTrigger {
    /// `audio/{user_id}/{job_id}.{ext}`
    pub object_path: String,
    pub content_type: String,
    pub size_bytes: u64,
    /// Recording length from upload metadata; rounded to minutes here,
    /// never inside the ledger
    pub duration_seconds: f64,
}

/// How an upload trigger was handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    Processed,
    /// Duplicate delivery of an already-advanced job, dropped
    Duplicate,
}

/// How a translation request was handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranslationOutcome {
    Completed,
    AlreadyTranslated,
    /// Language not in the allow-list; request cleared, error recorded
    Unsupported,
    /// Job not ready or another worker holds the claim
    NotClaimed,
}

/// Parse `audio/{user_id}/{job_id}.{ext}` into its components
pub fn parse_object_path(path: &str) -> Option<(String, String, String)> {
    let rest = path.strip_prefix("audio/")?;
    let (user_id, file) = rest.split_once('/')?;
    let (job_id, ext) = file.rsplit_once('.')?;
    if user_id.is_empty() || job_id.is_empty() || ext.is_empty() || job_id.contains('/') {
        return None;
    }
    Some((user_id.to_string(), job_id.to_string(), ext.to_string()))
}

/// Whole billable minutes for a recording, minimum one
pub fn round_minutes(duration_seconds: f64) -> u32 {
    let minutes = (duration_seconds / 60.0).round();
    if minutes < 1.0 {
        1
    } else {
        minutes as u32
    }
}

fn mime_for_extension(ext: &str) -> &'static str {
    match ext {
        "m4a" | "mp4" => "audio/mp4",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "aac" => "audio/aac",
        "ogg" | "opus" => "audio/ogg",
        "flac" => "audio/flac",
        _ => "audio/mpeg",
    }
}

/// Coordinates the pipeline stages over the record store
pub struct Orchestrator {
    store: Arc<dyn RecordStore>,
    provider: Arc<dyn AiProvider>,
    push: Arc<dyn PushSender>,
    audio: Arc<dyn AudioFetcher>,
    summarizer: Summarizer,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn RecordStore>,
        provider: Arc<dyn AiProvider>,
        push: Arc<dyn PushSender>,
        audio: Arc<dyn AudioFetcher>,
    ) -> Self {
        let summarizer = Summarizer::new(Arc::clone(&provider));
        Self {
            store,
            provider,
            push,
            audio,
            summarizer,
        }
    }

    /// Stage 1+2 entry: handle one upload trigger.
    ///
    /// Creates the job record when this is the first delivery, drops
    /// duplicates of already-advanced jobs, then runs transcription. On
    /// success the summarization stage is kicked off in-process; its own
    /// claim keeps that safe under concurrent deliveries.
    pub async fn handle_upload(
        &self,
        trigger: &UploadTrigger,
    ) -> Result<UploadOutcome, PipelineError> {
        if !trigger.content_type.starts_with("audio/") {
            return Err(PipelineError::InvalidUpload(format!(
                "unsupported content type {}",
                trigger.content_type
            )));
        }
        if trigger.size_bytes > MAX_UPLOAD_BYTES {
            return Err(PipelineError::InvalidUpload(format!(
                "object exceeds {} bytes",
                MAX_UPLOAD_BYTES
            )));
        }

        let (user_id, job_id, _ext) = parse_object_path(&trigger.object_path).ok_or_else(|| {
            PipelineError::InvalidUpload(format!("unrecognized path {}", trigger.object_path))
        })?;

        info!("Upload trigger for job {} (user {})", job_id, user_id);

        // Idempotency guard against at-least-once delivery: create the record
        // on first delivery, re-enter only while still processing.
        let now = Utc::now();
        let mut record = JobRecord::new(&job_id, &user_id, &trigger.object_path, now);
        record.duration_minutes = round_minutes(trigger.duration_seconds);

        let created = self.store.store_job(record, None).await?;
        if !created {
            let existing = self
                .store
                .load_job(&job_id)
                .await?
                .ok_or_else(|| PipelineError::NotFound(format!("job/{job_id}")))?;
            if existing.value.status != JobStatus::Processing {
                info!("Duplicate upload trigger for job {}, dropping", job_id);
                return Ok(UploadOutcome::Duplicate);
            }
        }

        self.process_job(&job_id).await?;
        Ok(UploadOutcome::Processed)
    }

    /// Stage 2: claim the transcription lock, debit quota, transcribe,
    /// advance to `transcribed`, then run summarization. Also the re-entry
    /// point for manual resubmission.
    ///
    /// The claim admits at most one worker per job, so concurrent deliveries
    /// of the same trigger cannot debit twice or double-call the provider.
    pub async fn process_job(&self, job_id: &str) -> Result<(), PipelineError> {
        let claim = with_job(&*self.store, job_id, |job| {
            let eligible =
                job.status == JobStatus::Processing && !job.transcription_in_progress;
            if !eligible {
                return Ok(TxDecision::Skip(None));
            }
            job.transcription_in_progress = true;
            job.updated_at = Utc::now();
            Ok(TxDecision::Commit(Some(job.clone())))
        })
        .await?;

        let Some(job) = claim else {
            return Ok(());
        };
        let user_id = job.user_id.clone();

        // Debit once; a redelivered trigger that already charged skips this
        if job.charged_minutes == 0 {
            match quota::debit_tx(&*self.store, &user_id, job.duration_minutes, Utc::now()).await {
                Ok(charged) => {
                    with_job(&*self.store, job_id, |job| {
                        job.charged_minutes = charged;
                        job.updated_at = Utc::now();
                        Ok(TxDecision::Commit(()))
                    })
                    .await?;
                }
                Err(PipelineError::QuotaExceeded { reason }) => {
                    // Nothing was charged; block until manual resubmission
                    warn!("Job {} blocked by quota: {}", job_id, reason.as_str());
                    with_job(&*self.store, job_id, |job| {
                        job.status = JobStatus::BlockedQuota;
                        job.quota_reason = Some(reason.as_str().to_string());
                        job.transcription_in_progress = false;
                        job.updated_at = Utc::now();
                        Ok(TxDecision::Commit(()))
                    })
                    .await?;
                    return Ok(());
                }
                Err(other) => {
                    self.release_transcription_claim(job_id).await?;
                    return Err(other);
                }
            }
        }

        match self.transcribe_job(&job).await {
            Ok(transcript) => {
                with_job(&*self.store, job_id, |job| {
                    job.status = JobStatus::Transcribed;
                    job.transcript = Some(transcript.clone());
                    job.transcription_in_progress = false;
                    job.updated_at = Utc::now();
                    Ok(TxDecision::Commit(()))
                })
                .await?;
                info!("Job {} transcribed", job_id);

                self.run_summarization(job_id).await
            }
            Err(err) if err.is_rate_limit() => {
                // Not a job failure; release the claim and leave the record
                // processing so the platform's redelivery retries the stage
                self.release_transcription_claim(job_id).await?;
                Err(err)
            }
            Err(err) => {
                self.fail_job(job_id, &user_id, &err.to_string()).await?;
                Ok(())
            }
        }
    }

    async fn release_transcription_claim(&self, job_id: &str) -> Result<(), PipelineError> {
        with_job(&*self.store, job_id, |job| {
            job.transcription_in_progress = false;
            job.updated_at = Utc::now();
            Ok(TxDecision::Commit(()))
        })
        .await
    }

    async fn transcribe_job(&self, job: &JobRecord) -> Result<String, PipelineError> {
        let ext = job
            .object_path
            .rsplit_once('.')
            .map(|(_, ext)| ext)
            .unwrap_or_default();
        let mime = mime_for_extension(ext);

        let bytes = self.audio.fetch(&job.object_path).await?;
        let mut pieces = Vec::new();

        for segment in bytes.chunks(AUDIO_SEGMENT_BYTES.max(1)) {
            let text = self
                .gated(&job.user_id, OperationKind::Transcribe, || async {
                    Ok(self.provider.transcribe(segment, mime).await?)
                })
                .await?;
            pieces.push(text);
        }

        let transcript = pieces.join("\n").trim().to_string();
        if transcript.is_empty() {
            return Err(PipelineError::Provider(
                "transcription produced no text".to_string(),
            ));
        }
        Ok(transcript)
    }

    /// Stage 3+4: claim the summarization lock, summarize, advance to
    /// `ready`, then fan out notification and pending translations.
    ///
    /// The claim admits at most one summarizer: it only succeeds while the
    /// job is `transcribed` with no summary and no active claim.
    pub async fn run_summarization(&self, job_id: &str) -> Result<(), PipelineError> {
        let claim = with_job(&*self.store, job_id, |job| {
            let eligible = job.status == JobStatus::Transcribed
                && job.summary.is_none()
                && !job.summary_in_progress;
            if !eligible {
                return Ok(TxDecision::Skip(None));
            }
            job.summary_in_progress = true;
            job.status = JobStatus::Summarizing;
            job.updated_at = Utc::now();
            Ok(TxDecision::Commit(Some((
                job.user_id.clone(),
                job.transcript.clone().unwrap_or_default(),
            ))))
        })
        .await?;

        let Some((user_id, transcript)) = claim else {
            return Ok(());
        };

        let result = self
            .gated(&user_id, OperationKind::Summarize, || async {
                self.summarizer.summarize(&transcript).await
            })
            .await;

        match result {
            Ok(summary) => {
                with_job(&*self.store, job_id, |job| {
                    job.summary = Some(summary.clone());
                    job.status = JobStatus::Ready;
                    job.summary_in_progress = false;
                    job.updated_at = Utc::now();
                    Ok(TxDecision::Commit(()))
                })
                .await?;
                info!("Job {} ready", job_id);

                self.fan_out(job_id).await;
                Ok(())
            }
            Err(err) => {
                error!("Summarization failed for job {}: {}", job_id, err);
                self.fail_job(job_id, &user_id, &err.to_string()).await?;
                Ok(())
            }
        }
    }

    /// Run the independent post-ready workers; each takes its own claim, so
    /// failures here never affect the job's ready state.
    async fn fan_out(&self, job_id: &str) {
        if let Err(err) = self.run_notification(job_id).await {
            warn!("Notification stage for job {} failed: {}", job_id, err);
        }

        let pending = match self.store.load_job(job_id).await {
            Ok(Some(job)) => job
                .value
                .summary_translation_requests
                .keys()
                .cloned()
                .collect::<Vec<_>>(),
            _ => Vec::new(),
        };

        // Languages run concurrently; each holds its own claim
        let results = join_all(
            pending
                .iter()
                .map(|language| self.run_translation(job_id, language)),
        )
        .await;
        for (language, result) in pending.iter().zip(results) {
            if let Err(err) = result {
                warn!(
                    "Translation ({}) for job {} failed: {}",
                    language, job_id, err
                );
            }
        }
    }

    /// Record a translation request and run the translation worker.
    pub async fn request_translation(
        &self,
        job_id: &str,
        language: &str,
    ) -> Result<TranslationOutcome, PipelineError> {
        let language = language.to_ascii_lowercase();

        if !SUPPORTED_LANGUAGES.contains(&language.as_str()) {
            // Rejected synchronously: clear the request, record the error,
            // never claim the in-progress lock
            with_job(&*self.store, job_id, |job| {
                job.summary_translation_requests.remove(&language);
                job.summary_translation_errors
                    .insert(language.clone(), "unsupported language".to_string());
                job.updated_at = Utc::now();
                Ok(TxDecision::Commit(()))
            })
            .await?;
            return Ok(TranslationOutcome::Unsupported);
        }

        with_job(&*self.store, job_id, |job| {
            if job.summary_translations.contains_key(&language) {
                return Ok(TxDecision::Skip(()));
            }
            job.summary_translation_requests.insert(language.clone(), true);
            job.summary_translation_errors.remove(&language);
            job.updated_at = Utc::now();
            Ok(TxDecision::Commit(()))
        })
        .await?;

        self.run_translation(job_id, &language).await
    }

    /// Translate the summary into one language under its own per-language
    /// claim, so languages run concurrently without interfering.
    pub async fn run_translation(
        &self,
        job_id: &str,
        language: &str,
    ) -> Result<TranslationOutcome, PipelineError> {
        let claim = with_job(&*self.store, job_id, |job| {
            if job.summary_translations.contains_key(language) {
                return Ok(TxDecision::Skip(Claim::Done));
            }
            let claimed = job
                .summary_translation_in_progress
                .get(language)
                .copied()
                .unwrap_or(false);
            let summary = match &job.summary {
                Some(summary) if job.status == JobStatus::Ready && !claimed => summary.clone(),
                _ => return Ok(TxDecision::Skip(Claim::Lost)),
            };
            // A language is pending or in-progress, never both
            job.summary_translation_requests.remove(language);
            job.summary_translation_in_progress
                .insert(language.to_string(), true);
            job.updated_at = Utc::now();
            Ok(TxDecision::Commit(Claim::Won((job.user_id.clone(), summary))))
        })
        .await?;

        let (user_id, summary) = match claim {
            Claim::Done => return Ok(TranslationOutcome::AlreadyTranslated),
            Claim::Lost => return Ok(TranslationOutcome::NotClaimed),
            Claim::Won(inner) => inner,
        };

        let result = self
            .gated(&user_id, OperationKind::Translate, || async {
                self.summarizer.translate(&summary, language).await
            })
            .await;

        match result {
            Ok(translated) => {
                with_job(&*self.store, job_id, |job| {
                    job.summary_translations
                        .insert(language.to_string(), translated.clone());
                    job.summary_translation_in_progress.remove(language);
                    job.summary_translation_errors.remove(language);
                    job.updated_at = Utc::now();
                    Ok(TxDecision::Commit(()))
                })
                .await?;
                info!("Job {} translated to {}", job_id, language);
                Ok(TranslationOutcome::Completed)
            }
            Err(err) => {
                with_job(&*self.store, job_id, |job| {
                    job.summary_translation_errors
                        .insert(language.to_string(), err.to_string());
                    job.summary_translation_in_progress.remove(language);
                    job.updated_at = Utc::now();
                    Ok(TxDecision::Commit(()))
                })
                .await?;
                Err(err)
            }
        }
    }

    /// Send the ready notification at most once, guarded by the permanent
    /// sent-at marker and its own claim.
    pub async fn run_notification(&self, job_id: &str) -> Result<(), PipelineError> {
        let claim = with_job(&*self.store, job_id, |job| {
            let eligible = job.status == JobStatus::Ready
                && job.summary_notification_sent_at.is_none()
                && !job.summary_notification_in_progress;
            if !eligible {
                return Ok(TxDecision::Skip(None));
            }
            job.summary_notification_in_progress = true;
            job.updated_at = Utc::now();
            Ok(TxDecision::Commit(Some((
                job.user_id.clone(),
                job.summary
                    .as_ref()
                    .map(|s| s.main_theme.clone())
                    .unwrap_or_default(),
            ))))
        })
        .await?;

        let Some((user_id, title)) = claim else {
            return Ok(());
        };

        let sent = self
            .push
            .send_summary_ready(&user_id, job_id, &title)
            .await;

        // Clear the claim on both paths; only success sets the marker
        with_job(&*self.store, job_id, |job| {
            job.summary_notification_in_progress = false;
            if sent.is_ok() {
                job.summary_notification_sent_at = Some(Utc::now());
            }
            job.updated_at = Utc::now();
            Ok(TxDecision::Commit(()))
        })
        .await?;

        sent
    }

    /// Manual retry of a quota-blocked job; the only way out of that state.
    pub async fn resubmit(&self, job_id: &str) -> Result<(), PipelineError> {
        let reopened = with_job(&*self.store, job_id, |job| {
            if job.status != JobStatus::BlockedQuota {
                return Ok(TxDecision::Skip(false));
            }
            job.status = JobStatus::Processing;
            job.quota_reason = None;
            job.updated_at = Utc::now();
            Ok(TxDecision::Commit(true))
        })
        .await?;

        if !reopened {
            return Err(PipelineError::InvalidUpload(
                "job is not blocked on quota".to_string(),
            ));
        }

        info!("Job {} resubmitted", job_id);
        self.process_job(job_id).await
    }

    /// Refund any charged minutes, then mark the job failed with the
    /// underlying message captured verbatim.
    async fn fail_job(
        &self,
        job_id: &str,
        user_id: &str,
        message: &str,
    ) -> Result<(), PipelineError> {
        let charged = self
            .store
            .load_job(job_id)
            .await?
            .map(|job| job.value.charged_minutes)
            .unwrap_or(0);

        if charged > 0 {
            quota::refund_tx(&*self.store, user_id, charged, Utc::now()).await?;
        }

        with_job(&*self.store, job_id, |job| {
            job.status = JobStatus::Failed;
            job.error_message = Some(message.to_string());
            job.transcription_in_progress = false;
            job.summary_in_progress = false;
            job.charged_minutes = 0;
            job.updated_at = Utc::now();
            Ok(TxDecision::Commit(()))
        })
        .await
    }

    /// Run one external call behind the rate limiter: admit, call, release.
    ///
    /// A per-minute rejection sleeps out the window and retries a bounded
    /// number of times; release runs on success and failure alike so the
    /// in-flight slot is always returned.
    async fn gated<T, F, Fut>(
        &self,
        user_id: &str,
        op: OperationKind,
        call: F,
    ) -> Result<T, PipelineError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, PipelineError>>,
    {
        let mut last_err = None;

        for _ in 0..MAX_ADMIT_ATTEMPTS {
            match ratelimit::admit_tx(&*self.store, user_id, op, Utc::now()).await {
                Ok(()) => {
                    let result = call().await;
                    if let Err(release_err) =
                        ratelimit::release_tx(&*self.store, user_id, op, Utc::now()).await
                    {
                        warn!(
                            "Failed to release {} slot for user {}: {}",
                            op.as_str(),
                            user_id,
                            release_err
                        );
                    }
                    return result;
                }
                Err(PipelineError::RateLimitExceeded {
                    reason,
                    retry_after_ms,
                }) => {
                    let wait = retry_after_ms.max(250);
                    info!(
                        "Rate limited ({}) for user {}, retrying in {}ms",
                        reason.as_str(),
                        user_id,
                        wait
                    );
                    last_err = Some(PipelineError::RateLimitExceeded {
                        reason,
                        retry_after_ms,
                    });
                    tokio::time::sleep(Duration::from_millis(wait)).await;
                }
                Err(other) => return Err(other),
            }
        }

        Err(last_err.unwrap_or(PipelineError::TxConflict(format!("user/{user_id}"))))
    }
}

enum Claim<T> {
    Won(T),
    Lost,
    Done,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_path_parses() {
        let (user, job, ext) = parse_object_path("audio/u123/j456.m4a").unwrap();
        assert_eq!(user, "u123");
        assert_eq!(job, "j456");
        assert_eq!(ext, "m4a");
    }

    #[test]
    fn object_path_rejects_malformed() {
        assert!(parse_object_path("video/u/j.m4a").is_none());
        assert!(parse_object_path("audio/u123").is_none());
        assert!(parse_object_path("audio/u/noext").is_none());
        assert!(parse_object_path("audio//j.m4a").is_none());
    }

    #[test]
    fn minutes_round_half_up_with_floor_of_one() {
        assert_eq!(round_minutes(5.0), 1);
        assert_eq!(round_minutes(29.9), 1);
        assert_eq!(round_minutes(90.0), 2);
        assert_eq!(round_minutes(150.1), 3);
        assert_eq!(round_minutes(0.0), 1);
    }
}
