// End-to-end orchestrator tests over the in-memory store
//
// These drive the full state machine with stub collaborators: upload trigger
// through transcription, summarization, the ready notification, translation
// fan-out, quota blocking and manual resubmission.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use minbar_pipeline::{
    AiProvider, AudioFetcher, ChatMessage, JobStatus, MemoryStore, Orchestrator, PipelineError,
    Plan, ProviderError, PushSender, RecordStore, TranslationOutcome, UploadOutcome,
    UploadTrigger, UserRecord,
};
use tokio::sync::{Mutex, Notify};

const SUMMARY_JSON: &str = r#"{
    "mainTheme": "Patience in hardship",
    "keyPoints": ["Sabr is rewarded", "Hardship is a test"],
    "explicitQuotes": ["Indeed, with hardship comes ease"],
    "weeklyActions": ["Check on a sick neighbor"]
}"#;

struct StubProvider {
    transcript: String,
    fail_generation: bool,
}

impl StubProvider {
    fn good() -> Self {
        Self {
            transcript: "All praise is due to Allah. Patience is half of faith.".to_string(),
            fail_generation: false,
        }
    }
}

#[async_trait]
impl AiProvider for StubProvider {
    async fn transcribe(&self, _audio: &[u8], _mime: &str) -> Result<String, ProviderError> {
        Ok(self.transcript.clone())
    }

    async fn generate_json(
        &self,
        _messages: &[ChatMessage],
        _max_output_tokens: u32,
    ) -> Result<String, ProviderError> {
        if self.fail_generation {
            Err(ProviderError::ApiError("model unavailable".to_string()))
        } else {
            Ok(SUMMARY_JSON.to_string())
        }
    }
}

#[derive(Default)]
struct RecordingPush {
    sent: Mutex<Vec<String>>,
}

#[async_trait]
impl PushSender for RecordingPush {
    async fn send_summary_ready(
        &self,
        _user_id: &str,
        job_id: &str,
        _title: &str,
    ) -> Result<(), PipelineError> {
        self.sent.lock().await.push(job_id.to_string());
        Ok(())
    }
}

struct StubFetcher;

#[async_trait]
impl AudioFetcher for StubFetcher {
    async fn fetch(&self, _object_path: &str) -> Result<Vec<u8>, PipelineError> {
        Ok(vec![0u8; 1024])
    }
}

/// Provider that parks translation requests until the test releases them,
/// so the stored record can be inspected mid-stage
struct BlockingTranslateProvider {
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

#[async_trait]
impl AiProvider for BlockingTranslateProvider {
    async fn transcribe(&self, _audio: &[u8], _mime: &str) -> Result<String, ProviderError> {
        Ok("Patience is half of faith.".to_string())
    }

    async fn generate_json(
        &self,
        messages: &[ChatMessage],
        _max_output_tokens: u32,
    ) -> Result<String, ProviderError> {
        if messages.iter().any(|m| m.text.starts_with("Translate")) {
            self.entered.notify_one();
            self.release.notified().await;
        }
        Ok(SUMMARY_JSON.to_string())
    }
}

struct Harness {
    store: Arc<MemoryStore>,
    push: Arc<RecordingPush>,
    orchestrator: Arc<Orchestrator>,
}

fn harness(provider: StubProvider) -> Harness {
    harness_with(Arc::new(provider))
}

fn harness_with(provider: Arc<dyn AiProvider>) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let push = Arc::new(RecordingPush::default());
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&store) as Arc<dyn RecordStore>,
        provider,
        Arc::clone(&push) as Arc<dyn PushSender>,
        Arc::new(StubFetcher),
    ));
    Harness {
        store,
        push,
        orchestrator,
    }
}

fn trigger(path: &str, seconds: f64) -> UploadTrigger {
    UploadTrigger {
        object_path: path.to_string(),
        content_type: "audio/m4a".to_string(),
        size_bytes: 1024,
        duration_seconds: seconds,
    }
}

async fn seed_free_user(store: &MemoryStore, id: &str, lifetime_used: u32) -> Result<()> {
    let mut user = UserRecord::new(id);
    user.free_lifetime_minutes_used = lifetime_used;
    assert!(store.store_user(user, None).await?);
    Ok(())
}

#[tokio::test]
async fn upload_runs_to_ready_and_notifies_once() -> Result<()> {
    let h = harness(StubProvider::good());
    seed_free_user(&h.store, "u1", 0).await?;

    let outcome = h
        .orchestrator
        .handle_upload(&trigger("audio/u1/j1.m4a", 300.0))
        .await?;
    assert_eq!(outcome, UploadOutcome::Processed);

    let job = h.store.load_job("j1").await?.unwrap().value;
    assert_eq!(job.status, JobStatus::Ready);
    assert_eq!(job.duration_minutes, 5);
    assert_eq!(job.charged_minutes, 5);
    assert!(job.transcript.as_deref().unwrap().contains("Patience"));
    let summary = job.summary.unwrap();
    assert_eq!(summary.main_theme, "Patience in hardship");
    assert!(!job.summary_in_progress);
    assert!(job.summary_notification_sent_at.is_some());
    assert!(!job.summary_notification_in_progress);

    let user = h.store.load_user("u1").await?.unwrap().value;
    assert_eq!(user.free_lifetime_minutes_used, 5);
    assert_eq!(user.monthly_minutes_used, 5);

    // The permanent marker makes a retriggered send a no-op
    h.orchestrator.run_notification("j1").await?;
    assert_eq!(h.push.sent.lock().await.len(), 1);
    Ok(())
}

#[tokio::test]
async fn duplicate_trigger_is_dropped() -> Result<()> {
    let h = harness(StubProvider::good());
    seed_free_user(&h.store, "u2", 0).await?;

    let t = trigger("audio/u2/j2.m4a", 60.0);
    assert_eq!(h.orchestrator.handle_upload(&t).await?, UploadOutcome::Processed);
    assert_eq!(h.orchestrator.handle_upload(&t).await?, UploadOutcome::Duplicate);

    // Only one charge despite redelivery
    let user = h.store.load_user("u2").await?.unwrap().value;
    assert_eq!(user.free_lifetime_minutes_used, 1);
    Ok(())
}

#[tokio::test]
async fn quota_blocked_job_recovers_after_resubmission() -> Result<()> {
    let h = harness(StubProvider::good());
    seed_free_user(&h.store, "u3", 58).await?;

    h.orchestrator
        .handle_upload(&trigger("audio/u3/j3.m4a", 300.0))
        .await?;

    let job = h.store.load_job("j3").await?.unwrap().value;
    assert_eq!(job.status, JobStatus::BlockedQuota);
    assert_eq!(job.quota_reason.as_deref(), Some("free_lifetime_exceeded"));
    assert_eq!(job.charged_minutes, 0);

    // User upgrades; a manual resubmission is the only way out of the block
    let user = h.store.load_user("u3").await?.unwrap();
    let mut upgraded = user.value;
    upgraded.plan = Plan::Premium;
    assert!(h.store.store_user(upgraded, Some(user.version)).await?);

    h.orchestrator.resubmit("j3").await?;

    let job = h.store.load_job("j3").await?.unwrap().value;
    assert_eq!(job.status, JobStatus::Ready);
    assert_eq!(job.charged_minutes, 5);
    assert!(job.quota_reason.is_none());
    Ok(())
}

#[tokio::test]
async fn resubmit_rejects_jobs_not_blocked_on_quota() -> Result<()> {
    let h = harness(StubProvider::good());
    seed_free_user(&h.store, "u4", 0).await?;

    h.orchestrator
        .handle_upload(&trigger("audio/u4/j4.m4a", 60.0))
        .await?;

    let err = h.orchestrator.resubmit("j4").await.unwrap_err();
    assert!(matches!(err, PipelineError::InvalidUpload(_)));
    Ok(())
}

#[tokio::test]
async fn summarization_failure_fails_job_and_refunds() -> Result<()> {
    let mut provider = StubProvider::good();
    provider.fail_generation = true;
    let h = harness(provider);
    seed_free_user(&h.store, "u5", 0).await?;

    h.orchestrator
        .handle_upload(&trigger("audio/u5/j5.m4a", 300.0))
        .await?;

    let job = h.store.load_job("j5").await?.unwrap().value;
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error_message.as_deref().unwrap().contains("model unavailable"));
    assert!(!job.summary_in_progress);
    assert_eq!(job.charged_minutes, 0);

    // The charged minutes came back
    let user = h.store.load_user("u5").await?.unwrap().value;
    assert_eq!(user.free_lifetime_minutes_used, 0);
    assert_eq!(user.monthly_minutes_used, 0);

    // No notification for a failed job
    assert!(h.push.sent.lock().await.is_empty());
    Ok(())
}

#[tokio::test]
async fn empty_transcription_fails_the_job() -> Result<()> {
    let provider = StubProvider {
        transcript: "   ".to_string(),
        fail_generation: false,
    };
    let h = harness(provider);
    seed_free_user(&h.store, "u6", 0).await?;

    h.orchestrator
        .handle_upload(&trigger("audio/u6/j6.m4a", 120.0))
        .await?;

    let job = h.store.load_job("j6").await?.unwrap().value;
    assert_eq!(job.status, JobStatus::Failed);

    let user = h.store.load_user("u6").await?.unwrap().value;
    assert_eq!(user.free_lifetime_minutes_used, 0);
    Ok(())
}

#[tokio::test]
async fn translation_fan_out_and_unsupported_language() -> Result<()> {
    let h = harness(StubProvider::good());
    seed_free_user(&h.store, "u7", 0).await?;

    h.orchestrator
        .handle_upload(&trigger("audio/u7/j7.m4a", 60.0))
        .await?;

    let outcome = h.orchestrator.request_translation("j7", "ar").await?;
    assert_eq!(outcome, TranslationOutcome::Completed);

    let job = h.store.load_job("j7").await?.unwrap().value;
    assert!(job.summary_translations.contains_key("ar"));
    assert!(job.summary_translation_requests.is_empty());
    assert!(job.summary_translation_in_progress.is_empty());

    // Re-requesting a completed language is a no-op
    let outcome = h.orchestrator.request_translation("j7", "ar").await?;
    assert_eq!(outcome, TranslationOutcome::AlreadyTranslated);

    // Unsupported code rejected without claiming anything
    let outcome = h.orchestrator.request_translation("j7", "xx").await?;
    assert_eq!(outcome, TranslationOutcome::Unsupported);

    let job = h.store.load_job("j7").await?.unwrap().value;
    assert_eq!(
        job.summary_translation_errors.get("xx").map(String::as_str),
        Some("unsupported language")
    );
    assert!(!job.summary_translation_in_progress.contains_key("xx"));
    Ok(())
}

#[tokio::test]
async fn concurrent_duplicate_triggers_charge_once() -> Result<()> {
    let h = harness(StubProvider::good());
    seed_free_user(&h.store, "u9", 0).await?;

    // Two workers receive the same at-least-once trigger at the same time
    let t = trigger("audio/u9/j9.m4a", 300.0);
    let (first, second) = tokio::join!(
        h.orchestrator.handle_upload(&t),
        h.orchestrator.handle_upload(&t)
    );
    first?;
    second?;

    let user = h.store.load_user("u9").await?.unwrap().value;
    assert_eq!(
        user.free_lifetime_minutes_used, 5,
        "one 5-minute recording must charge exactly 5 minutes"
    );
    assert_eq!(user.monthly_minutes_used, 5);

    let job = h.store.load_job("j9").await?.unwrap().value;
    assert_eq!(job.status, JobStatus::Ready);
    assert_eq!(job.charged_minutes, 5);
    assert!(!job.transcription_in_progress);
    assert_eq!(h.push.sent.lock().await.len(), 1);
    Ok(())
}

#[tokio::test]
async fn claimed_translation_is_no_longer_pending() -> Result<()> {
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let h = harness_with(Arc::new(BlockingTranslateProvider {
        entered: Arc::clone(&entered),
        release: Arc::clone(&release),
    }));
    seed_free_user(&h.store, "u10", 0).await?;

    h.orchestrator
        .handle_upload(&trigger("audio/u10/j10.m4a", 60.0))
        .await?;

    let orchestrator = Arc::clone(&h.orchestrator);
    let worker = tokio::spawn(async move { orchestrator.request_translation("j10", "fr").await });

    // While the provider call is running the language sits only in the
    // in-progress claim, not in the request map
    entered.notified().await;
    let job = h.store.load_job("j10").await?.unwrap().value;
    assert!(!job.summary_translation_requests.contains_key("fr"));
    assert_eq!(job.summary_translation_in_progress.get("fr"), Some(&true));

    release.notify_one();
    assert_eq!(worker.await??, TranslationOutcome::Completed);

    let job = h.store.load_job("j10").await?.unwrap().value;
    assert!(job.summary_translations.contains_key("fr"));
    assert!(job.summary_translation_in_progress.is_empty());
    assert!(job.summary_translation_requests.is_empty());
    Ok(())
}

#[tokio::test]
async fn oversized_or_non_audio_uploads_are_rejected() -> Result<()> {
    let h = harness(StubProvider::good());

    let mut bad_type = trigger("audio/u8/j8.m4a", 60.0);
    bad_type.content_type = "video/mp4".to_string();
    assert!(matches!(
        h.orchestrator.handle_upload(&bad_type).await,
        Err(PipelineError::InvalidUpload(_))
    ));

    let mut too_big = trigger("audio/u8/j8.m4a", 60.0);
    too_big.size_bytes = 101 * 1024 * 1024;
    assert!(matches!(
        h.orchestrator.handle_upload(&too_big).await,
        Err(PipelineError::InvalidUpload(_))
    ));

    assert!(matches!(
        h.orchestrator.handle_upload(&trigger("upload/u8/j8.m4a", 60.0)).await,
        Err(PipelineError::InvalidUpload(_))
    ));
    Ok(())
}
