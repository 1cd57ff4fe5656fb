// Integration tests for the per-user, per-operation rate limiter

use anyhow::Result;
use chrono::{DateTime, Duration, TimeZone, Utc};
use minbar_pipeline::ratelimit::{self, IN_FLIGHT_TTL_MINUTES};
use minbar_pipeline::{
    MemoryStore, OperationKind, PipelineError, Plan, RateLimitReason, RecordStore, UserRecord,
};

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 10).unwrap()
}

async fn seed(store: &MemoryStore, id: &str, plan: Plan) -> Result<()> {
    let mut user = UserRecord::new(id);
    user.plan = plan;
    assert!(store.store_user(user, None).await?);
    Ok(())
}

#[tokio::test]
async fn free_tier_third_call_in_same_minute_is_rejected() -> Result<()> {
    let store = MemoryStore::new();
    seed(&store, "u1", Plan::Free).await?;
    let op = OperationKind::Transcribe;

    ratelimit::admit_tx(&store, "u1", op, now()).await?;
    ratelimit::release_tx(&store, "u1", op, now()).await?;
    ratelimit::admit_tx(&store, "u1", op, now()).await?;
    ratelimit::release_tx(&store, "u1", op, now()).await?;

    let err = ratelimit::admit_tx(&store, "u1", op, now()).await.unwrap_err();
    match err {
        PipelineError::RateLimitExceeded {
            reason,
            retry_after_ms,
        } => {
            assert_eq!(reason, RateLimitReason::PerMinute);
            assert!(retry_after_ms <= 60_000);
            assert!(retry_after_ms > 0);
        }
        other => panic!("unexpected error: {other:?}"),
    }

    // Rejection must not have mutated the stored window
    let window = store
        .load_user("u1")
        .await?
        .unwrap()
        .value
        .transcribe_window
        .clone();
    assert_eq!(window.minute_count, 2);
    assert_eq!(window.in_flight, 0);
    Ok(())
}

#[tokio::test]
async fn next_minute_admits_again() -> Result<()> {
    let store = MemoryStore::new();
    seed(&store, "u2", Plan::Free).await?;
    let op = OperationKind::Summarize;

    ratelimit::admit_tx(&store, "u2", op, now()).await?;
    ratelimit::admit_tx(&store, "u2", op, now()).await?;
    assert!(ratelimit::admit_tx(&store, "u2", op, now()).await.is_err());

    let later = now() + Duration::seconds(60);
    // In-flight slots from the previous minute are still held
    ratelimit::release_tx(&store, "u2", op, later).await?;
    ratelimit::admit_tx(&store, "u2", op, later).await?;

    let window = store
        .load_user("u2")
        .await?
        .unwrap()
        .value
        .summarize_window
        .clone();
    assert_eq!(window.minute_count, 1);
    Ok(())
}

#[tokio::test]
async fn in_flight_cap_is_independent_of_minute_count() -> Result<()> {
    let store = MemoryStore::new();
    seed(&store, "u3", Plan::Premium).await?;
    let op = OperationKind::Translate;

    // Premium allows 3 concurrent; spread over minutes so only the
    // concurrency cap can reject
    let mut t = now();
    for _ in 0..3 {
        ratelimit::admit_tx(&store, "u3", op, t).await?;
        t += Duration::seconds(61);
    }

    let err = ratelimit::admit_tx(&store, "u3", op, t).await.unwrap_err();
    assert!(matches!(
        err,
        PipelineError::RateLimitExceeded {
            reason: RateLimitReason::InFlight,
            ..
        }
    ));
    Ok(())
}

#[tokio::test]
async fn crashed_worker_slot_expires_after_ttl() -> Result<()> {
    let store = MemoryStore::new();
    seed(&store, "u4", Plan::Free).await?;
    let op = OperationKind::Transcribe;

    ratelimit::admit_tx(&store, "u4", op, now()).await?;
    ratelimit::admit_tx(&store, "u4", op, now()).await?;

    // Worker died without releasing; after the TTL the slots are reclaimed
    let later = now() + Duration::minutes(IN_FLIGHT_TTL_MINUTES + 1);
    ratelimit::admit_tx(&store, "u4", op, later).await?;

    let window = store
        .load_user("u4")
        .await?
        .unwrap()
        .value
        .transcribe_window
        .clone();
    assert_eq!(window.in_flight, 1);
    Ok(())
}

#[tokio::test]
async fn operations_are_rate_limited_independently() -> Result<()> {
    let store = MemoryStore::new();
    seed(&store, "u5", Plan::Free).await?;

    ratelimit::admit_tx(&store, "u5", OperationKind::Transcribe, now()).await?;
    ratelimit::admit_tx(&store, "u5", OperationKind::Transcribe, now()).await?;
    assert!(
        ratelimit::admit_tx(&store, "u5", OperationKind::Transcribe, now())
            .await
            .is_err()
    );

    // A different operation kind has its own window
    ratelimit::admit_tx(&store, "u5", OperationKind::Summarize, now()).await?;
    Ok(())
}
