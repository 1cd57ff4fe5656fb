// Integration tests for the entitlement reconciler
//
// These verify that billing-webhook events merge idempotently into the user
// record: redeliveries preserve the monthly counter, stale events are
// dropped, and plan transitions reset or preserve usage correctly.

use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use minbar_pipeline::entitlement::{reconcile_tx, EntitlementEvent, ReconcileOutcome};
use minbar_pipeline::{MemoryStore, Plan, RecordStore, UserRecord};
use serde_json::json;

fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
}

fn renewal_event(user_id: &str, event_at: DateTime<Utc>) -> EntitlementEvent {
    EntitlementEvent::parse(&json!({
        "event": {
            "type": "RENEWAL",
            "app_user_id": user_id,
            "event_timestamp_ms": event_at.timestamp_millis(),
            "period_start": at(2024, 2, 1).timestamp_millis(),
            "renews_at": at(2024, 3, 1).timestamp_millis(),
            "expiration_at_ms": at(2024, 3, 1).timestamp_millis(),
            "entitlement_id": "premium",
        }
    }))
}

#[tokio::test]
async fn redelivered_event_preserves_monthly_usage() -> Result<()> {
    let store = MemoryStore::new();
    let now = at(2024, 2, 10);

    let event = renewal_event("u1", at(2024, 2, 1));
    assert_eq!(
        reconcile_tx(&store, &event, now).await?,
        ReconcileOutcome::Applied
    );

    // Minutes accrue within the period
    let mut user = store.load_user("u1").await?.unwrap();
    user.value.monthly_minutes_used = 42;
    assert!(store.store_user(user.value, Some(user.version)).await?);

    // Same event redelivered later with the same period must be stale-dropped
    let redelivery = renewal_event("u1", at(2024, 2, 1));
    assert_eq!(
        reconcile_tx(&store, &redelivery, now).await?,
        ReconcileOutcome::Stale
    );

    // A newer event for the same period preserves usage exactly
    let newer = renewal_event("u1", at(2024, 2, 2));
    assert_eq!(
        reconcile_tx(&store, &newer, now).await?,
        ReconcileOutcome::Applied
    );

    let stored = store.load_user("u1").await?.unwrap().value;
    assert_eq!(stored.plan, Plan::Premium);
    assert_eq!(stored.monthly_minutes_used, 42);
    assert_eq!(stored.period_start, Some(at(2024, 2, 1)));
    Ok(())
}

#[tokio::test]
async fn advanced_period_resets_monthly_usage() -> Result<()> {
    let store = MemoryStore::new();
    let mut user = UserRecord::new("u2");
    user.plan = Plan::Premium;
    user.period_start = Some(at(2024, 1, 1));
    user.renews_at = Some(at(2024, 2, 1));
    user.monthly_minutes_used = 300;
    assert!(store.store_user(user, None).await?);

    let event = renewal_event("u2", at(2024, 2, 1));
    reconcile_tx(&store, &event, at(2024, 2, 1)).await?;

    let stored = store.load_user("u2").await?.unwrap().value;
    assert_eq!(stored.monthly_minutes_used, 0);
    assert_eq!(stored.period_start, Some(at(2024, 2, 1)));
    Ok(())
}

#[tokio::test]
async fn expiration_downgrades_without_erasing_usage() -> Result<()> {
    let store = MemoryStore::new();
    let mut user = UserRecord::new("u3");
    user.plan = Plan::Premium;
    user.period_start = Some(at(2024, 2, 1));
    user.renews_at = Some(at(2024, 3, 1));
    user.monthly_minutes_used = 17;
    user.free_lifetime_minutes_used = 31;
    assert!(store.store_user(user, None).await?);

    let event = EntitlementEvent::parse(&json!({
        "type": "EXPIRATION",
        "app_user_id": "u3",
        "event_timestamp_ms": at(2024, 3, 2).timestamp_millis(),
    }));
    assert_eq!(
        reconcile_tx(&store, &event, at(2024, 3, 2)).await?,
        ReconcileOutcome::Applied
    );

    let stored = store.load_user("u3").await?.unwrap().value;
    assert_eq!(stored.plan, Plan::Free);
    // Non-premium incoming plan leaves counters untouched
    assert_eq!(stored.monthly_minutes_used, 17);
    assert_eq!(stored.free_lifetime_minutes_used, 31);
    Ok(())
}

#[tokio::test]
async fn newly_premium_user_starts_at_zero() -> Result<()> {
    let store = MemoryStore::new();
    let mut user = UserRecord::new("u4");
    user.monthly_minutes_used = 9;
    assert!(store.store_user(user, None).await?);

    let event = renewal_event("u4", at(2024, 2, 1));
    reconcile_tx(&store, &event, at(2024, 2, 5)).await?;

    let stored = store.load_user("u4").await?.unwrap().value;
    assert_eq!(stored.plan, Plan::Premium);
    assert_eq!(stored.monthly_minutes_used, 0);
    Ok(())
}

#[tokio::test]
async fn event_without_signal_is_irrelevant() -> Result<()> {
    let store = MemoryStore::new();

    let event = EntitlementEvent::parse(&json!({ "api_version": "1.0" }));
    assert_eq!(
        reconcile_tx(&store, &event, Utc::now()).await?,
        ReconcileOutcome::Irrelevant
    );
    Ok(())
}
