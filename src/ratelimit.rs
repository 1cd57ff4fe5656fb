//! Per-user, per-operation admission control in front of the AI provider.
//!
//! Combines a sliding one-minute counter with an in-flight concurrency cap,
//! both stored on the user record and updated transactionally right before
//! work is submitted. Admission is independent of quota: it never consumes
//! metered minutes.

use chrono::{DateTime, Duration, Timelike, Utc};
use tracing::debug;

use crate::error::{PipelineError, RateLimitReason};
use crate::model::{OperationKind, Plan, RateWindow};
use crate::store::{with_user, RecordStore, TxDecision};

/// An in-flight counter untouched for this long belongs to a crashed worker
/// and is treated as zero
pub const IN_FLIGHT_TTL_MINUTES: i64 = 20;

/// Per-tier admission thresholds
#[derive(Debug, Clone, Copy)]
pub struct TierLimits {
    pub per_minute: u32,
    pub max_in_flight: u32,
}

/// Same thresholds for every operation kind in this system
pub fn limits_for(plan: Plan) -> TierLimits {
    match plan {
        Plan::Free => TierLimits {
            per_minute: 2,
            max_in_flight: 2,
        },
        Plan::Premium => TierLimits {
            per_minute: 3,
            max_in_flight: 3,
        },
    }
}

/// UTC minute bucket key, `YYYYMMDDHHmm`
pub fn minute_bucket(now: DateTime<Utc>) -> String {
    now.format("%Y%m%d%H%M").to_string()
}

/// Milliseconds left in the current UTC minute
fn ms_until_next_minute(now: DateTime<Utc>) -> u64 {
    let elapsed = u64::from(now.second()) * 1000 + u64::from(now.timestamp_subsec_millis());
    60_000_u64.saturating_sub(elapsed).max(1)
}

/// Try to admit one operation, mutating the window on success.
///
/// On rejection nothing is mutated; callers running this inside a transaction
/// must abort the write on error.
pub fn admit(
    window: &mut RateWindow,
    limits: &TierLimits,
    now: DateTime<Utc>,
) -> Result<(), PipelineError> {
    // Self-heal an in-flight count a crashed worker never decremented
    let in_flight = match window.in_flight_updated_at {
        Some(at) if now - at > Duration::minutes(IN_FLIGHT_TTL_MINUTES) => 0,
        _ => window.in_flight,
    };

    if in_flight >= limits.max_in_flight {
        return Err(PipelineError::RateLimitExceeded {
            reason: RateLimitReason::InFlight,
            retry_after_ms: 0,
        });
    }

    let bucket = minute_bucket(now);
    let same_bucket = window.minute_key.as_deref() == Some(bucket.as_str());

    if same_bucket && window.minute_count >= limits.per_minute {
        return Err(PipelineError::RateLimitExceeded {
            reason: RateLimitReason::PerMinute,
            retry_after_ms: ms_until_next_minute(now),
        });
    }

    window.minute_count = if same_bucket { window.minute_count + 1 } else { 1 };
    window.minute_key = Some(bucket);
    window.in_flight = in_flight + 1;
    window.in_flight_updated_at = Some(now);
    Ok(())
}

/// Release one in-flight slot; must run on completion or failure of every
/// admitted operation.
pub fn release(window: &mut RateWindow, now: DateTime<Utc>) {
    window.in_flight = window.in_flight.saturating_sub(1);
    window.in_flight_updated_at = Some(now);
}

/// Admit as one transaction against the user record.
pub async fn admit_tx<S: RecordStore + ?Sized>(
    store: &S,
    user_id: &str,
    op: OperationKind,
    now: DateTime<Utc>,
) -> Result<(), PipelineError> {
    with_user(store, user_id, |user| {
        let limits = limits_for(user.plan);
        admit(user.window_mut(op), &limits, now)?;
        Ok(TxDecision::Commit(()))
    })
    .await
}

/// Release as one transaction against the user record.
pub async fn release_tx<S: RecordStore + ?Sized>(
    store: &S,
    user_id: &str,
    op: OperationKind,
    now: DateTime<Utc>,
) -> Result<(), PipelineError> {
    debug!("Releasing {} slot for user {}", op.as_str(), user_id);
    with_user(store, user_id, |user| {
        release(user.window_mut(op), now);
        Ok(TxDecision::Commit(()))
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 30, 15).unwrap()
    }

    #[test]
    fn new_minute_resets_the_counter() {
        let mut window = RateWindow {
            minute_key: Some("202406011229".to_string()),
            minute_count: 2,
            ..Default::default()
        };
        let limits = limits_for(Plan::Free);

        admit(&mut window, &limits, now()).unwrap();
        assert_eq!(window.minute_count, 1);
        assert_eq!(window.minute_key.as_deref(), Some("202406011230"));
    }

    #[test]
    fn stale_in_flight_is_healed() {
        let mut window = RateWindow {
            in_flight: 2,
            in_flight_updated_at: Some(now() - Duration::minutes(IN_FLIGHT_TTL_MINUTES + 1)),
            ..Default::default()
        };
        let limits = limits_for(Plan::Free);

        admit(&mut window, &limits, now()).unwrap();
        assert_eq!(window.in_flight, 1);
    }

    #[test]
    fn in_flight_cap_rejects() {
        let mut window = RateWindow {
            in_flight: 2,
            in_flight_updated_at: Some(now()),
            ..Default::default()
        };
        let limits = limits_for(Plan::Free);

        let err = admit(&mut window, &limits, now()).unwrap_err();
        match err {
            PipelineError::RateLimitExceeded { reason, .. } => {
                assert_eq!(reason, RateLimitReason::InFlight);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(window.in_flight, 2);
    }

    #[test]
    fn release_floors_at_zero() {
        let mut window = RateWindow::default();
        release(&mut window, now());
        assert_eq!(window.in_flight, 0);
    }
}
