//! Quota ledger: billing-period rollover and debit/credit of metered minutes.
//!
//! All arithmetic is pure and operates on whole minutes; rounding from
//! recording duration happens in the orchestrator before the ledger is
//! involved. The `*_tx` wrappers run each operation as one atomic
//! read-modify-write transaction against the user record.

use chrono::{DateTime, Months, Utc};
use tracing::info;

use crate::error::{PipelineError, QuotaReason};
use crate::model::{Plan, UserRecord};
use crate::store::{with_user, RecordStore, TxDecision};

/// No single recording may charge more than this
pub const PER_FILE_CAP_MINUTES: u32 = 70;

/// Total minutes a free-plan user may ever charge
pub const FREE_LIFETIME_MINUTES: u32 = 60;

/// Minutes a premium user may charge per billing period
pub const PREMIUM_MONTHLY_MINUTES: u32 = 500;

/// Billing-period bucket identifier derived from the period start
pub fn monthly_key(period_start: DateTime<Utc>) -> String {
    period_start.format("%Y%m%d").to_string()
}

/// Advance the billing window until `now` falls inside it, resetting the
/// monthly counter on each advance. Returns true when anything changed.
///
/// Renewal adds one calendar month, preserving the day-of-month when valid
/// (clamped to month end otherwise). Idempotent: a second call with the same
/// `now` changes nothing and reports false.
pub fn resolve_period(user: &mut UserRecord, now: DateTime<Utc>) -> bool {
    let (mut period_start, mut renews_at) = match (user.period_start, user.renews_at) {
        (Some(start), Some(end)) if start < end => (start, end),
        // No usable window yet: open one starting now
        _ => {
            let start = now;
            let end = add_month(start);
            user.period_start = Some(start);
            user.renews_at = Some(end);
            user.monthly_key = Some(monthly_key(start));
            user.monthly_minutes_used = 0;
            return true;
        }
    };

    let mut advanced = false;
    while now >= renews_at {
        period_start = renews_at;
        renews_at = add_month(renews_at);
        advanced = true;
    }

    if advanced {
        user.period_start = Some(period_start);
        user.renews_at = Some(renews_at);
        user.monthly_key = Some(monthly_key(period_start));
        user.monthly_minutes_used = 0;
        return true;
    }

    // Repair the key if it drifted from the stored period
    let key = monthly_key(period_start);
    if user.monthly_key.as_deref() != Some(key.as_str()) {
        user.monthly_key = Some(key);
        user.monthly_minutes_used = 0;
        return true;
    }

    false
}

fn add_month(at: DateTime<Utc>) -> DateTime<Utc> {
    // Months::new(1) clamps Jan 31 -> Feb 28/29
    at.checked_add_months(Months::new(1)).unwrap_or(at)
}

/// Charge `minutes` against the user's plan, or fail with a quota reason.
///
/// On failure nothing is mutated; callers running this inside a transaction
/// must abort the write on error.
pub fn debit(
    user: &mut UserRecord,
    minutes: u32,
    now: DateTime<Utc>,
) -> Result<u32, PipelineError> {
    if minutes > PER_FILE_CAP_MINUTES {
        return Err(PipelineError::QuotaExceeded {
            reason: QuotaReason::PerFileCap,
        });
    }

    resolve_period(user, now);

    match user.plan {
        Plan::Free => {
            if user.free_lifetime_minutes_used + minutes > FREE_LIFETIME_MINUTES {
                return Err(PipelineError::QuotaExceeded {
                    reason: QuotaReason::FreeLifetimeExceeded,
                });
            }
            user.free_lifetime_minutes_used += minutes;
            user.monthly_minutes_used += minutes;
        }
        Plan::Premium => {
            if user.monthly_minutes_used + minutes > PREMIUM_MONTHLY_MINUTES {
                return Err(PipelineError::QuotaExceeded {
                    reason: QuotaReason::PremiumMonthlyExceeded,
                });
            }
            user.monthly_minutes_used += minutes;
        }
    }

    Ok(minutes)
}

/// Return previously charged minutes after a downstream failure.
pub fn refund(user: &mut UserRecord, minutes: u32, now: DateTime<Utc>) {
    resolve_period(user, now);

    user.monthly_minutes_used = user.monthly_minutes_used.saturating_sub(minutes);
    if user.plan == Plan::Free {
        user.free_lifetime_minutes_used = user.free_lifetime_minutes_used.saturating_sub(minutes);
    }
}

/// Resolve and persist the billing period as its own transaction; writes
/// nothing when the stored window is already current.
pub async fn resolve_period_tx<S: RecordStore + ?Sized>(
    store: &S,
    user_id: &str,
    now: DateTime<Utc>,
) -> Result<(), PipelineError> {
    with_user(store, user_id, |user| {
        if resolve_period(user, now) {
            Ok(TxDecision::Commit(()))
        } else {
            Ok(TxDecision::Skip(()))
        }
    })
    .await
}

/// Debit as one transaction; aborts with no counter change on quota failure.
pub async fn debit_tx<S: RecordStore + ?Sized>(
    store: &S,
    user_id: &str,
    minutes: u32,
    now: DateTime<Utc>,
) -> Result<u32, PipelineError> {
    let charged = with_user(store, user_id, |user| {
        let charged = debit(user, minutes, now)?;
        Ok(TxDecision::Commit(charged))
    })
    .await?;

    info!("Debited {} minutes for user {}", charged, user_id);
    Ok(charged)
}

/// Refund as one transaction.
pub async fn refund_tx<S: RecordStore + ?Sized>(
    store: &S,
    user_id: &str,
    minutes: u32,
    now: DateTime<Utc>,
) -> Result<(), PipelineError> {
    with_user(store, user_id, |user| {
        refund(user, minutes, now);
        Ok(TxDecision::Commit(()))
    })
    .await?;

    info!("Refunded {} minutes for user {}", minutes, user_id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    #[test]
    fn add_month_preserves_day_and_clamps() {
        assert_eq!(add_month(at(2024, 2, 1)), at(2024, 3, 1));
        assert_eq!(add_month(at(2024, 1, 31)), at(2024, 2, 29));
    }

    #[test]
    fn refund_floors_at_zero() {
        let mut user = UserRecord::new("u1");
        user.period_start = Some(at(2024, 2, 1));
        user.renews_at = Some(at(2024, 3, 1));
        user.monthly_key = Some(monthly_key(at(2024, 2, 1)));
        user.monthly_minutes_used = 3;
        user.free_lifetime_minutes_used = 3;

        refund(&mut user, 10, at(2024, 2, 10));

        assert_eq!(user.monthly_minutes_used, 0);
        assert_eq!(user.free_lifetime_minutes_used, 0);
    }
}
