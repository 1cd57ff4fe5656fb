//! Entitlement reconciler: maps billing-webhook events onto the user record.
//!
//! Webhook providers evolve their payloads, so extraction works off ordered
//! candidate key lists per logical field and stays isolated from the
//! reconciliation logic it feeds. Reconciliation itself is a single
//! idempotent merge guarded by the latest-event timestamp, which makes
//! redelivered webhooks safe.

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::PipelineError;
use crate::model::{Plan, UserRecord};
use crate::quota::monthly_key;
use crate::store::{with_user, RecordStore, TxDecision};

/// Normalized view of one billing event, every field optional
#[derive(Debug, Clone, Default)]
pub struct EntitlementEvent {
    pub user_id: Option<String>,
    pub event_type: Option<String>,
    pub event_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub period_start: Option<DateTime<Utc>>,
    pub renews_at: Option<DateTime<Utc>>,
    pub entitlement_id: Option<String>,
}

const USER_ID_KEYS: &[&str] = &["app_user_id", "appUserId", "user_id", "userId", "original_app_user_id"];
const EVENT_TYPE_KEYS: &[&str] = &["type", "event_type", "eventType", "notification_type"];
const EVENT_AT_KEYS: &[&str] = &["event_timestamp_ms", "event_timestamp", "updated_at", "updatedAt"];
const EXPIRES_KEYS: &[&str] = &["expiration_at_ms", "expires_date_ms", "expires_at", "expiresAt", "expires_date"];
const PERIOD_START_KEYS: &[&str] = &["period_start", "periodStart", "current_period_start", "purchased_at_ms"];
const RENEWS_KEYS: &[&str] = &["renews_at", "renewsAt", "current_period_end", "renewal_at_ms"];
const ENTITLEMENT_KEYS: &[&str] = &[
    "entitlement_id",
    "entitlementId",
    "entitlement_ids",
    "entitlementIds",
    "product_id",
    "productId",
];

impl EntitlementEvent {
    /// Extract known fields from an arbitrary provider envelope.
    ///
    /// Looks at the root object first, then one level down under `event`,
    /// taking the first candidate key that yields a usable value.
    pub fn parse(payload: &Value) -> Self {
        let scopes: Vec<&Value> = std::iter::once(payload)
            .chain(payload.get("event"))
            .collect();

        Self {
            user_id: find_string(&scopes, USER_ID_KEYS),
            event_type: find_string(&scopes, EVENT_TYPE_KEYS),
            event_at: find_timestamp(&scopes, EVENT_AT_KEYS),
            expires_at: find_timestamp(&scopes, EXPIRES_KEYS),
            period_start: find_timestamp(&scopes, PERIOD_START_KEYS),
            renews_at: find_timestamp(&scopes, RENEWS_KEYS),
            entitlement_id: find_entitlement(&scopes),
        }
    }

    /// True when the event carries something the reconciler can act on
    pub fn is_relevant(&self) -> bool {
        self.user_id.is_some()
            && (self.event_type.is_some()
                || self.expires_at.is_some()
                || self.renews_at.is_some()
                || self.entitlement_id.is_some())
    }
}

fn find_string(scopes: &[&Value], keys: &[&str]) -> Option<String> {
    for scope in scopes {
        for key in keys {
            if let Some(s) = scope.get(*key).and_then(Value::as_str) {
                if !s.is_empty() {
                    return Some(s.to_string());
                }
            }
        }
    }
    None
}

fn find_timestamp(scopes: &[&Value], keys: &[&str]) -> Option<DateTime<Utc>> {
    for scope in scopes {
        for key in keys {
            if let Some(value) = scope.get(*key) {
                if let Some(ts) = parse_timestamp(value, key) {
                    return Some(ts);
                }
            }
        }
    }
    None
}

/// Accepts epoch milliseconds, epoch seconds, or RFC 3339 strings
fn parse_timestamp(value: &Value, key: &str) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => {
            let raw = n.as_i64()?;
            if key.ends_with("_ms") || raw > 100_000_000_000 {
                Utc.timestamp_millis_opt(raw).single()
            } else {
                Utc.timestamp_opt(raw, 0).single()
            }
        }
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        _ => None,
    }
}

/// Entitlement ids may arrive as a string or as a list of ids
fn find_entitlement(scopes: &[&Value]) -> Option<String> {
    for scope in scopes {
        for key in ENTITLEMENT_KEYS {
            match scope.get(*key) {
                Some(Value::String(s)) if !s.is_empty() => return Some(s.clone()),
                Some(Value::Array(items)) => {
                    if let Some(first) = items.iter().find_map(Value::as_str) {
                        return Some(first.to_string());
                    }
                }
                _ => {}
            }
        }
    }
    None
}

/// True iff a stored update timestamp exists and is at or past the incoming
/// event's timestamp; stale events are discarded with no writes.
pub fn is_stale(
    stored_updated_at: Option<DateTime<Utc>>,
    incoming_updated_at: Option<DateTime<Utc>>,
) -> bool {
    match (stored_updated_at, incoming_updated_at) {
        (Some(stored), Some(incoming)) => stored >= incoming,
        _ => false,
    }
}

/// An explicit expiration event is always inactive; otherwise the
/// entitlement is active iff it has no expiry or the expiry is in the future.
pub fn is_entitlement_active(
    event_type: Option<&str>,
    expires_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> bool {
    if let Some(kind) = event_type {
        if kind.to_ascii_lowercase().contains("expiration") {
            return false;
        }
    }
    expires_at.map_or(true, |at| at > now)
}

/// Carry or reset the monthly counter across a plan/period change.
///
/// Preserved when the incoming premium period matches the stored one; reset
/// when the premium period advanced, the user newly became premium, or no
/// prior period exists. Non-premium incoming plans leave usage untouched so a
/// premium-to-free transition does not erase free-plan history.
pub fn resolve_monthly_minutes_used(
    existing: &UserRecord,
    incoming_plan: Plan,
    incoming_period: Option<(DateTime<Utc>, DateTime<Utc>)>,
) -> u32 {
    if incoming_plan != Plan::Premium {
        return existing.monthly_minutes_used;
    }

    match incoming_period {
        Some((start, renews)) => {
            let same_period = existing.plan == Plan::Premium
                && existing.period_start == Some(start)
                && existing.renews_at == Some(renews);
            if same_period {
                existing.monthly_minutes_used
            } else {
                0
            }
        }
        None => {
            if existing.plan == Plan::Premium && existing.period_start.is_some() {
                existing.monthly_minutes_used
            } else {
                0
            }
        }
    }
}

/// Result of applying one webhook event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Applied,
    Stale,
    Irrelevant,
}

/// Apply one parsed billing event to the user record in a single merge.
pub async fn reconcile_tx<S: RecordStore + ?Sized>(
    store: &S,
    event: &EntitlementEvent,
    now: DateTime<Utc>,
) -> Result<ReconcileOutcome, PipelineError> {
    if !event.is_relevant() {
        debug!("billing event carries no entitlement signal, ignoring");
        return Ok(ReconcileOutcome::Irrelevant);
    }
    let user_id = event.user_id.clone().unwrap_or_default();

    let active = is_entitlement_active(event.event_type.as_deref(), event.expires_at, now);
    let plan = if active { Plan::Premium } else { Plan::Free };
    let period = match (event.period_start, event.renews_at) {
        (Some(start), Some(renews)) if start < renews => Some((start, renews)),
        _ => None,
    };

    let outcome = with_user(store, &user_id, |user| {
        if is_stale(user.entitlement_updated_at, event.event_at) {
            return Ok(TxDecision::Skip(ReconcileOutcome::Stale));
        }

        user.monthly_minutes_used = resolve_monthly_minutes_used(user, plan, period);
        user.plan = plan;
        if let Some((start, renews)) = period {
            user.period_start = Some(start);
            user.renews_at = Some(renews);
            user.monthly_key = Some(monthly_key(start));
        }
        user.entitlement_updated_at = event.event_at.or(Some(now));

        Ok(TxDecision::Commit(ReconcileOutcome::Applied))
    })
    .await?;

    if outcome == ReconcileOutcome::Applied {
        info!("Entitlement reconciled for user {}: {:?}", user_id, plan);
    }
    Ok(outcome)
}
