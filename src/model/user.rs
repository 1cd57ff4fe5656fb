use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Subscription plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Plan {
    Free,
    Premium,
}

/// Kind of external AI operation, each with its own rate window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Transcribe,
    Summarize,
    Translate,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Transcribe => "transcribe",
            OperationKind::Summarize => "summarize",
            OperationKind::Translate => "translate",
        }
    }
}

/// Per-operation rate limiter state stored on the user record
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateWindow {
    /// UTC minute bucket (`YYYYMMDDHHmm`) the count belongs to
    pub minute_key: Option<String>,

    /// Calls admitted within the current minute bucket
    pub minute_count: u32,

    /// Currently executing operations of this kind
    pub in_flight: u32,

    /// Last time in_flight changed; stale values self-heal after a TTL
    pub in_flight_updated_at: Option<DateTime<Utc>>,
}

/// One record per subscriber, mutated by the ledger, the reconciler and the
/// rate limiter, each in its own transaction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub user_id: String,

    pub plan: Plan,

    /// Billing-period bucket the monthly counter belongs to, derived from
    /// period_start; any read of monthly usage must resolve rollover first
    pub monthly_key: Option<String>,

    /// Minutes charged within the current billing period
    pub monthly_minutes_used: u32,

    /// Minutes ever charged on the free plan; monotonic, never reset
    pub free_lifetime_minutes_used: u32,

    /// Current billing window start; always before renews_at
    pub period_start: Option<DateTime<Utc>>,

    /// Current billing window end
    pub renews_at: Option<DateTime<Utc>>,

    /// Latest billing-event timestamp applied; staleness guard for webhooks
    pub entitlement_updated_at: Option<DateTime<Utc>>,

    pub transcribe_window: RateWindow,
    pub summarize_window: RateWindow,
    pub translate_window: RateWindow,
}

impl UserRecord {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            plan: Plan::Free,
            monthly_key: None,
            monthly_minutes_used: 0,
            free_lifetime_minutes_used: 0,
            period_start: None,
            renews_at: None,
            entitlement_updated_at: None,
            transcribe_window: RateWindow::default(),
            summarize_window: RateWindow::default(),
            translate_window: RateWindow::default(),
        }
    }

    pub fn window(&self, op: OperationKind) -> &RateWindow {
        match op {
            OperationKind::Transcribe => &self.transcribe_window,
            OperationKind::Summarize => &self.summarize_window,
            OperationKind::Translate => &self.translate_window,
        }
    }

    pub fn window_mut(&mut self, op: OperationKind) -> &mut RateWindow {
        match op {
            OperationKind::Transcribe => &mut self.transcribe_window,
            OperationKind::Summarize => &mut self.summarize_window,
            OperationKind::Translate => &mut self.translate_window,
        }
    }
}
