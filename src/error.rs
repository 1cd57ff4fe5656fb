use thiserror::Error;

/// Reason a debit was refused by the quota ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaReason {
    /// Single recording longer than the per-file cap
    PerFileCap,
    /// Free plan lifetime allowance exhausted
    FreeLifetimeExceeded,
    /// Premium plan monthly allowance exhausted
    PremiumMonthlyExceeded,
}

impl QuotaReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuotaReason::PerFileCap => "per_file_cap",
            QuotaReason::FreeLifetimeExceeded => "free_lifetime_exceeded",
            QuotaReason::PremiumMonthlyExceeded => "premium_monthly_exceeded",
        }
    }
}

/// Reason an operation was refused by the rate limiter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitReason {
    PerMinute,
    InFlight,
}

impl RateLimitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateLimitReason::PerMinute => "per_minute",
            RateLimitReason::InFlight => "in_flight",
        }
    }
}

/// Errors produced by the accounting and pipeline layer
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("quota exceeded: {reason:?}")]
    QuotaExceeded { reason: QuotaReason },

    #[error("rate limit exceeded: {reason:?}, retry after {retry_after_ms}ms")]
    RateLimitExceeded {
        reason: RateLimitReason,
        retry_after_ms: u64,
    },

    /// Provider stopped generating because the output hit the token budget
    #[error("token budget exceeded")]
    TokenBudgetExceeded,

    /// Provider output did not match the required summary schema
    #[error("schema invalid: {0}")]
    SchemaInvalid(String),

    #[error("provider request failed: {0}")]
    Provider(String),

    #[error("record not found: {0}")]
    NotFound(String),

    #[error("invalid upload: {0}")]
    InvalidUpload(String),

    /// Versioned write lost the race too many times
    #[error("transaction conflict on {0}")]
    TxConflict(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("notification send failed: {0}")]
    Notification(String),
}

impl PipelineError {
    /// True for errors that should never be persisted as a job failure
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, PipelineError::RateLimitExceeded { .. })
    }
}
