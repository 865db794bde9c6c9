//! Ledger error types
//!
//! Typed outcomes callers are expected to match on. `InsufficientCredits`
//! and `RateLimited` are user-facing terminal conditions; `ProviderFailed`,
//! `ProviderTimeout` and `StorageFailed` are transient and always follow a
//! compensating refund; signature/timestamp failures reject a webhook before
//! any ledger mutation.

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

pub type LedgerResult<T> = Result<T, LedgerError>;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("account {0} not found")]
    AccountNotFound(Uuid),

    #[error("insufficient credits: balance {balance}, required {required}")]
    InsufficientCredits { balance: i64, required: i64 },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("rate limit exceeded, retry after {retry_after_seconds}s")]
    RateLimited { retry_after_seconds: u64 },

    #[error("webhook signature verification failed")]
    SignatureInvalid,

    #[error("webhook timestamp outside tolerance window")]
    StaleTimestamp,

    #[error("malformed webhook event: {0}")]
    MalformedEvent(String),

    #[error("unable to resolve credit amount: {0}")]
    CreditsUnresolved(String),

    #[error("subscription {0} not found")]
    SubscriptionNotFound(String),

    #[error("generation provider error: {0}")]
    ProviderFailed(String),

    #[error("generation provider timed out after {0:?}")]
    ProviderTimeout(Duration),

    #[error("media storage error: {0}")]
    StorageFailed(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(String),
}

impl From<sqlx::Error> for LedgerError {
    fn from(err: sqlx::Error) -> Self {
        LedgerError::Database(err.to_string())
    }
}

impl LedgerError {
    /// Whether the caller may safely retry the triggering request.
    ///
    /// Transient external failures have already been compensated by the
    /// time they surface, so a user retry never double-spends.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LedgerError::ProviderFailed(_)
                | LedgerError::ProviderTimeout(_)
                | LedgerError::StorageFailed(_)
                | LedgerError::Database(_)
        )
    }
}
