//! Credit reservations
//!
//! A reservation pre-charges a fixed cost before an expensive external
//! operation begins. The debit carries no external reference — the caller
//! holds the only [`ReservationToken`] and makes at most one reserve attempt
//! per logical operation. The compensating refund *does* carry a reference
//! derived from the token's attempt id, so a doubled refund call is a
//! storage-level no-op rather than a silent over-credit.

use std::sync::Arc;
use std::time::Duration;

use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use uuid::Uuid;

use crate::error::{LedgerError, LedgerResult};
use crate::store::{DeltaOutcome, LedgerReason, LedgerStore};

/// Proof of a successful reservation.
///
/// Minted once per reserve call; required by `refund`, which uses the
/// attempt id to deduplicate.
#[derive(Debug, Clone)]
pub struct ReservationToken {
    pub attempt_id: Uuid,
    pub account_id: Uuid,
    pub cost: i64,
    /// Balance immediately after the debit.
    pub balance_after: i64,
}

impl ReservationToken {
    /// The external reference a refund of this reservation writes.
    pub fn refund_ref(&self) -> String {
        format!("refund:{}", self.attempt_id)
    }
}

/// Pre-charges and compensating refunds over the ledger store.
#[derive(Clone)]
pub struct ReservationService {
    store: Arc<dyn LedgerStore>,
    refund_retry_base: Duration,
    refund_retry_attempts: usize,
}

impl ReservationService {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self {
            store,
            refund_retry_base: Duration::from_millis(50),
            refund_retry_attempts: 4,
        }
    }

    /// Atomically debit `cost` credits ahead of a paid operation.
    ///
    /// `InsufficientCredits` is a user-facing terminal outcome: surface it,
    /// never retry it.
    pub async fn reserve(&self, account_id: Uuid, cost: i64) -> LedgerResult<ReservationToken> {
        if cost <= 0 {
            return Err(LedgerError::InvalidInput(format!(
                "reservation cost must be positive, got {cost}"
            )));
        }

        let outcome = self
            .store
            .apply_delta(account_id, -cost, LedgerReason::UsageDebit, None)
            .await?;

        // A debit carries no external reference, so the store can only
        // report it applied.
        let balance_after = match outcome {
            DeltaOutcome::Applied { new_balance } => new_balance,
            DeltaOutcome::AlreadyApplied => {
                return Err(LedgerError::Database(
                    "unreferenced debit reported as already applied".to_string(),
                ))
            }
        };

        let token = ReservationToken {
            attempt_id: Uuid::new_v4(),
            account_id,
            cost,
            balance_after,
        };

        tracing::info!(
            account_id = %account_id,
            attempt_id = %token.attempt_id,
            cost = cost,
            new_balance = balance_after,
            "Reserved credits"
        );

        Ok(token)
    }

    /// Credit the reserved amount back after a failed operation.
    ///
    /// Idempotent: the refund's external reference is the reservation's
    /// attempt id, so calling this twice for one token yields
    /// `AlreadyApplied` the second time.
    pub async fn refund(&self, token: &ReservationToken) -> LedgerResult<DeltaOutcome> {
        let outcome = self
            .store
            .apply_delta(
                token.account_id,
                token.cost,
                LedgerReason::UsageRefund,
                Some(&token.refund_ref()),
            )
            .await?;

        match outcome {
            DeltaOutcome::Applied { new_balance } => {
                tracing::info!(
                    account_id = %token.account_id,
                    attempt_id = %token.attempt_id,
                    cost = token.cost,
                    new_balance = new_balance,
                    "Refunded reservation"
                );
            }
            DeltaOutcome::AlreadyApplied => {
                tracing::warn!(
                    account_id = %token.account_id,
                    attempt_id = %token.attempt_id,
                    "Refund already applied for this reservation"
                );
            }
        }

        Ok(outcome)
    }

    /// Refund with exponential backoff.
    ///
    /// A lost refund is a direct financial loss to the user, so transient
    /// storage failures are retried before giving up. Exhausting the
    /// retries logs enough context for manual reconciliation and returns
    /// the final error.
    pub async fn refund_with_retry(&self, token: &ReservationToken) -> LedgerResult<DeltaOutcome> {
        let strategy = ExponentialBackoff::from_millis(self.refund_retry_base.as_millis() as u64)
            .map(jitter)
            .take(self.refund_retry_attempts);

        let result = Retry::spawn(strategy, || self.refund(token)).await;

        if let Err(err) = &result {
            tracing::error!(
                account_id = %token.account_id,
                attempt_id = %token.attempt_id,
                cost = token.cost,
                error = %err,
                "RECONCILIATION NEEDED: refund failed after retries; \
                 account is under-credited by the reservation cost"
            );
        }

        result
    }
}
