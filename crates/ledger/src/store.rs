//! Ledger store
//!
//! Durable, transactional balance storage plus the append-only audit trail.
//! Every balance mutation in the system goes through [`LedgerStore::apply_delta`];
//! nothing else writes `accounts.balance`.
//!
//! Idempotency is folded into the store rather than kept as a separate
//! check-then-act cache: the partial unique index on
//! `ledger_events.external_event_ref` is the guard. `apply_delta` inserts the
//! audit row *before* touching the balance, so two concurrent transactions
//! racing on the same external reference resolve at the index — exactly one
//! wins the insert, the other aborts before the balance is read or written
//! and reports [`DeltaOutcome::AlreadyApplied`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{LedgerError, LedgerResult};

/// Why a balance changed. Stored as text in `ledger_events.reason`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerReason {
    Purchase,
    SubscriptionGrant,
    SubscriptionRenewal,
    UsageDebit,
    UsageRefund,
    ManualAdjustment,
}

impl LedgerReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerReason::Purchase => "purchase",
            LedgerReason::SubscriptionGrant => "subscription_grant",
            LedgerReason::SubscriptionRenewal => "subscription_renewal",
            LedgerReason::UsageDebit => "usage_debit",
            LedgerReason::UsageRefund => "usage_refund",
            LedgerReason::ManualAdjustment => "manual_adjustment",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "purchase" => Some(LedgerReason::Purchase),
            "subscription_grant" => Some(LedgerReason::SubscriptionGrant),
            "subscription_renewal" => Some(LedgerReason::SubscriptionRenewal),
            "usage_debit" => Some(LedgerReason::UsageDebit),
            "usage_refund" => Some(LedgerReason::UsageRefund),
            "manual_adjustment" => Some(LedgerReason::ManualAdjustment),
            _ => None,
        }
    }
}

impl std::fmt::Display for LedgerReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Result of applying a delta.
///
/// `AlreadyApplied` is a normal outcome, not a failure: the external event
/// carrying this reference has been applied before, the balance is already
/// correct, and the caller should acknowledge rather than retry or alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaOutcome {
    Applied { new_balance: i64 },
    AlreadyApplied,
}

/// One immutable audit record of a balance mutation.
#[derive(Debug, Clone, Serialize)]
pub struct LedgerEvent {
    pub id: Uuid,
    pub account_id: Uuid,
    pub delta: i64,
    pub reason: LedgerReason,
    pub external_event_ref: Option<String>,
    pub created_at: OffsetDateTime,
}

/// A billing principal.
#[derive(Debug, Clone, Serialize)]
pub struct Account {
    pub id: Uuid,
    pub balance: i64,
    pub stripe_customer_ref: Option<String>,
    pub created_at: OffsetDateTime,
}

/// Transactional balance storage and audit trail.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Current balance; read-only.
    async fn get_balance(&self, account_id: Uuid) -> LedgerResult<i64>;

    /// Fetch an account row.
    async fn get_account(&self, account_id: Uuid) -> LedgerResult<Account>;

    /// Apply a balance delta atomically with its audit record.
    ///
    /// A non-null `external_ref` deduplicates the mutation: redelivery of an
    /// already-applied reference yields `AlreadyApplied` without touching
    /// the balance. A delta that would drive the balance negative fails with
    /// `InsufficientCredits` and has no effect.
    async fn apply_delta(
        &self,
        account_id: Uuid,
        delta: i64,
        reason: LedgerReason,
        external_ref: Option<&str>,
    ) -> LedgerResult<DeltaOutcome>;

    /// Set the payment-provider customer reference if none is set.
    ///
    /// At most one customer ref per account, never overwritten; a second
    /// call with a different value is a no-op.
    async fn link_customer_ref(&self, account_id: Uuid, customer_ref: &str) -> LedgerResult<()>;

    /// Most recent audit entries for an account, newest first.
    async fn events_for_account(
        &self,
        account_id: Uuid,
        limit: i64,
    ) -> LedgerResult<Vec<LedgerEvent>>;
}

/// Postgres-backed ledger store.
#[derive(Clone)]
pub struct PgLedgerStore {
    pool: sqlx::PgPool,
}

impl PgLedgerStore {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct LedgerEventRow {
    id: Uuid,
    account_id: Uuid,
    delta: i64,
    reason: String,
    external_event_ref: Option<String>,
    created_at: OffsetDateTime,
}

impl From<LedgerEventRow> for LedgerEvent {
    fn from(row: LedgerEventRow) -> Self {
        LedgerEvent {
            id: row.id,
            account_id: row.account_id,
            delta: row.delta,
            // Unknown reason strings can only come from out-of-band writes;
            // surface them as manual adjustments rather than dropping rows.
            reason: LedgerReason::parse(&row.reason).unwrap_or(LedgerReason::ManualAdjustment),
            external_event_ref: row.external_event_ref,
            created_at: row.created_at,
        }
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn get_balance(&self, account_id: Uuid) -> LedgerResult<i64> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT balance FROM accounts WHERE id = $1")
            .bind(account_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some((balance,)) => Ok(balance),
            None => Err(LedgerError::AccountNotFound(account_id)),
        }
    }

    async fn get_account(&self, account_id: Uuid) -> LedgerResult<Account> {
        let row: Option<(Uuid, i64, Option<String>, OffsetDateTime)> = sqlx::query_as(
            "SELECT id, balance, stripe_customer_ref, created_at FROM accounts WHERE id = $1",
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some((id, balance, stripe_customer_ref, created_at)) => Ok(Account {
                id,
                balance,
                stripe_customer_ref,
                created_at,
            }),
            None => Err(LedgerError::AccountNotFound(account_id)),
        }
    }

    async fn apply_delta(
        &self,
        account_id: Uuid,
        delta: i64,
        reason: LedgerReason,
        external_ref: Option<&str>,
    ) -> LedgerResult<DeltaOutcome> {
        let mut tx = self.pool.begin().await?;

        // Audit row first. On a duplicate external reference the unique
        // index aborts us here, before the balance is touched.
        let insert = sqlx::query(
            r#"
            INSERT INTO ledger_events (account_id, delta, reason, external_event_ref)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(account_id)
        .bind(delta)
        .bind(reason.as_str())
        .bind(external_ref)
        .execute(&mut *tx)
        .await;

        if let Err(err) = insert {
            if let sqlx::Error::Database(db_err) = &err {
                if db_err.is_unique_violation() {
                    tracing::debug!(
                        account_id = %account_id,
                        external_ref = ?external_ref,
                        "Duplicate external reference, delta already applied"
                    );
                    return Ok(DeltaOutcome::AlreadyApplied);
                }
                if db_err.is_foreign_key_violation() {
                    return Err(LedgerError::AccountNotFound(account_id));
                }
            }
            return Err(err.into());
        }

        // Guarded single-row update; the predicate is what keeps the
        // balance non-negative under concurrent writers.
        let updated: Option<(i64,)> = sqlx::query_as(
            r#"
            UPDATE accounts
            SET balance = balance + $2, updated_at = NOW()
            WHERE id = $1 AND balance + $2 >= 0
            RETURNING balance
            "#,
        )
        .bind(account_id)
        .bind(delta)
        .fetch_optional(&mut *tx)
        .await?;

        let new_balance = match updated {
            Some((balance,)) => balance,
            None => {
                // Rolls back the audit insert too.
                let existing: Option<(i64,)> =
                    sqlx::query_as("SELECT balance FROM accounts WHERE id = $1")
                        .bind(account_id)
                        .fetch_optional(&mut *tx)
                        .await?;
                return match existing {
                    Some((balance,)) => Err(LedgerError::InsufficientCredits {
                        balance,
                        required: -delta,
                    }),
                    None => Err(LedgerError::AccountNotFound(account_id)),
                };
            }
        };

        tx.commit().await?;

        tracing::debug!(
            account_id = %account_id,
            delta = delta,
            reason = %reason,
            external_ref = ?external_ref,
            new_balance = new_balance,
            "Ledger delta applied"
        );

        Ok(DeltaOutcome::Applied { new_balance })
    }

    async fn link_customer_ref(&self, account_id: Uuid, customer_ref: &str) -> LedgerResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE accounts
            SET stripe_customer_ref = $2, updated_at = NOW()
            WHERE id = $1 AND stripe_customer_ref IS NULL
            "#,
        )
        .bind(account_id)
        .bind(customer_ref)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            tracing::info!(
                account_id = %account_id,
                customer_ref = %customer_ref,
                "Linked payment-provider customer"
            );
        }
        Ok(())
    }

    async fn events_for_account(
        &self,
        account_id: Uuid,
        limit: i64,
    ) -> LedgerResult<Vec<LedgerEvent>> {
        let rows: Vec<LedgerEventRow> = sqlx::query_as(
            r#"
            SELECT id, account_id, delta, reason, external_event_ref, created_at
            FROM ledger_events
            WHERE account_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(account_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(LedgerEvent::from).collect())
    }
}
