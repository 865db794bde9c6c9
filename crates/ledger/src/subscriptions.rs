//! Subscription records
//!
//! Rows are written by the webhook reconciler and read by the rest of the
//! application. Status is whatever the provider last pushed; concurrent
//! lifecycle events for one account may interleave, which is acceptable
//! because status is re-checked on next use.

use async_trait::async_trait;
use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{LedgerError, LedgerResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Trialing,
    PastDue,
    Canceled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
        }
    }

    /// Map a provider status string onto the closed set; anything
    /// unrecognized is treated as `past_due` so access re-checks fail safe.
    pub fn from_provider(s: &str) -> Self {
        match s {
            "active" => SubscriptionStatus::Active,
            "trialing" => SubscriptionStatus::Trialing,
            "past_due" => SubscriptionStatus::PastDue,
            "canceled" | "cancelled" => SubscriptionStatus::Canceled,
            _ => SubscriptionStatus::PastDue,
        }
    }

    /// Statuses that count against the one-subscription-per-account rule.
    pub fn occupies_account(&self) -> bool {
        matches!(self, SubscriptionStatus::Active | SubscriptionStatus::Trialing)
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Subscription {
    pub id: Uuid,
    pub account_id: Uuid,
    pub external_subscription_ref: String,
    pub plan_ref: String,
    pub credits_per_period: i64,
    pub status: SubscriptionStatus,
    pub current_period_start: OffsetDateTime,
    pub current_period_end: OffsetDateTime,
    pub canceled_at: Option<OffsetDateTime>,
}

/// Fields required to create a subscription row.
#[derive(Debug, Clone)]
pub struct NewSubscription {
    pub account_id: Uuid,
    pub external_subscription_ref: String,
    pub plan_ref: String,
    pub credits_per_period: i64,
    pub status: SubscriptionStatus,
    pub current_period_start: OffsetDateTime,
    pub current_period_end: OffsetDateTime,
}

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn find_by_external_ref(&self, external_ref: &str) -> LedgerResult<Option<Subscription>>;

    /// The account's active or trialing subscription, if any.
    async fn find_occupying_for_account(
        &self,
        account_id: Uuid,
    ) -> LedgerResult<Option<Subscription>>;

    /// Create the row unless one already exists for the external reference.
    ///
    /// Concurrent deliveries of the same checkout event race on the unique
    /// reference; both calls return the surviving row.
    async fn insert_if_absent(&self, sub: NewSubscription) -> LedgerResult<Subscription>;

    /// Advance the billing period window after a renewal.
    async fn update_period(
        &self,
        external_ref: &str,
        period_start: OffsetDateTime,
        period_end: OffsetDateTime,
    ) -> LedgerResult<()>;

    /// Sync status and period end from a provider lifecycle event.
    async fn update_status(
        &self,
        external_ref: &str,
        status: SubscriptionStatus,
        period_end: Option<OffsetDateTime>,
    ) -> LedgerResult<()>;

    /// Terminal cancellation pushed by the provider; effective immediately.
    async fn cancel(&self, external_ref: &str, canceled_at: OffsetDateTime) -> LedgerResult<()>;
}

#[derive(Clone)]
pub struct PgSubscriptionStore {
    pool: sqlx::PgPool,
}

impl PgSubscriptionStore {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct SubscriptionRow {
    id: Uuid,
    account_id: Uuid,
    external_subscription_ref: String,
    plan_ref: String,
    credits_per_period: i64,
    status: String,
    current_period_start: OffsetDateTime,
    current_period_end: OffsetDateTime,
    canceled_at: Option<OffsetDateTime>,
}

impl From<SubscriptionRow> for Subscription {
    fn from(row: SubscriptionRow) -> Self {
        Subscription {
            id: row.id,
            account_id: row.account_id,
            external_subscription_ref: row.external_subscription_ref,
            plan_ref: row.plan_ref,
            credits_per_period: row.credits_per_period,
            status: SubscriptionStatus::from_provider(&row.status),
            current_period_start: row.current_period_start,
            current_period_end: row.current_period_end,
            canceled_at: row.canceled_at,
        }
    }
}

const SELECT_COLUMNS: &str = r#"
    SELECT id, account_id, external_subscription_ref, plan_ref,
           credits_per_period, status, current_period_start,
           current_period_end, canceled_at
    FROM subscriptions
"#;

#[async_trait]
impl SubscriptionStore for PgSubscriptionStore {
    async fn find_by_external_ref(&self, external_ref: &str) -> LedgerResult<Option<Subscription>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            "{SELECT_COLUMNS} WHERE external_subscription_ref = $1"
        ))
        .bind(external_ref)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Subscription::from))
    }

    async fn find_occupying_for_account(
        &self,
        account_id: Uuid,
    ) -> LedgerResult<Option<Subscription>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            r#"{SELECT_COLUMNS}
            WHERE account_id = $1 AND status IN ('active', 'trialing')
            ORDER BY created_at DESC
            LIMIT 1"#
        ))
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Subscription::from))
    }

    async fn insert_if_absent(&self, sub: NewSubscription) -> LedgerResult<Subscription> {
        let inserted: Option<SubscriptionRow> = sqlx::query_as(
            r#"
            INSERT INTO subscriptions
                (account_id, external_subscription_ref, plan_ref, credits_per_period,
                 status, current_period_start, current_period_end)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (external_subscription_ref) DO NOTHING
            RETURNING id, account_id, external_subscription_ref, plan_ref,
                      credits_per_period, status, current_period_start,
                      current_period_end, canceled_at
            "#,
        )
        .bind(sub.account_id)
        .bind(&sub.external_subscription_ref)
        .bind(&sub.plan_ref)
        .bind(sub.credits_per_period)
        .bind(sub.status.as_str())
        .bind(sub.current_period_start)
        .bind(sub.current_period_end)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            return Ok(Subscription::from(row));
        }

        // Lost the race; a concurrent delivery created the row.
        self.find_by_external_ref(&sub.external_subscription_ref)
            .await?
            .ok_or(LedgerError::SubscriptionNotFound(
                sub.external_subscription_ref,
            ))
    }

    async fn update_period(
        &self,
        external_ref: &str,
        period_start: OffsetDateTime,
        period_end: OffsetDateTime,
    ) -> LedgerResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE subscriptions
            SET current_period_start = $2, current_period_end = $3, updated_at = NOW()
            WHERE external_subscription_ref = $1
            "#,
        )
        .bind(external_ref)
        .bind(period_start)
        .bind(period_end)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(LedgerError::SubscriptionNotFound(external_ref.to_string()));
        }
        Ok(())
    }

    async fn update_status(
        &self,
        external_ref: &str,
        status: SubscriptionStatus,
        period_end: Option<OffsetDateTime>,
    ) -> LedgerResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = $2,
                current_period_end = COALESCE($3, current_period_end),
                updated_at = NOW()
            WHERE external_subscription_ref = $1
            "#,
        )
        .bind(external_ref)
        .bind(status.as_str())
        .bind(period_end)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(LedgerError::SubscriptionNotFound(external_ref.to_string()));
        }
        Ok(())
    }

    async fn cancel(&self, external_ref: &str, canceled_at: OffsetDateTime) -> LedgerResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = 'canceled', canceled_at = $2, updated_at = NOW()
            WHERE external_subscription_ref = $1
            "#,
        )
        .bind(external_ref)
        .bind(canceled_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(LedgerError::SubscriptionNotFound(external_ref.to_string()));
        }
        Ok(())
    }
}
