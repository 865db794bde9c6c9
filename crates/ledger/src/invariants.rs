//! Ledger invariants
//!
//! Runnable consistency checks over the ledger tables. Run them after a
//! webhook replay or a manual adjustment to confirm the system is in a
//! valid state.
//!
//! Each invariant is a real SQL query; checks only read, never write, and
//! violations carry enough context to debug.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::LedgerResult;

/// Result of running a single invariant check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated.
    pub invariant: String,
    /// Account(s) affected.
    pub account_ids: Vec<Uuid>,
    /// Human-readable description of the violation.
    pub description: String,
    /// Additional context for debugging.
    pub context: serde_json::Value,
    /// Severity level.
    pub severity: ViolationSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Critical - credits may be granted or spent incorrectly
    Critical,
    /// High - data inconsistency that needs attention
    High,
    /// Medium - potential issue, should investigate
    Medium,
    /// Low - minor inconsistency, informational
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct NegativeBalanceRow {
    account_id: Uuid,
    balance: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct BalanceDriftRow {
    account_id: Uuid,
    balance: i64,
    ledger_sum: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct MultipleSubsRow {
    account_id: Uuid,
    sub_count: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct CanceledNoTimestampRow {
    sub_id: Uuid,
    account_id: Uuid,
}

#[derive(Debug, sqlx::FromRow)]
struct DuplicateRefRow {
    external_event_ref: String,
    event_count: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct PurchaserNoCustomerRow {
    account_id: Uuid,
}

/// Service for running ledger invariant checks.
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all invariant checks and return a summary.
    pub async fn run_all_checks(&self) -> LedgerResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        violations.extend(self.check_non_negative_balance().await?);
        violations.extend(self.check_balance_matches_ledger().await?);
        violations.extend(self.check_single_occupying_subscription().await?);
        violations.extend(self.check_canceled_has_timestamp().await?);
        violations.extend(self.check_unique_external_refs().await?);
        violations.extend(self.check_purchasers_have_customer_ref().await?);

        let checks_run = 6;
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();
        let checks_passed = checks_run - checks_failed;

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run,
            checks_passed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// Invariant 1: No account balance is negative.
    ///
    /// The guarded update and the CHECK constraint should both prevent
    /// this; a violation means something wrote the column directly.
    async fn check_non_negative_balance(&self) -> LedgerResult<Vec<InvariantViolation>> {
        let rows: Vec<NegativeBalanceRow> = sqlx::query_as(
            r#"
            SELECT id AS account_id, balance
            FROM accounts
            WHERE balance < 0
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "non_negative_balance".to_string(),
                account_ids: vec![row.account_id],
                description: format!("Account balance is {}", row.balance),
                context: serde_json::json!({ "balance": row.balance }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 2: Balance equals the sum of ledger deltas.
    ///
    /// The ledger is the source of truth; drift means a mutation bypassed
    /// `apply_delta`.
    async fn check_balance_matches_ledger(&self) -> LedgerResult<Vec<InvariantViolation>> {
        let rows: Vec<BalanceDriftRow> = sqlx::query_as(
            r#"
            SELECT a.id AS account_id,
                   a.balance,
                   COALESCE(SUM(e.delta), 0) AS ledger_sum
            FROM accounts a
            LEFT JOIN ledger_events e ON e.account_id = a.id
            GROUP BY a.id, a.balance
            HAVING a.balance != COALESCE(SUM(e.delta), 0)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "balance_matches_ledger".to_string(),
                account_ids: vec![row.account_id],
                description: format!(
                    "Account balance {} does not match ledger sum {}",
                    row.balance, row.ledger_sum
                ),
                context: serde_json::json!({
                    "balance": row.balance,
                    "ledger_sum": row.ledger_sum,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 3: At most one active/trialing subscription per account.
    ///
    /// Multiple occupying subscriptions would double-grant every period.
    async fn check_single_occupying_subscription(&self) -> LedgerResult<Vec<InvariantViolation>> {
        let rows: Vec<MultipleSubsRow> = sqlx::query_as(
            r#"
            SELECT account_id, COUNT(*) AS sub_count
            FROM subscriptions
            WHERE status IN ('active', 'trialing')
            GROUP BY account_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "single_occupying_subscription".to_string(),
                account_ids: vec![row.account_id],
                description: format!(
                    "Account has {} occupying subscriptions (expected at most 1)",
                    row.sub_count
                ),
                context: serde_json::json!({ "subscription_count": row.sub_count }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 4: Canceled subscriptions carry a cancellation timestamp.
    async fn check_canceled_has_timestamp(&self) -> LedgerResult<Vec<InvariantViolation>> {
        let rows: Vec<CanceledNoTimestampRow> = sqlx::query_as(
            r#"
            SELECT id AS sub_id, account_id
            FROM subscriptions
            WHERE status = 'canceled' AND canceled_at IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "canceled_has_timestamp".to_string(),
                account_ids: vec![row.account_id],
                description: "Canceled subscription has no canceled_at timestamp".to_string(),
                context: serde_json::json!({ "subscription_id": row.sub_id }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 5: External event references are unique.
    ///
    /// The partial unique index enforces this; the query is a cross-check
    /// that the index is intact after restores or manual surgery.
    async fn check_unique_external_refs(&self) -> LedgerResult<Vec<InvariantViolation>> {
        let rows: Vec<DuplicateRefRow> = sqlx::query_as(
            r#"
            SELECT external_event_ref, COUNT(*) AS event_count
            FROM ledger_events
            WHERE external_event_ref IS NOT NULL
            GROUP BY external_event_ref
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "unique_external_refs".to_string(),
                account_ids: vec![],
                description: format!(
                    "External reference '{}' appears {} times",
                    row.external_event_ref, row.event_count
                ),
                context: serde_json::json!({
                    "external_event_ref": row.external_event_ref,
                    "event_count": row.event_count,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 6: Accounts with purchases have a customer reference.
    async fn check_purchasers_have_customer_ref(&self) -> LedgerResult<Vec<InvariantViolation>> {
        let rows: Vec<PurchaserNoCustomerRow> = sqlx::query_as(
            r#"
            SELECT DISTINCT a.id AS account_id
            FROM accounts a
            JOIN ledger_events e ON e.account_id = a.id
            WHERE e.reason = 'purchase'
              AND a.stripe_customer_ref IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "purchasers_have_customer_ref".to_string(),
                account_ids: vec![row.account_id],
                description: "Account has purchase events but no payment-provider customer ref"
                    .to_string(),
                context: serde_json::json!({}),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Run a single invariant check by name.
    pub async fn run_check(&self, name: &str) -> LedgerResult<Vec<InvariantViolation>> {
        match name {
            "non_negative_balance" => self.check_non_negative_balance().await,
            "balance_matches_ledger" => self.check_balance_matches_ledger().await,
            "single_occupying_subscription" => self.check_single_occupying_subscription().await,
            "canceled_has_timestamp" => self.check_canceled_has_timestamp().await,
            "unique_external_refs" => self.check_unique_external_refs().await,
            "purchasers_have_customer_ref" => self.check_purchasers_have_customer_ref().await,
            _ => Ok(vec![]),
        }
    }

    /// Get list of all available invariant checks.
    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "non_negative_balance",
            "balance_matches_ledger",
            "single_occupying_subscription",
            "canceled_has_timestamp",
            "unique_external_refs",
            "purchasers_have_customer_ref",
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_violation_severity_display() {
        assert_eq!(ViolationSeverity::Critical.to_string(), "CRITICAL");
        assert_eq!(ViolationSeverity::High.to_string(), "HIGH");
        assert_eq!(ViolationSeverity::Medium.to_string(), "MEDIUM");
        assert_eq!(ViolationSeverity::Low.to_string(), "LOW");
    }

    #[test]
    fn test_available_checks() {
        let checks = InvariantChecker::available_checks();
        assert_eq!(checks.len(), 6);
        assert!(checks.contains(&"balance_matches_ledger"));
        assert!(checks.contains(&"single_occupying_subscription"));
    }
}
