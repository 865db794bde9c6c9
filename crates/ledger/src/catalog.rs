//! Pricing catalog
//!
//! Packages (one-time credit bundles) and plans (recurring grants) are
//! written by the admin subsystem and consumed read-only here. The amount
//! granted is always resolved server-side — from provider event metadata or
//! from these rows — never from a caller-supplied value.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::{LedgerError, LedgerResult};

/// A one-time credit bundle.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Package {
    pub id: String,
    pub credits: i64,
    pub price_cents: i64,
    pub currency: String,
    pub is_active: bool,
}

/// A recurring plan.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Plan {
    pub id: String,
    pub credits_per_period: i64,
    pub price_cents: i64,
    pub interval: String,
    pub is_active: bool,
}

impl Plan {
    /// Approximate length of one billing period; the renewal invoice's own
    /// period window corrects this as soon as it arrives.
    pub fn period_duration(&self) -> time::Duration {
        match self.interval.as_str() {
            "year" => time::Duration::days(365),
            _ => time::Duration::days(30),
        }
    }
}

#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn package(&self, id: &str) -> LedgerResult<Option<Package>>;
    async fn plan(&self, id: &str) -> LedgerResult<Option<Plan>>;
}

#[derive(Clone)]
pub struct PgCatalogStore {
    pool: sqlx::PgPool,
}

impl PgCatalogStore {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CatalogStore for PgCatalogStore {
    async fn package(&self, id: &str) -> LedgerResult<Option<Package>> {
        let row = sqlx::query_as::<_, Package>(
            r#"
            SELECT id, credits, price_cents, currency, is_active
            FROM packages
            WHERE id = $1 AND is_active = TRUE
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn plan(&self, id: &str) -> LedgerResult<Option<Plan>> {
        let row = sqlx::query_as::<_, Plan>(
            r#"
            SELECT id, credits_per_period, price_cents, billing_interval AS interval, is_active
            FROM plans
            WHERE id = $1 AND is_active = TRUE
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }
}

/// Credit amounts for provider price refs that predate package metadata.
/// Records created through the current checkout flow always carry
/// `credits` or `package_id` metadata; this table only serves the oldest
/// payment refs still being redelivered.
fn legacy_price_credits(price_ref: &str) -> Option<i64> {
    match price_ref {
        "price_starter_pack" => Some(10),
        "price_studio_pack" => Some(50),
        "price_atelier_pack" => Some(120),
        _ => None,
    }
}

/// Resolve how many credits a one-time payment grants.
///
/// Single resolution chain with explicit priority:
/// 1. `credits` in the event's own metadata,
/// 2. `package_id` metadata looked up in the catalog,
/// 3. `price_id` metadata in the legacy static table,
/// 4. fail with `CreditsUnresolved`.
pub async fn resolve_credit_grant(
    catalog: &dyn CatalogStore,
    payment_ref: &str,
    metadata: &HashMap<String, String>,
) -> LedgerResult<i64> {
    if let Some(raw) = metadata.get("credits") {
        let credits: i64 = raw.parse().map_err(|_| {
            LedgerError::MalformedEvent(format!(
                "non-integer credits metadata {raw:?} on {payment_ref}"
            ))
        })?;
        if credits <= 0 {
            return Err(LedgerError::MalformedEvent(format!(
                "non-positive credits metadata {credits} on {payment_ref}"
            )));
        }
        return Ok(credits);
    }

    if let Some(package_id) = metadata.get("package_id") {
        if let Some(package) = catalog.package(package_id).await? {
            return Ok(package.credits);
        }
        tracing::warn!(
            payment_ref = %payment_ref,
            package_id = %package_id,
            "Payment references unknown or inactive package, trying legacy price table"
        );
    }

    if let Some(price_id) = metadata.get("price_id") {
        if let Some(credits) = legacy_price_credits(price_id) {
            return Ok(credits);
        }
    }

    Err(LedgerError::CreditsUnresolved(format!(
        "payment {payment_ref} carries no resolvable credit amount"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EmptyCatalog;

    #[async_trait]
    impl CatalogStore for EmptyCatalog {
        async fn package(&self, _id: &str) -> LedgerResult<Option<Package>> {
            Ok(None)
        }
        async fn plan(&self, _id: &str) -> LedgerResult<Option<Plan>> {
            Ok(None)
        }
    }

    fn meta(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn metadata_credits_take_priority() {
        // Even with a legacy price_id present, explicit metadata wins.
        let m = meta(&[("credits", "15"), ("price_id", "price_starter_pack")]);
        let credits = resolve_credit_grant(&EmptyCatalog, "pi_1", &m).await.unwrap();
        assert_eq!(credits, 15);
    }

    #[tokio::test]
    async fn legacy_table_is_last_resort() {
        let m = meta(&[("price_id", "price_studio_pack")]);
        let credits = resolve_credit_grant(&EmptyCatalog, "pi_2", &m).await.unwrap();
        assert_eq!(credits, 50);
    }

    #[tokio::test]
    async fn unresolvable_payment_fails() {
        let m = meta(&[("price_id", "price_unknown")]);
        assert!(matches!(
            resolve_credit_grant(&EmptyCatalog, "pi_3", &m).await,
            Err(LedgerError::CreditsUnresolved(_))
        ));
    }

    #[tokio::test]
    async fn garbage_credits_metadata_is_malformed() {
        let m = meta(&[("credits", "fifteen")]);
        assert!(matches!(
            resolve_credit_grant(&EmptyCatalog, "pi_4", &m).await,
            Err(LedgerError::MalformedEvent(_))
        ));
    }

    #[test]
    fn plan_period_duration() {
        let plan = Plan {
            id: "plan_monthly".into(),
            credits_per_period: 30,
            price_cents: 900,
            interval: "month".into(),
            is_active: true,
        };
        assert_eq!(plan.period_duration(), time::Duration::days(30));
    }
}
