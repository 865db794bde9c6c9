// Ledger crate clippy configuration
// These are intentional patterns in this crate:
#![allow(clippy::too_many_arguments)] // Some store operations take many columns
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Sketchforge Credit Ledger
//!
//! The credit-ledger and payment-reconciliation core: a durable integer
//! balance per account with an append-only audit trail, pre-charge
//! reservations around the external generation call, and exactly-once
//! application of payment-provider webhook events.
//!
//! ## Features
//!
//! - **Ledger Store**: transactional balance mutations, each paired with an
//!   audit event in the same transaction; idempotency via a unique index on
//!   external event references
//! - **Reservations**: debit-before-work with idempotent compensating
//!   refunds
//! - **Webhook Reconciliation**: signature verification, closed event-type
//!   dispatch, at-least-once-safe credit grants and subscription lifecycle
//!   sync
//! - **Orchestration**: the reserve → generate → store → finalize | refund
//!   sequence the rest of the application calls to spend a credit
//! - **Rate Limiting**: shared-store fixed-window counters per account
//! - **Invariants**: runnable read-only consistency checks

pub mod catalog;
pub mod error;
pub mod events;
pub mod invariants;
pub mod orchestrator;
pub mod rate_limit;
pub mod reservation;
pub mod store;
pub mod subscriptions;
pub mod usage;
pub mod webhooks;

#[cfg(test)]
pub(crate) mod testing;

// Catalog
pub use catalog::{resolve_credit_grant, CatalogStore, Package, PgCatalogStore, Plan};

// Error
pub use error::{LedgerError, LedgerResult};

// Events
pub use events::{EventEnvelope, ProviderEvent};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Orchestrator
pub use orchestrator::{
    CompletedGeneration, GeneratedImage, GenerationRequest, ImageGenerator, MediaStore,
    Orchestrator, OrchestratorConfig,
};

// Rate limit
pub use rate_limit::{RateLimitResult, RateLimiter};

// Reservation
pub use reservation::{ReservationService, ReservationToken};

// Store
pub use store::{Account, DeltaOutcome, LedgerEvent, LedgerReason, LedgerStore, PgLedgerStore};

// Subscriptions
pub use subscriptions::{
    NewSubscription, PgSubscriptionStore, Subscription, SubscriptionStatus, SubscriptionStore,
};

// Usage
pub use usage::{GenerationRecord, NewGeneration, PgUsageStore, UsageStore};

// Webhooks
pub use webhooks::{verify_signature, ReconcilerConfig, WebhookOutcome, WebhookReconciler};

use std::sync::Arc;

use sqlx::PgPool;

/// Main ledger service wiring the Postgres-backed pieces together.
pub struct LedgerService {
    pub store: Arc<dyn LedgerStore>,
    pub subscriptions: Arc<dyn SubscriptionStore>,
    pub catalog: Arc<dyn CatalogStore>,
    pub usage: Arc<dyn UsageStore>,
    pub reservations: ReservationService,
    pub rate_limiter: Arc<RateLimiter>,
    pub webhooks: WebhookReconciler,
    pub invariants: InvariantChecker,
}

impl LedgerService {
    pub fn new(pool: PgPool, reconciler: ReconcilerConfig) -> Self {
        let store: Arc<dyn LedgerStore> = Arc::new(PgLedgerStore::new(pool.clone()));
        let subscriptions: Arc<dyn SubscriptionStore> =
            Arc::new(PgSubscriptionStore::new(pool.clone()));
        let catalog: Arc<dyn CatalogStore> = Arc::new(PgCatalogStore::new(pool.clone()));
        let usage: Arc<dyn UsageStore> = Arc::new(PgUsageStore::new(pool.clone()));

        Self {
            reservations: ReservationService::new(store.clone()),
            rate_limiter: Arc::new(RateLimiter::new_postgres(pool.clone())),
            webhooks: WebhookReconciler::new(
                store.clone(),
                subscriptions.clone(),
                catalog.clone(),
                reconciler,
            ),
            invariants: InvariantChecker::new(pool),
            store,
            subscriptions,
            catalog,
            usage,
        }
    }

    /// Build an orchestrator over this service's ledger pieces and the
    /// given external collaborators.
    pub fn orchestrator(
        &self,
        generator: Arc<dyn ImageGenerator>,
        media: Arc<dyn MediaStore>,
        config: OrchestratorConfig,
    ) -> Orchestrator {
        Orchestrator::new(
            self.reservations.clone(),
            self.rate_limiter.clone(),
            generator,
            media,
            self.usage.clone(),
            config,
        )
    }
}
