//! Payment-provider webhook reconciliation
//!
//! Verifies the authenticity and freshness of inbound notifications, maps
//! each event kind to its ledger mutation, and applies it exactly once.
//! Delivery is at-least-once and unordered; safety comes from routing every
//! mutating branch through `apply_delta` with the event's own unique
//! reference, so redelivery is a storage-level no-op no matter how much of
//! the dispatch logic re-executes.
//!
//! Outcome discipline: permanent business-invalid conditions (missing
//! metadata, unknown package, duplicate subscription) are logged and
//! acknowledged — a failure response would only make the provider redeliver
//! an event that can never succeed. Transient failures propagate as errors
//! so the provider retries them.

use std::sync::Arc;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::catalog::{resolve_credit_grant, CatalogStore};
use crate::error::{LedgerError, LedgerResult};
use crate::events::{
    CheckoutSessionObject, EventEnvelope, InvoiceObject, PaymentObject, ProviderEvent,
    SubscriptionObject,
};
use crate::store::{DeltaOutcome, LedgerReason, LedgerStore};
use crate::subscriptions::{NewSubscription, SubscriptionStatus, SubscriptionStore};

type HmacSha256 = Hmac<Sha256>;

/// Default window for the signed-timestamp freshness check.
pub const DEFAULT_TIMESTAMP_TOLERANCE_SECONDS: i64 = 300;

/// Reconciler configuration.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Shared webhook signing secret (`whsec_…`).
    pub webhook_secret: String,
    /// Maximum allowed skew between the signed timestamp and now.
    pub timestamp_tolerance_seconds: i64,
}

impl ReconcilerConfig {
    pub fn new(webhook_secret: impl Into<String>) -> Self {
        Self {
            webhook_secret: webhook_secret.into(),
            timestamp_tolerance_seconds: DEFAULT_TIMESTAMP_TOLERANCE_SECONDS,
        }
    }
}

/// What handling a verified event did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// A ledger or subscription mutation was committed.
    Applied,
    /// The event's reference had been applied before; nothing changed.
    AlreadyApplied,
    /// Recognized but permanently unactionable; acknowledged without effect.
    Skipped { reason: String },
    /// Event kind outside the handled set; acknowledged without effect.
    Ignored { kind: String },
}

/// Verify a provider signature header against the raw request body.
///
/// Header format: `t=<unix>,v1=<hex>[,v1=<hex>…]`. The signed payload is
/// `"{t}.{body}"`, authenticated with HMAC-SHA256 under the shared secret.
/// Signatures are compared in constant time; a timestamp outside the
/// tolerance window rejects the request before any signature work.
pub fn verify_signature(
    payload: &str,
    signature_header: &str,
    secret: &str,
    tolerance_seconds: i64,
) -> LedgerResult<()> {
    verify_signature_at(
        payload,
        signature_header,
        secret,
        tolerance_seconds,
        OffsetDateTime::now_utc().unix_timestamp(),
    )
}

pub(crate) fn verify_signature_at(
    payload: &str,
    signature_header: &str,
    secret: &str,
    tolerance_seconds: i64,
    now_unix: i64,
) -> LedgerResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut candidates: Vec<&str> = Vec::new();

    for part in signature_header.split(',') {
        let mut kv = part.trim().splitn(2, '=');
        match (kv.next(), kv.next()) {
            (Some("t"), Some(value)) => timestamp = value.parse().ok(),
            (Some("v1"), Some(value)) => candidates.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(LedgerError::SignatureInvalid)?;
    if candidates.is_empty() {
        return Err(LedgerError::SignatureInvalid);
    }

    if (now_unix - timestamp).abs() > tolerance_seconds {
        tracing::warn!(
            signed_timestamp = timestamp,
            now = now_unix,
            tolerance_seconds = tolerance_seconds,
            "Webhook timestamp outside tolerance"
        );
        return Err(LedgerError::StaleTimestamp);
    }

    // The secret's `whsec_` prefix is an identifier, not key material.
    let secret_key = secret.strip_prefix("whsec_").unwrap_or(secret);
    let signed_payload = format!("{timestamp}.{payload}");

    let mut mac = HmacSha256::new_from_slice(secret_key.as_bytes())
        .map_err(|_| LedgerError::SignatureInvalid)?;
    mac.update(signed_payload.as_bytes());
    let computed = mac.finalize().into_bytes();

    for candidate in candidates {
        if let Ok(bytes) = hex::decode(candidate) {
            if bool::from(bytes.as_slice().ct_eq(computed.as_slice())) {
                return Ok(());
            }
        }
    }

    Err(LedgerError::SignatureInvalid)
}

/// Applies provider events to the ledger exactly once.
pub struct WebhookReconciler {
    ledger: Arc<dyn LedgerStore>,
    subscriptions: Arc<dyn SubscriptionStore>,
    catalog: Arc<dyn CatalogStore>,
    config: ReconcilerConfig,
}

impl WebhookReconciler {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        subscriptions: Arc<dyn SubscriptionStore>,
        catalog: Arc<dyn CatalogStore>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            ledger,
            subscriptions,
            catalog,
            config,
        }
    }

    /// Verify, parse, and apply one webhook delivery.
    ///
    /// Errors before verification (signature, timestamp, parse) must be
    /// mapped to a 400 by the caller; errors after verification are
    /// transient and must produce a non-2xx so the provider redelivers.
    pub async fn handle(
        &self,
        payload: &str,
        signature_header: &str,
    ) -> LedgerResult<WebhookOutcome> {
        verify_signature(
            payload,
            signature_header,
            &self.config.webhook_secret,
            self.config.timestamp_tolerance_seconds,
        )?;

        let envelope: EventEnvelope = serde_json::from_str(payload)
            .map_err(|e| LedgerError::MalformedEvent(e.to_string()))?;
        let event = ProviderEvent::from_envelope(&envelope)?;

        tracing::info!(
            event_id = %envelope.id,
            event_type = %envelope.kind,
            "Processing provider webhook event"
        );

        let outcome = match event {
            ProviderEvent::PaymentSucceeded(payment) => self.on_payment_succeeded(payment).await?,
            ProviderEvent::CheckoutCompleted(session) => {
                self.on_checkout_completed(session).await?
            }
            ProviderEvent::InvoicePaid(invoice) => self.on_invoice_paid(invoice).await?,
            ProviderEvent::SubscriptionUpdated(sub) => self.on_subscription_updated(sub).await?,
            ProviderEvent::SubscriptionDeleted(sub) => self.on_subscription_deleted(sub).await?,
            ProviderEvent::Ignored { kind } => {
                tracing::info!(
                    event_id = %envelope.id,
                    event_type = %kind,
                    "No handler for event type, acknowledging"
                );
                WebhookOutcome::Ignored { kind }
            }
        };

        Ok(outcome)
    }

    async fn on_payment_succeeded(&self, payment: PaymentObject) -> LedgerResult<WebhookOutcome> {
        let account_id = match account_id_from_metadata(&payment.metadata) {
            Some(id) => id,
            None => {
                tracing::error!(
                    payment_ref = %payment.id,
                    "Payment event carries no account_id metadata, cannot credit anyone"
                );
                return Ok(WebhookOutcome::Skipped {
                    reason: "missing account_id metadata".to_string(),
                });
            }
        };

        if let Some(customer) = &payment.customer {
            self.ledger.link_customer_ref(account_id, customer).await?;
        }

        let credits = match resolve_credit_grant(&*self.catalog, &payment.id, &payment.metadata)
            .await
        {
            Ok(credits) => credits,
            Err(err @ (LedgerError::CreditsUnresolved(_) | LedgerError::MalformedEvent(_))) => {
                // Permanently unresolvable; redelivery cannot fix it.
                tracing::error!(
                    payment_ref = %payment.id,
                    account_id = %account_id,
                    error = %err,
                    "Could not resolve credit amount for settled payment"
                );
                return Ok(WebhookOutcome::Skipped {
                    reason: err.to_string(),
                });
            }
            Err(err) => return Err(err),
        };

        let outcome = self
            .ledger
            .apply_delta(
                account_id,
                credits,
                LedgerReason::Purchase,
                Some(&payment.id),
            )
            .await?;

        match outcome {
            DeltaOutcome::Applied { new_balance } => {
                tracing::info!(
                    account_id = %account_id,
                    payment_ref = %payment.id,
                    credits = credits,
                    new_balance = new_balance,
                    "Purchase credited"
                );
                Ok(WebhookOutcome::Applied)
            }
            DeltaOutcome::AlreadyApplied => Ok(WebhookOutcome::AlreadyApplied),
        }
    }

    async fn on_checkout_completed(
        &self,
        session: CheckoutSessionObject,
    ) -> LedgerResult<WebhookOutcome> {
        if session.mode != "subscription" {
            // One-time purchases settle via their payment event.
            return Ok(WebhookOutcome::Skipped {
                reason: format!("checkout mode {:?} handled elsewhere", session.mode),
            });
        }

        let account_id = match account_id_from_metadata(&session.metadata) {
            Some(id) => id,
            None => {
                tracing::error!(
                    session_ref = %session.id,
                    "Subscription checkout carries no account_id metadata"
                );
                return Ok(WebhookOutcome::Skipped {
                    reason: "missing account_id metadata".to_string(),
                });
            }
        };

        if let Some(customer) = &session.customer {
            self.ledger.link_customer_ref(account_id, customer).await?;
        }

        let subscription_ref = match &session.subscription {
            Some(r) => r.clone(),
            None => {
                tracing::error!(
                    session_ref = %session.id,
                    account_id = %account_id,
                    "Subscription checkout carries no subscription reference"
                );
                return Ok(WebhookOutcome::Skipped {
                    reason: "missing subscription reference".to_string(),
                });
            }
        };

        // Redelivery: the row exists, only the (deduplicated) grant matters.
        let already_tracked = self
            .subscriptions
            .find_by_external_ref(&subscription_ref)
            .await?
            .is_some();

        if !already_tracked {
            // Checked read, not a hard constraint: one occupying
            // subscription per account.
            if let Some(existing) = self
                .subscriptions
                .find_occupying_for_account(account_id)
                .await?
            {
                tracing::error!(
                    account_id = %account_id,
                    session_ref = %session.id,
                    existing_subscription = %existing.external_subscription_ref,
                    "Account already holds an occupying subscription, not creating another"
                );
                return Ok(WebhookOutcome::Skipped {
                    reason: "account already subscribed".to_string(),
                });
            }

            let plan_id = match session.metadata.get("plan_id") {
                Some(id) => id.clone(),
                None => {
                    tracing::error!(
                        session_ref = %session.id,
                        account_id = %account_id,
                        "Subscription checkout carries no plan_id metadata"
                    );
                    return Ok(WebhookOutcome::Skipped {
                        reason: "missing plan_id metadata".to_string(),
                    });
                }
            };

            let plan = match self.catalog.plan(&plan_id).await? {
                Some(plan) => plan,
                None => {
                    tracing::error!(
                        session_ref = %session.id,
                        plan_id = %plan_id,
                        "Subscription checkout references unknown or inactive plan"
                    );
                    return Ok(WebhookOutcome::Skipped {
                        reason: format!("unknown plan {plan_id}"),
                    });
                }
            };

            // The session payload carries no period window; a provisional
            // one holds until the first renewal invoice corrects it.
            let period_start = OffsetDateTime::now_utc();
            let period_end = period_start + plan.period_duration();

            self.subscriptions
                .insert_if_absent(NewSubscription {
                    account_id,
                    external_subscription_ref: subscription_ref.clone(),
                    plan_ref: plan.id.clone(),
                    credits_per_period: plan.credits_per_period,
                    status: SubscriptionStatus::Active,
                    current_period_start: period_start,
                    current_period_end: period_end,
                })
                .await?;

            tracing::info!(
                account_id = %account_id,
                subscription_ref = %subscription_ref,
                plan_id = %plan.id,
                "Subscription created"
            );
        }

        let credits = match self
            .subscriptions
            .find_by_external_ref(&subscription_ref)
            .await?
        {
            Some(sub) => sub.credits_per_period,
            None => {
                return Err(LedgerError::SubscriptionNotFound(subscription_ref));
            }
        };

        let outcome = self
            .ledger
            .apply_delta(
                account_id,
                credits,
                LedgerReason::SubscriptionGrant,
                Some(&session.id),
            )
            .await?;

        match outcome {
            DeltaOutcome::Applied { new_balance } => {
                tracing::info!(
                    account_id = %account_id,
                    session_ref = %session.id,
                    credits = credits,
                    new_balance = new_balance,
                    "First-period subscription credits granted"
                );
                Ok(WebhookOutcome::Applied)
            }
            DeltaOutcome::AlreadyApplied => Ok(WebhookOutcome::AlreadyApplied),
        }
    }

    async fn on_invoice_paid(&self, invoice: InvoiceObject) -> LedgerResult<WebhookOutcome> {
        if !invoice.is_renewal() {
            // The checkout grant covers the first period.
            return Ok(WebhookOutcome::Skipped {
                reason: format!(
                    "invoice billing reason {:?} grants nothing",
                    invoice.billing_reason
                ),
            });
        }

        let subscription_ref = match &invoice.subscription {
            Some(r) => r.clone(),
            None => {
                tracing::error!(
                    invoice_ref = %invoice.id,
                    "Renewal invoice carries no subscription reference"
                );
                return Ok(WebhookOutcome::Skipped {
                    reason: "missing subscription reference".to_string(),
                });
            }
        };

        // Out-of-order arrival: the checkout event may still be in flight.
        // Erroring here makes the provider redeliver after the row exists.
        let sub = self
            .subscriptions
            .find_by_external_ref(&subscription_ref)
            .await?
            .ok_or(LedgerError::SubscriptionNotFound(subscription_ref.clone()))?;

        let outcome = self
            .ledger
            .apply_delta(
                sub.account_id,
                sub.credits_per_period,
                LedgerReason::SubscriptionRenewal,
                Some(&invoice.id),
            )
            .await?;

        // Period advance is idempotent for a redelivered invoice, so it
        // runs on both outcomes.
        if let (Some(start), Some(end)) = (invoice.period_start, invoice.period_end) {
            match (
                OffsetDateTime::from_unix_timestamp(start),
                OffsetDateTime::from_unix_timestamp(end),
            ) {
                (Ok(start), Ok(end)) => {
                    self.subscriptions
                        .update_period(&subscription_ref, start, end)
                        .await?;
                }
                _ => {
                    tracing::warn!(
                        invoice_ref = %invoice.id,
                        period_start = start,
                        period_end = end,
                        "Renewal invoice period timestamps out of range, keeping stored window"
                    );
                }
            }
        }

        match outcome {
            DeltaOutcome::Applied { new_balance } => {
                tracing::info!(
                    account_id = %sub.account_id,
                    invoice_ref = %invoice.id,
                    subscription_ref = %subscription_ref,
                    credits = sub.credits_per_period,
                    new_balance = new_balance,
                    "Renewal credits granted"
                );
                Ok(WebhookOutcome::Applied)
            }
            DeltaOutcome::AlreadyApplied => Ok(WebhookOutcome::AlreadyApplied),
        }
    }

    async fn on_subscription_updated(
        &self,
        sub: SubscriptionObject,
    ) -> LedgerResult<WebhookOutcome> {
        let status = SubscriptionStatus::from_provider(&sub.status);
        let period_end = sub
            .current_period_end
            .and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok());

        // A cancellation pushed through the update event still needs its
        // timestamp recorded.
        if status == SubscriptionStatus::Canceled {
            self.subscriptions
                .cancel(&sub.id, OffsetDateTime::now_utc())
                .await?;
        } else {
            self.subscriptions
                .update_status(&sub.id, status, period_end)
                .await?;
        }

        tracing::info!(
            subscription_ref = %sub.id,
            status = %status,
            cancel_at_period_end = sub.cancel_at_period_end,
            "Subscription state synced"
        );

        Ok(WebhookOutcome::Applied)
    }

    async fn on_subscription_deleted(
        &self,
        sub: SubscriptionObject,
    ) -> LedgerResult<WebhookOutcome> {
        self.subscriptions
            .cancel(&sub.id, OffsetDateTime::now_utc())
            .await?;

        tracing::info!(
            subscription_ref = %sub.id,
            "Subscription canceled; granted credits remain spendable"
        );

        Ok(WebhookOutcome::Applied)
    }
}

fn account_id_from_metadata(metadata: &std::collections::HashMap<String, String>) -> Option<Uuid> {
    metadata
        .get("account_id")
        .and_then(|raw| Uuid::parse_str(raw).ok())
}
