//! Provider webhook events
//!
//! Payment-provider notifications arrive as a JSON envelope with a `type`
//! string and a `data.object` payload. Dispatch works over a closed enum of
//! the event kinds this system reacts to; everything else lands in
//! [`ProviderEvent::Ignored`], which is still acknowledged so harmless
//! unrecognized events never cause provider retry storms.

use std::collections::HashMap;

use serde::Deserialize;

use crate::error::{LedgerError, LedgerResult};

/// Raw webhook envelope, deserialized after signature verification.
#[derive(Debug, Clone, Deserialize)]
pub struct EventEnvelope {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub created: i64,
    pub data: EventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventData {
    pub object: serde_json::Value,
}

/// A one-time payment that settled.
#[derive(Debug, Clone, Deserialize)]
pub struct PaymentObject {
    pub id: String,
    #[serde(default)]
    pub customer: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// A completed checkout session. Only `mode = "subscription"` sessions
/// carry financial effect here; one-time purchases settle via their
/// payment event.
#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutSessionObject {
    pub id: String,
    #[serde(default)]
    pub mode: String,
    #[serde(default)]
    pub customer: Option<String>,
    #[serde(default)]
    pub subscription: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// A paid invoice. `billing_reason = "subscription_cycle"` marks a renewal.
#[derive(Debug, Clone, Deserialize)]
pub struct InvoiceObject {
    pub id: String,
    #[serde(default)]
    pub billing_reason: Option<String>,
    #[serde(default)]
    pub subscription: Option<String>,
    #[serde(default)]
    pub customer: Option<String>,
    #[serde(default)]
    pub period_start: Option<i64>,
    #[serde(default)]
    pub period_end: Option<i64>,
}

impl InvoiceObject {
    pub fn is_renewal(&self) -> bool {
        self.billing_reason.as_deref() == Some("subscription_cycle")
    }
}

/// Provider-side subscription state pushed on lifecycle changes.
#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionObject {
    pub id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub current_period_start: Option<i64>,
    #[serde(default)]
    pub current_period_end: Option<i64>,
    #[serde(default)]
    pub cancel_at_period_end: bool,
}

/// The closed set of event kinds the reconciler dispatches on.
#[derive(Debug, Clone)]
pub enum ProviderEvent {
    PaymentSucceeded(PaymentObject),
    CheckoutCompleted(CheckoutSessionObject),
    InvoicePaid(InvoiceObject),
    SubscriptionUpdated(SubscriptionObject),
    SubscriptionDeleted(SubscriptionObject),
    Ignored { kind: String },
}

impl ProviderEvent {
    /// Classify a verified envelope.
    ///
    /// A known `type` with a payload that fails to deserialize is a
    /// `MalformedEvent` error; an unknown `type` is `Ignored`.
    pub fn from_envelope(envelope: &EventEnvelope) -> LedgerResult<Self> {
        fn payload<T: serde::de::DeserializeOwned>(
            kind: &str,
            object: &serde_json::Value,
        ) -> LedgerResult<T> {
            serde_json::from_value(object.clone())
                .map_err(|e| LedgerError::MalformedEvent(format!("{kind}: {e}")))
        }

        let object = &envelope.data.object;
        let event = match envelope.kind.as_str() {
            "payment_intent.succeeded" => {
                ProviderEvent::PaymentSucceeded(payload(&envelope.kind, object)?)
            }
            "checkout.session.completed" => {
                ProviderEvent::CheckoutCompleted(payload(&envelope.kind, object)?)
            }
            "invoice.payment_succeeded" | "invoice.paid" => {
                ProviderEvent::InvoicePaid(payload(&envelope.kind, object)?)
            }
            "customer.subscription.updated" => {
                ProviderEvent::SubscriptionUpdated(payload(&envelope.kind, object)?)
            }
            "customer.subscription.deleted" => {
                ProviderEvent::SubscriptionDeleted(payload(&envelope.kind, object)?)
            }
            _ => ProviderEvent::Ignored {
                kind: envelope.kind.clone(),
            },
        };

        Ok(event)
    }
}
