//! Payment-provider webhook endpoint
//!
//! Response discipline matters more than usual here: a 400 tells the
//! provider the delivery can never succeed (bad signature, stale
//! timestamp, unparseable body); any 5xx makes it redeliver. Success is
//! only acknowledged once the event's effect (or its idempotent no-op) has
//! durably committed.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;

use sketchforge_ledger::{LedgerError, WebhookOutcome};

use crate::state::AppState;

const SIGNATURE_HEADER: &str = "stripe-signature";

pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let signature = match headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok()) {
        Some(signature) => signature,
        None => {
            tracing::warn!("Webhook delivery without signature header");
            return reject(StatusCode::BAD_REQUEST, "missing signature header");
        }
    };

    let payload = match std::str::from_utf8(&body) {
        Ok(payload) => payload,
        Err(_) => {
            tracing::warn!("Webhook delivery with non-UTF-8 body");
            return reject(StatusCode::BAD_REQUEST, "body is not valid UTF-8");
        }
    };

    match state.ledger.webhooks.handle(payload, signature).await {
        Ok(outcome) => {
            if let WebhookOutcome::Skipped { reason } = &outcome {
                tracing::warn!(reason = %reason, "Webhook acknowledged without effect");
            }
            (StatusCode::OK, Json(serde_json::json!({ "received": true }))).into_response()
        }
        Err(
            err @ (LedgerError::SignatureInvalid
            | LedgerError::StaleTimestamp
            | LedgerError::MalformedEvent(_)),
        ) => {
            tracing::warn!(error = %err, "Rejected webhook delivery");
            reject(StatusCode::BAD_REQUEST, &err.to_string())
        }
        Err(err) => {
            // Transient: a non-2xx makes the provider redeliver, which is
            // safe because every financial effect is idempotent.
            tracing::error!(error = %err, "Webhook processing failed, provider will retry");
            reject(StatusCode::INTERNAL_SERVER_ERROR, "processing failed")
        }
    }
}

fn reject(status: StatusCode, message: &str) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}
