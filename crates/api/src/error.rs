//! API error mapping
//!
//! Ledger outcomes become HTTP statuses here. Transient external failures
//! surface as 502 after the compensating refund already ran, so a caller
//! retry is always safe.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

use sketchforge_ledger::LedgerError;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Ledger(err) => match err {
                LedgerError::InvalidInput(_)
                | LedgerError::SignatureInvalid
                | LedgerError::StaleTimestamp
                | LedgerError::MalformedEvent(_)
                | LedgerError::CreditsUnresolved(_) => StatusCode::BAD_REQUEST,
                LedgerError::InsufficientCredits { .. } => StatusCode::PAYMENT_REQUIRED,
                LedgerError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
                LedgerError::SubscriptionNotFound(_) => StatusCode::NOT_FOUND,
                LedgerError::ProviderFailed(_)
                | LedgerError::ProviderTimeout(_)
                | LedgerError::StorageFailed(_) => StatusCode::BAD_GATEWAY,
                // An authenticated principal without an account row is a
                // provisioning bug, not a user error.
                LedgerError::AccountNotFound(_)
                | LedgerError::Config(_)
                | LedgerError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    fn code(&self) -> &'static str {
        match self {
            ApiError::Unauthorized(_) => "unauthorized",
            ApiError::Internal(_) => "internal",
            ApiError::Ledger(err) => match err {
                LedgerError::InvalidInput(_) => "invalid_input",
                LedgerError::InsufficientCredits { .. } => "insufficient_credits",
                LedgerError::RateLimited { .. } => "rate_limited",
                LedgerError::SignatureInvalid => "signature_invalid",
                LedgerError::StaleTimestamp => "stale_timestamp",
                LedgerError::MalformedEvent(_) => "malformed_event",
                LedgerError::CreditsUnresolved(_) => "credits_unresolved",
                LedgerError::SubscriptionNotFound(_) => "subscription_not_found",
                LedgerError::ProviderFailed(_) => "generation_failed",
                LedgerError::ProviderTimeout(_) => "generation_timeout",
                LedgerError::StorageFailed(_) => "storage_failed",
                LedgerError::AccountNotFound(_) => "account_not_found",
                LedgerError::Config(_) => "config",
                LedgerError::Database(_) => "database",
            },
        }
    }

    fn retryable(&self) -> bool {
        match self {
            ApiError::Ledger(err) => err.is_retryable(),
            _ => false,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        if status.is_server_error() {
            tracing::error!(error = %self, status = %status, "Request failed");
        } else {
            tracing::debug!(error = %self, status = %status, "Request rejected");
        }

        let body = Json(serde_json::json!({
            "error": {
                "code": self.code(),
                "message": self.to_string(),
                "retryable": self.retryable(),
            }
        }));

        (status, body).into_response()
    }
}
