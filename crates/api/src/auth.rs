//! Authenticated principal extraction
//!
//! Authentication itself lives upstream (the identity collaborator
//! terminates the session and forwards a stable account identifier). This
//! extractor trusts that identifier as-is, per the deployment contract that
//! the service is only reachable through the identity proxy.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use uuid::Uuid;

use crate::error::ApiError;

pub const ACCOUNT_ID_HEADER: &str = "x-account-id";

/// The authenticated billing principal for this request.
#[derive(Debug, Clone, Copy)]
pub struct AccountId(pub Uuid);

impl<S> FromRequestParts<S> for AccountId
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(ACCOUNT_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| ApiError::Unauthorized("missing account header".to_string()))?;

        let account_id = Uuid::parse_str(raw)
            .map_err(|_| ApiError::Unauthorized("malformed account header".to_string()))?;

        Ok(AccountId(account_id))
    }
}
