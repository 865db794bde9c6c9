//! Credit balance and history reads

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use sketchforge_ledger::LedgerEvent;

use crate::auth::AccountId;
use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct BalanceResponse {
    pub balance: i64,
}

pub async fn balance(
    State(state): State<AppState>,
    AccountId(account_id): AccountId,
) -> ApiResult<Json<BalanceResponse>> {
    let balance = state.ledger.store.get_balance(account_id).await?;
    Ok(Json(BalanceResponse { balance }))
}

pub async fn history(
    State(state): State<AppState>,
    AccountId(account_id): AccountId,
) -> ApiResult<Json<Vec<LedgerEvent>>> {
    let events = state.ledger.store.events_for_account(account_id, 100).await?;
    Ok(Json(events))
}
