//! Paid generation endpoint

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Deserialize;

use sketchforge_ledger::{
    CompletedGeneration, GenerationRecord, GenerationRequest, LedgerError,
};

use crate::auth::AccountId;
use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateGenerationBody {
    /// Sketch bytes, base64-encoded.
    pub image_base64: String,
    pub mime_type: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default = "default_aspect_ratio")]
    pub aspect_ratio: String,
    #[serde(default = "default_resolution")]
    pub resolution: u32,
}

fn default_aspect_ratio() -> String {
    "1:1".to_string()
}

fn default_resolution() -> u32 {
    1024
}

pub async fn create_generation(
    State(state): State<AppState>,
    AccountId(account_id): AccountId,
    Json(body): Json<CreateGenerationBody>,
) -> ApiResult<(StatusCode, Json<CompletedGeneration>)> {
    let image = BASE64
        .decode(body.image_base64.as_bytes())
        .map_err(|_| LedgerError::InvalidInput("image_base64 is not valid base64".to_string()))?;

    let request = GenerationRequest {
        image,
        mime_type: body.mime_type,
        prompt: body.prompt,
        aspect_ratio: body.aspect_ratio,
        resolution: body.resolution,
    };

    let completed = state.orchestrator.execute(account_id, request).await?;
    Ok((StatusCode::CREATED, Json(completed)))
}

pub async fn list_generations(
    State(state): State<AppState>,
    AccountId(account_id): AccountId,
) -> ApiResult<Json<Vec<GenerationRecord>>> {
    let records = state
        .ledger
        .usage
        .generations_for_account(account_id, 50)
        .await?;
    Ok(Json(records))
}
