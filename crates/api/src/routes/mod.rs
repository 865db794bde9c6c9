//! Route table

pub mod credits;
pub mod generations;
pub mod webhooks;

use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhooks/stripe", post(webhooks::stripe_webhook))
        .route(
            "/api/generations",
            post(generations::create_generation).get(generations::list_generations),
        )
        .route("/api/credits/balance", get(credits::balance))
        .route("/api/credits/history", get(credits::history))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}
