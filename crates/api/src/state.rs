//! Application state

use std::sync::Arc;

use sqlx::PgPool;

use sketchforge_ledger::{
    LedgerService, Orchestrator, OrchestratorConfig, ReconcilerConfig,
};

use crate::clients::{HttpImageGenerator, HttpMediaStore};
use crate::config::Config;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
    pub ledger: Arc<LedgerService>,
    pub orchestrator: Arc<Orchestrator>,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config) -> Self {
        let ledger = Arc::new(LedgerService::new(
            pool.clone(),
            ReconcilerConfig {
                webhook_secret: config.stripe_webhook_secret.clone(),
                timestamp_tolerance_seconds: config.webhook_tolerance_seconds,
            },
        ));

        let generator = Arc::new(HttpImageGenerator::new(
            &config.generator_base_url,
            &config.generator_api_key,
            config.provider_timeout,
        ));
        let media = Arc::new(HttpMediaStore::new(&config.media_store_base_url));

        let orchestrator = Arc::new(ledger.orchestrator(
            generator,
            media,
            OrchestratorConfig {
                generation_cost: config.generation_cost,
                provider_timeout: config.provider_timeout,
                requests_per_minute: config.generation_requests_per_minute,
            },
        ));

        Self {
            pool,
            config,
            ledger,
            orchestrator,
        }
    }
}
