//! Server configuration
//!
//! Everything comes from the environment (with `.env` support via dotenvy
//! in `main`). Secrets are required; behavioral knobs carry defaults.

use std::time::Duration;

use anyhow::Context;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    /// Direct (non-pooled) URL for migrations, when the main URL goes
    /// through a statement-pooling proxy.
    pub database_direct_url: Option<String>,
    pub port: u16,

    /// Payment-provider webhook signing secret (`whsec_…`).
    pub stripe_webhook_secret: String,
    pub webhook_tolerance_seconds: i64,

    /// External image-generation provider.
    pub generator_base_url: String,
    pub generator_api_key: String,
    pub provider_timeout: Duration,

    /// Blob storage for generated output.
    pub media_store_base_url: String,

    /// Credits debited per generation.
    pub generation_cost: i64,
    /// Fixed-window request budget per account, per minute.
    pub generation_requests_per_minute: i64,
}

fn required(name: &str) -> anyhow::Result<String> {
    std::env::var(name).with_context(|| format!("{name} must be set"))
}

fn parsed_or<T: std::str::FromStr>(name: &str, default: T) -> anyhow::Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| anyhow::anyhow!("{name} is not a valid value: {raw:?}")),
        Err(_) => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            database_url: required("DATABASE_URL")?,
            database_direct_url: std::env::var("DATABASE_DIRECT_URL").ok(),
            port: parsed_or("PORT", 8080)?,

            stripe_webhook_secret: required("STRIPE_WEBHOOK_SECRET")?,
            webhook_tolerance_seconds: parsed_or("WEBHOOK_TOLERANCE_SECONDS", 300)?,

            generator_base_url: required("GENERATOR_BASE_URL")?,
            generator_api_key: required("GENERATOR_API_KEY")?,
            provider_timeout: Duration::from_secs(parsed_or("PROVIDER_TIMEOUT_SECONDS", 30u64)?),

            media_store_base_url: required("MEDIA_STORE_BASE_URL")?,

            generation_cost: parsed_or("GENERATION_COST", 1)?,
            generation_requests_per_minute: parsed_or("GENERATION_REQUESTS_PER_MINUTE", 10)?,
        })
    }
}
