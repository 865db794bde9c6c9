//! Sketchforge API Server
//!
//! Serves the credit-ledger surface: the payment-provider webhook, the
//! paid generation endpoint, and balance/history reads.

use std::net::SocketAddr;

use tokio::time::{interval, Duration};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sketchforge_api::{routes::create_router, AppState, Config};
use sketchforge_shared::{create_migration_pool, create_pool, run_migrations};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sketchforge_api=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Sketchforge API Server v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    tracing::info!("Configuration loaded");

    tracing::info!("Connecting to database...");
    let pool = create_pool(&config.database_url).await?;
    tracing::info!("Database connection established");

    // Migrations run over a direct connection when one is configured,
    // bypassing statement-pooling proxies.
    let migration_url = config
        .database_direct_url
        .as_ref()
        .unwrap_or(&config.database_url);
    let migration_pool = create_migration_pool(migration_url).await?;
    run_migrations(&migration_pool).await?;
    migration_pool.close().await;

    let port = config.port;
    let state = AppState::new(pool, config);

    // Expired rate-limit windows accumulate one row per account per minute;
    // sweep them in the background.
    {
        let rate_limiter = state.ledger.rate_limiter.clone();
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(600));
            loop {
                ticker.tick().await;
                match rate_limiter.cleanup().await {
                    Ok(dropped) if dropped > 0 => {
                        tracing::debug!(dropped = dropped, "Swept expired rate-limit windows");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "Rate-limit window sweep failed");
                    }
                }
            }
        });
    }

    let app = create_router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(addr = %addr, "Listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
