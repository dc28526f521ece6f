//! Conveyor API server and scheduler.

use anyhow::Context;
use conveyor_api::{AppState, routes};
use conveyor_config::SystemConfig;
use conveyor_db::{PgConfigRepo, PgPipelineStores, create_pool, run_migrations};
use conveyor_scheduler::TickDriver;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = std::env::var("CONVEYOR_CONFIG").ok();
    let config = SystemConfig::load(config_path.as_deref())
        .context("failed to load system config")?
        .with_env_overrides();

    info!("Connecting to database...");
    let pool = create_pool(&config.database_url)
        .await
        .context("failed to connect to database")?;
    run_migrations(&pool)
        .await
        .context("failed to run migrations")?;
    info!("Database ready");

    let driver = TickDriver::new(
        Arc::new(PgConfigRepo::new(pool.clone())),
        Arc::new(PgPipelineStores::new(pool.clone(), config.lock_lease)),
        config.tick_interval,
        config.base_resource_types.clone(),
    );
    tokio::spawn(async move { driver.run().await });

    let state = AppState::from_pool(pool, &config);
    let app = routes::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    info!(addr = %config.listen_addr, "Starting server");
    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    axum::serve(listener, app).await?;

    Ok(())
}
