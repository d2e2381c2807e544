use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use escrowd::config::{LedgerConfig, TimeoutConfig};
use escrowd::db;
use escrowd::ledger::RpcLedgerGateway;
use escrowd::services::{ReconciliationCoordinator, TimeoutScheduler};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let database_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| "escrowd.db".to_string());
    let pool_size: u32 = std::env::var("DATABASE_POOL_SIZE")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8);

    let pool = db::create_pool(&database_url, pool_size)
        .context("Failed to create database pool")?;
    db::initialize_schema(&pool).context("Failed to initialize schema")?;
    info!(database_url = %database_url, "database ready");

    let ledger_config = LedgerConfig::from_env();
    let timeout_config = TimeoutConfig::from_env();

    let gateway = Arc::new(
        RpcLedgerGateway::new(ledger_config.clone())
            .context("Failed to build ledger gateway")?,
    );
    info!(rpc_url = %ledger_config.rpc_url, "ledger gateway ready");

    let coordinator = Arc::new(ReconciliationCoordinator::new(
        pool.clone(),
        gateway.clone(),
        timeout_config.clone(),
    ));

    let scheduler = Arc::new(TimeoutScheduler::new(
        coordinator,
        pool,
        gateway,
        timeout_config,
    ));
    scheduler.start();

    info!("escrowd running, press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("shutting down");

    Ok(())
}
