//! Currency Collector - periodic market data import
//!
//! This binary keeps the local store in sync with upstream:
//! - Initializes SQLite database with schema
//! - Wires the CoinMarketCap adapter, bootstrap and dataset importers
//! - Runs one import pass per interval until CTRL+C
//!
//! Usage:
//!   cargo run --release --bin currency_collector
//!
//! Environment variables:
//!   COLLECTOR_ENABLED - Master switch (default: true)
//!   COLLECTOR_DB_PATH - SQLite database path (default: data/coinsync.db)
//!   COLLECTOR_CURRENCY_SLUGS - Comma-separated slugs to import (default: empty)
//!   COLLECTOR_INTERVAL_SECS - Time between passes (default: 3600)
//!   CMC_API_BASE_URL - Upstream base URL (default: https://api.coinmarketcap.com)

use coinsync::importer::{
    default_importers, scheduler::collector_task, CmcClient, CollectorConfig, CurrencyBootstrap,
    Database, MarketDataSource, Reconciler,
};
use dotenv::dotenv;
use log::{error, info};
use std::sync::Arc;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize environment and logging
    dotenv().ok();
    env_logger::init();

    info!("🚀 Currency Collector");
    info!("   └─ Version: {}", env!("CARGO_PKG_VERSION"));

    let config = CollectorConfig::from_env();

    if !config.enabled {
        info!("⚠️  Collector is DISABLED (set COLLECTOR_ENABLED=true to activate)");
        info!("   └─ Exiting gracefully...");
        return Ok(());
    }

    info!("✅ Collector ENABLED");
    info!("   ├─ Database: {}", config.db_path);
    info!("   ├─ Currencies: {:?}", config.currency_slugs);
    info!("   ├─ Interval: {}s", config.interval.as_secs());
    info!("   ├─ Run timeout: {}s", config.run_timeout.as_secs());
    info!("   ├─ Lock timeout: {}ms", config.lock_timeout.as_millis());
    info!("   └─ Upstream: {}", config.cmc_base_url);

    info!("🔧 Initializing database...");
    let db = Database::open(&config.db_path, config.lock_timeout)?;

    let source: Arc<dyn MarketDataSource> = Arc::new(CmcClient::from_config(&config)?);
    let bootstrap = CurrencyBootstrap::new(db.clone(), source.clone());
    let reconciler = Reconciler::new(db, bootstrap, default_importers(source))
        .with_run_timeout(config.run_timeout)
        .with_request_pause(config.request_pause);
    info!("✅ Reconciler created");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let collector = tokio::spawn(collector_task(Arc::new(reconciler), config, shutdown_rx));

    info!("🔄 Press CTRL+C to shutdown gracefully");

    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            info!("");
            info!("⚠️  Received CTRL+C, shutting down...");
        }
        Err(err) => {
            error!("❌ Failed to listen for CTRL+C: {}", err);
        }
    }

    // In-flight pass rolls back on shutdown
    shutdown_tx.send(true).ok();
    if let Err(e) = collector.await {
        error!("❌ Collector task ended abnormally: {}", e);
    }

    info!("✅ Currency collector stopped");
    Ok(())
}
