//! Periodic collector loop
//!
//! One sequential worker: wait a random startup delay, then run an import
//! pass on every interval tick. A pass that outlasts the interval makes the
//! next ticks get skipped, never run in parallel.

use super::config::CollectorConfig;
use super::error::ImportError;
use super::reconciler::{ImportReport, Reconciler};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

/// Random delay in `0..=max`, whole milliseconds
pub fn startup_delay(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}

/// Configured slugs first, then every already tracked currency
pub fn run_slugs(configured: &[String], tracked: Vec<String>) -> Vec<String> {
    let mut slugs = configured.to_vec();
    slugs.extend(tracked);
    slugs
}

/// One collector iteration
pub async fn run_once(
    reconciler: &Reconciler,
    configured: &[String],
    shutdown: watch::Receiver<bool>,
) -> Result<ImportReport, ImportError> {
    let tracked = reconciler.bootstrap().tracked_slugs().await?;
    let slugs = run_slugs(configured, tracked);
    reconciler.import_with_shutdown(&slugs, shutdown).await
}

/// Collector task - runs import passes until `shutdown` turns `true`
///
/// Failed passes are logged and the loop continues with the next tick.
pub async fn collector_task(
    reconciler: Arc<Reconciler>,
    config: CollectorConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let delay = startup_delay(config.startup_jitter);
    log::info!(
        "⏰ Starting currency collector (interval: {}s, first run in {}ms)",
        config.interval.as_secs(),
        delay.as_millis()
    );

    tokio::select! {
        _ = tokio::time::sleep(delay) => {}
        _ = wait_for_shutdown(&mut shutdown) => {
            log::info!("🛑 Currency collector stopped before first run");
            return;
        }
    }

    let mut timer = interval(config.interval);
    timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = timer.tick() => {}
            _ = wait_for_shutdown(&mut shutdown) => break,
        }

        log::info!("🔄 Collector iteration starting...");
        match run_once(&reconciler, &config.currency_slugs, shutdown.clone()).await {
            Ok(report) => {
                log::info!(
                    "✅ Collector iteration completed: {} currencies, {} rows",
                    report.currencies,
                    report.total_rows()
                );
            }
            Err(ImportError::Cancelled) => {
                log::warn!("⚠️  Collector iteration cancelled by shutdown");
                break;
            }
            Err(e) => {
                log::error!("❌ Collector iteration completed with errors: {}", e);
            }
        }
    }

    log::info!("🛑 Currency collector stopped");
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
