//! One atomic import pass
//!
//! ## Flow
//!
//! ```text
//! import(slugs)
//!     ├─ CurrencyBootstrap::resolve        (outside the transaction)
//!     ├─ BEGIN IMMEDIATE                   (waits for the write lock)
//!     ├─ lock_for_update(all currencies)   (stamp + read watermarks)
//!     ├─ per currency, per importer: fetch → stage rows, advance watermark
//!     ├─ upsert staged batches (dataset order), then watermarks
//!     └─ COMMIT  | ROLLBACK on error, panic, cancellation or deadline
//! ```
//!
//! Shutdown is watched from bootstrap on; the run deadline starts at BEGIN,
//! so it also bounds the wait for another pass's lock.
//!
//! Exactly one rollback is attempted per failed pass. When it fails too, the
//! caller gets both errors in [`ImportError::RollbackFailed`].

use super::bootstrap::CurrencyBootstrap;
use super::datasets::DatasetBatch;
use super::db::{Database, ImportTx};
use super::error::ImportError;
use super::importers::DatasetImporter;
use super::types::{Currency, DatasetKind, ImportWatermark};
use super::watermarks;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

pub type NowFn = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Summary of a committed pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportReport {
    /// Currencies covered by the pass
    pub currencies: usize,
    /// Of those, created by bootstrap in this pass
    pub created: usize,
    /// Rows written per dataset (after de-duplication)
    pub rows_by_dataset: BTreeMap<DatasetKind, usize>,
}

impl ImportReport {
    pub fn total_rows(&self) -> usize {
        self.rows_by_dataset.values().sum()
    }
}

pub struct Reconciler {
    db: Database,
    bootstrap: CurrencyBootstrap,
    importers: Vec<Arc<dyn DatasetImporter>>,
    now_fn: NowFn,
    run_timeout: Option<Duration>,
    request_pause: Duration,
}

impl Reconciler {
    pub fn new(
        db: Database,
        bootstrap: CurrencyBootstrap,
        importers: Vec<Arc<dyn DatasetImporter>>,
    ) -> Self {
        Self {
            db,
            bootstrap,
            importers,
            now_fn: Arc::new(Utc::now),
            run_timeout: None,
            request_pause: Duration::ZERO,
        }
    }

    /// Replace the clock (tests pin "now")
    pub fn with_now_fn(mut self, now_fn: NowFn) -> Self {
        self.now_fn = now_fn;
        self
    }

    /// Bound the lock wait plus the transactional phase; expiry rolls the pass back
    pub fn with_run_timeout(mut self, timeout: Duration) -> Self {
        self.run_timeout = Some(timeout);
        self
    }

    /// Sleep between consecutive upstream fetches
    pub fn with_request_pause(mut self, pause: Duration) -> Self {
        self.request_pause = pause;
        self
    }

    pub fn bootstrap(&self) -> &CurrencyBootstrap {
        &self.bootstrap
    }

    /// Run one pass that cannot be cancelled from outside
    pub async fn import<S: AsRef<str>>(&self, slugs: &[S]) -> Result<ImportReport, ImportError> {
        let (_keep_open, shutdown) = watch::channel(false);
        self.import_with_shutdown(slugs, shutdown).await
    }

    /// Run one pass; `true` on `shutdown` aborts it
    pub async fn import_with_shutdown<S: AsRef<str>>(
        &self,
        slugs: &[S],
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<ImportReport, ImportError> {
        let started = Instant::now();

        let resolved = tokio::select! {
            resolved = self.bootstrap.resolve(slugs) => resolved?,
            _ = shutdown_requested(&mut shutdown) => return Err(ImportError::Cancelled),
        };

        let mut report = ImportReport {
            currencies: resolved.currencies.len(),
            created: resolved.created,
            rows_by_dataset: BTreeMap::new(),
        };

        if resolved.currencies.is_empty() {
            log::info!("ℹ️  Nothing to import (no currencies resolved)");
            return Ok(report);
        }

        let now = (self.now_fn)();
        log::info!("🔄 Import pass starting: {} currencies", resolved.currencies.len());

        let expires_at = self.run_timeout.map(|timeout| Instant::now() + timeout);

        let mut tx = tokio::select! {
            tx = self.db.begin() => tx?,
            _ = shutdown_requested(&mut shutdown) => return Err(ImportError::Cancelled),
            _ = deadline(expires_at) => return Err(self.deadline_exceeded()),
        };

        let outcome = {
            let pass = self.run_pass(&mut tx, &resolved.currencies, now);
            let pass = AssertUnwindSafe(pass).catch_unwind();

            tokio::select! {
                result = pass => match result {
                    Ok(result) => result,
                    Err(panic) => Err(ImportError::Internal(panic_message(panic))),
                },
                _ = shutdown_requested(&mut shutdown) => Err(ImportError::Cancelled),
                _ = deadline(expires_at) => Err(self.deadline_exceeded()),
            }
        };

        let rows = match outcome {
            Ok(rows) => rows,
            Err(e) => return Err(abort(&mut tx, e)),
        };

        if let Err(e) = tx.commit() {
            return Err(abort(&mut tx, e.into()));
        }

        report.rows_by_dataset = rows;
        log::info!(
            "✅ Import pass committed in {:.1}s: {} currencies ({} new), {} rows",
            started.elapsed().as_secs_f64(),
            report.currencies,
            report.created,
            report.total_rows()
        );
        for (kind, count) in &report.rows_by_dataset {
            log::debug!("   ├─ {}: {} rows", kind, count);
        }

        Ok(report)
    }

    /// Everything between BEGIN and COMMIT
    async fn run_pass(
        &self,
        tx: &mut ImportTx,
        currencies: &[Currency],
        now: DateTime<Utc>,
    ) -> Result<BTreeMap<DatasetKind, usize>, ImportError> {
        let ids: Vec<_> = currencies.iter().map(|c| c.id).collect();
        let locked = watermarks::lock_for_update(tx.conn(), &ids, now)?;

        let mut batches: BTreeMap<DatasetKind, DatasetBatch> = BTreeMap::new();
        let mut updated: Vec<ImportWatermark> = Vec::with_capacity(currencies.len());
        let mut first_request = true;

        for currency in currencies {
            let mut watermark = locked
                .get(&currency.id)
                .copied()
                .unwrap_or_else(|| ImportWatermark::empty(currency.id));

            for importer in &self.importers {
                if !first_request && !self.request_pause.is_zero() {
                    tokio::time::sleep(self.request_pause).await;
                }
                first_request = false;

                let kind = importer.kind();
                let fetched = importer.fetch(currency, &watermark, now).await?;

                watermark.set(kind, fetched.watermark);
                batches
                    .entry(kind)
                    .or_insert_with(|| DatasetBatch::empty(kind))
                    .extend(fetched.batch)?;
            }

            updated.push(watermark);
        }

        let mut rows = BTreeMap::new();
        for (kind, batch) in &batches {
            rows.insert(*kind, batch.upsert(tx.conn())?);
        }
        watermarks::upsert_batch(tx.conn(), &updated)?;

        Ok(rows)
    }

    fn deadline_exceeded(&self) -> ImportError {
        ImportError::DeadlineExceeded(self.run_timeout.unwrap_or_default())
    }
}

/// Roll back once, keeping the pass error in front
fn abort(tx: &mut ImportTx, cause: ImportError) -> ImportError {
    log::error!("❌ Import pass failed, rolling back: {}", cause);

    match tx.rollback() {
        Ok(()) => cause,
        Err(rollback) => {
            log::error!("❌ Rollback failed: {}", rollback);
            ImportError::RollbackFailed {
                cause: Box::new(cause),
                rollback,
            }
        }
    }
}

/// Resolves once `true` is observed; never resolves if the sender goes away
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

async fn deadline(expires_at: Option<Instant>) {
    match expires_at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panic during import: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panic during import: {}", s)
    } else {
        "panic during import".to_string()
    }
}
