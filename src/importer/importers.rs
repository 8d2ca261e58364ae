//! Per-dataset importers and their range policies
//!
//! Each importer decides, from a currency's last watermark for its dataset,
//! which upstream ranges to fetch, then merges the results into one batch.
//!
//! | Last import            | Price / cap | Concentration |
//! |------------------------|-------------|---------------|
//! | never, or > 365 days   | `ALL`       | `ALL` + `1M`  |
//! | > 31 days              | `1Y`        | `1Y` + `1M`   |
//! | otherwise              | `1M`        | `1M`          |
//!
//! Concentration always re-fetches the last month because upstream revises
//! recent days; the overlap is collapsed by primary key before writing.

use super::datasets::DatasetBatch;
use super::error::{ImportError, SourceError};
use super::source::MarketDataSource;
use super::types::{Currency, DatasetKind, ImportWatermark, RangeSpec};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

/// Older than this → refetch full history
pub const FULL_HISTORY_AFTER_DAYS: i64 = 365;

/// Older than this (but not full-history stale) → refetch one year
pub const ONE_YEAR_AFTER_DAYS: i64 = 31;

/// Widest range needed to cover everything since `last`
pub fn staleness_range(last: Option<DateTime<Utc>>, now: DateTime<Utc>) -> RangeSpec {
    match last {
        None => RangeSpec::All,
        Some(last) if now - last > Duration::days(FULL_HISTORY_AFTER_DAYS) => RangeSpec::All,
        Some(last) if now - last > Duration::days(ONE_YEAR_AFTER_DAYS) => RangeSpec::OneYear,
        Some(_) => RangeSpec::OneMonth,
    }
}

/// Staleness range plus the trailing month, without duplicates
pub fn tiered_ranges(last: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Vec<RangeSpec> {
    match staleness_range(last, now) {
        RangeSpec::OneMonth => vec![RangeSpec::OneMonth],
        wider => vec![wider, RangeSpec::OneMonth],
    }
}

/// Rows of one dataset for one currency plus the watermark they justify
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedDataset {
    pub batch: DatasetBatch,
    pub watermark: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait DatasetImporter: Send + Sync {
    fn kind(&self) -> DatasetKind;

    /// Upstream ranges to request, in request order
    fn ranges(&self, last: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Vec<RangeSpec>;

    /// One upstream call
    async fn fetch_range(
        &self,
        currency: &Currency,
        range: RangeSpec,
    ) -> Result<DatasetBatch, SourceError>;

    /// Watermark to store once `batch` is committed
    fn next_watermark(
        &self,
        previous: Option<DateTime<Utc>>,
        batch: &DatasetBatch,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>>;

    /// Fetch every required range and merge them
    ///
    /// The first failing call aborts the whole dataset. Not-found means the
    /// range has no rows.
    async fn fetch(
        &self,
        currency: &Currency,
        watermark: &ImportWatermark,
        now: DateTime<Utc>,
    ) -> Result<FetchedDataset, ImportError> {
        let kind = self.kind();
        let previous = watermark.get(kind);
        let mut batch = DatasetBatch::empty(kind);

        for range in self.ranges(previous, now) {
            let rows = match self.fetch_range(currency, range).await {
                Ok(rows) => rows,
                Err(e) if e.is_not_found() => {
                    log::debug!("   ├─ {} {} [{}]: no data upstream", currency.slug, kind, range);
                    DatasetBatch::empty(kind)
                }
                Err(source) => {
                    return Err(ImportError::Fetch {
                        slug: currency.slug.clone(),
                        dataset: kind,
                        source,
                    })
                }
            };

            log::debug!("   ├─ {} {} [{}]: {} rows", currency.slug, kind, range, rows.len());
            // Later (narrower) ranges overwrite overlapping keys
            batch.extend(rows)?;
        }

        let watermark = self.next_watermark(previous, &batch, now);
        Ok(FetchedDataset { batch, watermark })
    }
}

/// Price / volume / market cap history: one range per pass
pub struct PriceAndCapImporter {
    source: Arc<dyn MarketDataSource>,
}

impl PriceAndCapImporter {
    pub fn new(source: Arc<dyn MarketDataSource>) -> Self {
        Self { source }
    }
}

#[async_trait]
impl DatasetImporter for PriceAndCapImporter {
    fn kind(&self) -> DatasetKind {
        DatasetKind::PriceAndCap
    }

    fn ranges(&self, last: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Vec<RangeSpec> {
        vec![staleness_range(last, now)]
    }

    async fn fetch_range(
        &self,
        currency: &Currency,
        range: RangeSpec,
    ) -> Result<DatasetBatch, SourceError> {
        let rows = self.source.get_price_and_cap(currency.id, range).await?;
        Ok(DatasetBatch::from_prices(rows))
    }

    /// Newest observed point; the previous mark when nothing newer came back
    fn next_watermark(
        &self,
        previous: Option<DateTime<Utc>>,
        batch: &DatasetBatch,
        _now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        let observed = match batch {
            DatasetBatch::PriceAndCap(rows) => rows.values().map(|p| p.ts).max(),
            DatasetBatch::Concentration(_) => None,
        };
        observed.max(previous)
    }
}

/// Holder concentration history: staleness range plus the trailing month
pub struct ConcentrationImporter {
    source: Arc<dyn MarketDataSource>,
}

impl ConcentrationImporter {
    pub fn new(source: Arc<dyn MarketDataSource>) -> Self {
        Self { source }
    }
}

#[async_trait]
impl DatasetImporter for ConcentrationImporter {
    fn kind(&self) -> DatasetKind {
        DatasetKind::Concentration
    }

    fn ranges(&self, last: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Vec<RangeSpec> {
        tiered_ranges(last, now)
    }

    async fn fetch_range(
        &self,
        currency: &Currency,
        range: RangeSpec,
    ) -> Result<DatasetBatch, SourceError> {
        let rows = self.source.get_concentration(currency.id, range).await?;
        Ok(DatasetBatch::from_concentrations(rows))
    }

    /// Daily points carry no time of day, so the pass time is the mark
    fn next_watermark(
        &self,
        _previous: Option<DateTime<Utc>>,
        _batch: &DatasetBatch,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        Some(now)
    }
}

/// The standard importer set, in write order
pub fn default_importers(source: Arc<dyn MarketDataSource>) -> Vec<Arc<dyn DatasetImporter>> {
    vec![
        Arc::new(PriceAndCapImporter::new(source.clone())),
        Arc::new(ConcentrationImporter::new(source)),
    ]
}
