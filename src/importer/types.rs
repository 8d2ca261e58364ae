//! Domain records shared by the import pipeline
//!
//! Timestamps are UTC and persisted as unix seconds; concentration points are
//! daily and keyed by calendar date.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Upstream numeric currency id (also the local primary key)
pub type CurrencyId = u32;

/// A currency known to the local store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Currency {
    pub id: CurrencyId,
    pub symbol: String,
    pub slug: String,
    pub name: String,
    /// Actively imported by the collector
    pub is_tracked: bool,
}

/// One price / volume / market cap observation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceAndCap {
    pub currency_id: CurrencyId,
    pub price: f64,
    pub daily_volume: f64,
    pub cap: f64,
    pub ts: DateTime<Utc>,
}

/// One day of holder concentration, as percentages of supply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Concentration {
    pub currency_id: CurrencyId,
    pub whales: f64,
    pub investors: f64,
    pub retail: f64,
    pub others: f64,
    pub d: NaiveDate,
}

/// Independently fetched, independently staled dataset
///
/// Ordering is the order in which dataset batches are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DatasetKind {
    PriceAndCap,
    Concentration,
}

impl DatasetKind {
    pub const ALL: [DatasetKind; 2] = [DatasetKind::PriceAndCap, DatasetKind::Concentration];

    pub fn as_str(&self) -> &'static str {
        match self {
            DatasetKind::PriceAndCap => "price_and_cap",
            DatasetKind::Concentration => "concentration",
        }
    }
}

impl fmt::Display for DatasetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// History window understood by the upstream source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RangeSpec {
    /// Full history
    All,
    OneYear,
    OneMonth,
}

impl RangeSpec {
    /// Query parameter value used by the upstream API
    pub fn as_param(&self) -> &'static str {
        match self {
            RangeSpec::All => "ALL",
            RangeSpec::OneYear => "1Y",
            RangeSpec::OneMonth => "1M",
        }
    }
}

impl fmt::Display for RangeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_param())
    }
}

/// Last imported time per dataset for one currency
///
/// `None` for a dataset means it was never imported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportWatermark {
    pub currency_id: CurrencyId,
    pub price_and_cap: Option<DateTime<Utc>>,
    pub concentration: Option<DateTime<Utc>>,
}

impl ImportWatermark {
    /// Watermark of a currency that has never been imported
    pub fn empty(currency_id: CurrencyId) -> Self {
        Self {
            currency_id,
            price_and_cap: None,
            concentration: None,
        }
    }

    pub fn get(&self, kind: DatasetKind) -> Option<DateTime<Utc>> {
        match kind {
            DatasetKind::PriceAndCap => self.price_and_cap,
            DatasetKind::Concentration => self.concentration,
        }
    }

    pub fn set(&mut self, kind: DatasetKind, value: Option<DateTime<Utc>>) {
        match kind {
            DatasetKind::PriceAndCap => self.price_and_cap = value,
            DatasetKind::Concentration => self.concentration = value,
        }
    }
}

/// Convert unix seconds read from SQLite back into a UTC timestamp
pub(crate) fn from_unix(secs: i64) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(secs, 0)
}
