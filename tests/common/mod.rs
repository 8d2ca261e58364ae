//! Shared fixtures for integration tests
//!
//! `StubSource` is a scripted in-process upstream: rows per (currency, range),
//! injectable failures and panics, and an optional gate that parks the first
//! concentration request until the test releases it.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use coinsync::importer::{
    default_importers, Concentration, Currency, CurrencyBootstrap, CurrencyId, Database,
    DatasetKind, MarketDataSource, PriceAndCap, RangeSpec, Reconciler, SourceError,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// 2024-06-01T00:00:00Z
pub fn fixed_now() -> DateTime<Utc> {
    Utc.timestamp_opt(1_717_200_000, 0).unwrap()
}

pub fn days_before_now(days: i64) -> DateTime<Utc> {
    fixed_now() - Duration::days(days)
}

pub fn currency(id: CurrencyId, slug: &str) -> Currency {
    Currency {
        id,
        symbol: slug[..3.min(slug.len())].to_uppercase(),
        slug: slug.to_string(),
        name: slug.to_string(),
        is_tracked: false,
    }
}

pub fn price(id: CurrencyId, ts: DateTime<Utc>, value: f64) -> PriceAndCap {
    PriceAndCap {
        currency_id: id,
        price: value,
        daily_volume: value * 1_000.0,
        cap: value * 1_000_000.0,
        ts,
    }
}

pub fn conc(id: CurrencyId, date: &str, whales: f64) -> Concentration {
    Concentration {
        currency_id: id,
        whales,
        investors: 25.0,
        retail: 15.0,
        others: 60.0 - whales,
        d: NaiveDate::parse_from_str(date, "%Y-%m-%d").unwrap(),
    }
}

/// One recorded dataset request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Call {
    pub kind: DatasetKind,
    pub currency_id: CurrencyId,
    pub range: RangeSpec,
}

pub fn call(kind: DatasetKind, currency_id: CurrencyId, range: RangeSpec) -> Call {
    Call {
        kind,
        currency_id,
        range,
    }
}

pub struct Gate {
    pub entered: Arc<Notify>,
    pub release: Arc<Notify>,
}

#[derive(Default)]
pub struct StubSource {
    currencies: Mutex<HashMap<String, Currency>>,
    /// `None` range = answer for any range without a specific entry
    prices: Mutex<HashMap<(CurrencyId, Option<RangeSpec>), Vec<PriceAndCap>>>,
    concentration: Mutex<HashMap<(CurrencyId, Option<RangeSpec>), Vec<Concentration>>>,
    failing: Mutex<HashSet<(DatasetKind, CurrencyId)>>,
    panicking: Mutex<HashSet<(DatasetKind, CurrencyId)>>,
    gate: Mutex<Option<(Arc<Notify>, Arc<Notify>)>>,
    currency_calls: Mutex<Vec<String>>,
    calls: Mutex<Vec<Call>>,
}

impl StubSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_currency(&self, currency: Currency) {
        self.currencies
            .lock()
            .unwrap()
            .insert(currency.slug.clone(), currency);
    }

    /// Answer `slug` with `currency` (upstream knows the coin under several slugs)
    pub fn add_alias(&self, slug: &str, currency: Currency) {
        self.currencies.lock().unwrap().insert(slug.to_string(), currency);
    }

    pub fn set_prices(&self, id: CurrencyId, range: Option<RangeSpec>, rows: Vec<PriceAndCap>) {
        self.prices.lock().unwrap().insert((id, range), rows);
    }

    pub fn set_concentration(
        &self,
        id: CurrencyId,
        range: Option<RangeSpec>,
        rows: Vec<Concentration>,
    ) {
        self.concentration.lock().unwrap().insert((id, range), rows);
    }

    pub fn fail(&self, kind: DatasetKind, id: CurrencyId) {
        self.failing.lock().unwrap().insert((kind, id));
    }

    pub fn panic_on(&self, kind: DatasetKind, id: CurrencyId) {
        self.panicking.lock().unwrap().insert((kind, id));
    }

    pub fn clear_faults(&self) {
        self.failing.lock().unwrap().clear();
        self.panicking.lock().unwrap().clear();
    }

    /// Park the next concentration request until `release` is notified
    pub fn gate_next_concentration(&self) -> Gate {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        *self.gate.lock().unwrap() = Some((entered.clone(), release.clone()));
        Gate { entered, release }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn currency_calls(&self) -> Vec<String> {
        self.currency_calls.lock().unwrap().clone()
    }

    fn record(
        &self,
        kind: DatasetKind,
        currency_id: CurrencyId,
        range: RangeSpec,
    ) -> Result<(), SourceError> {
        self.calls.lock().unwrap().push(call(kind, currency_id, range));

        let should_panic = self.panicking.lock().unwrap().contains(&(kind, currency_id));
        if should_panic {
            panic!("stub source exploded on {} for {}", kind, currency_id);
        }

        if self.failing.lock().unwrap().contains(&(kind, currency_id)) {
            return Err(SourceError::Api {
                code: "1008".to_string(),
                message: format!("{} unavailable", kind),
            });
        }
        Ok(())
    }

    fn lookup<T: Clone>(
        table: &Mutex<HashMap<(CurrencyId, Option<RangeSpec>), Vec<T>>>,
        id: CurrencyId,
        range: RangeSpec,
    ) -> Result<Vec<T>, SourceError> {
        let table = table.lock().unwrap();
        table
            .get(&(id, Some(range)))
            .or_else(|| table.get(&(id, None)))
            .filter(|rows| !rows.is_empty())
            .cloned()
            .ok_or_else(|| SourceError::NotFound(format!("{}/{}", id, range)))
    }
}

#[async_trait]
impl MarketDataSource for StubSource {
    async fn get_currency(&self, slug: &str) -> Result<Currency, SourceError> {
        self.currency_calls.lock().unwrap().push(slug.to_string());
        self.currencies
            .lock()
            .unwrap()
            .get(slug)
            .cloned()
            .ok_or_else(|| SourceError::NotFound(slug.to_string()))
    }

    async fn get_price_and_cap(
        &self,
        currency_id: CurrencyId,
        range: RangeSpec,
    ) -> Result<Vec<PriceAndCap>, SourceError> {
        self.record(DatasetKind::PriceAndCap, currency_id, range)?;
        Self::lookup(&self.prices, currency_id, range)
    }

    async fn get_concentration(
        &self,
        currency_id: CurrencyId,
        range: RangeSpec,
    ) -> Result<Vec<Concentration>, SourceError> {
        self.record(DatasetKind::Concentration, currency_id, range)?;

        let gate = self.gate.lock().unwrap().take();
        if let Some((entered, release)) = gate {
            entered.notify_one();
            release.notified().await;
        }

        Self::lookup(&self.concentration, currency_id, range)
    }
}

/// Reconciler wired to `source` with the clock pinned to [`fixed_now`]
pub fn reconciler(db: &Database, source: &Arc<StubSource>) -> Reconciler {
    let source: Arc<dyn MarketDataSource> = source.clone();
    let bootstrap = CurrencyBootstrap::new(db.clone(), source.clone());
    Reconciler::new(db.clone(), bootstrap, default_importers(source))
        .with_now_fn(Arc::new(fixed_now))
}

pub async fn count_rows(db: &Database, table: &str) -> i64 {
    let sql = format!("SELECT COUNT(*) FROM {}", table);
    db.with_conn(|conn| conn.query_row(&sql, [], |row| row.get(0)))
        .await
        .unwrap()
}
