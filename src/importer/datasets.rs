//! Dataset batches and their bulk writes
//!
//! A [`DatasetBatch`] stages the rows of one dataset for every currency of a
//! pass. Rows are keyed by their table's primary key, so a row re-fetched by
//! an overlapping range replaces the earlier copy (last write wins) before
//! anything reaches SQLite.

use super::db::bulk_upsert;
use super::error::PersistenceError;
use super::types::{from_unix, Concentration, CurrencyId, DatasetKind, PriceAndCap};
use chrono::NaiveDate;
use rusqlite::types::Value;
use rusqlite::{params, Connection};
use std::collections::BTreeMap;
use thiserror::Error;

const PRICE_INSERT: &str =
    "INSERT INTO price_and_cap (currency_id, ts, price, daily_volume, cap)";
const PRICE_ON_CONFLICT: &str = "ON CONFLICT(currency_id, ts) DO UPDATE SET
    price = excluded.price,
    daily_volume = excluded.daily_volume,
    cap = excluded.cap";

const CONCENTRATION_INSERT: &str =
    "INSERT INTO concentration (currency_id, d, whales, investors, retail, others)";
const CONCENTRATION_ON_CONFLICT: &str = "ON CONFLICT(currency_id, d) DO UPDATE SET
    whales = excluded.whales,
    investors = excluded.investors,
    retail = excluded.retail,
    others = excluded.others";

const DATE_FORMAT: &str = "%Y-%m-%d";

/// Rows of one dataset offered to a batch of another
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("cannot merge {incoming} rows into a {target} batch")]
pub struct MismatchedBatch {
    pub target: DatasetKind,
    pub incoming: DatasetKind,
}

/// Staged rows of one dataset, deduplicated by primary key
#[derive(Debug, Clone, PartialEq)]
pub enum DatasetBatch {
    PriceAndCap(BTreeMap<(CurrencyId, i64), PriceAndCap>),
    Concentration(BTreeMap<(CurrencyId, NaiveDate), Concentration>),
}

impl DatasetBatch {
    pub fn empty(kind: DatasetKind) -> Self {
        match kind {
            DatasetKind::PriceAndCap => DatasetBatch::PriceAndCap(BTreeMap::new()),
            DatasetKind::Concentration => DatasetBatch::Concentration(BTreeMap::new()),
        }
    }

    pub fn from_prices(rows: impl IntoIterator<Item = PriceAndCap>) -> Self {
        DatasetBatch::PriceAndCap(
            rows.into_iter()
                .map(|row| ((row.currency_id, row.ts.timestamp()), row))
                .collect(),
        )
    }

    pub fn from_concentrations(rows: impl IntoIterator<Item = Concentration>) -> Self {
        DatasetBatch::Concentration(
            rows.into_iter()
                .map(|row| ((row.currency_id, row.d), row))
                .collect(),
        )
    }

    pub fn kind(&self) -> DatasetKind {
        match self {
            DatasetBatch::PriceAndCap(_) => DatasetKind::PriceAndCap,
            DatasetBatch::Concentration(_) => DatasetKind::Concentration,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            DatasetBatch::PriceAndCap(rows) => rows.len(),
            DatasetBatch::Concentration(rows) => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Merge `other` into this batch; rows of `other` win on key collisions
    pub fn extend(&mut self, other: DatasetBatch) -> Result<(), MismatchedBatch> {
        match (self, other) {
            (DatasetBatch::PriceAndCap(rows), DatasetBatch::PriceAndCap(more)) => {
                rows.extend(more);
                Ok(())
            }
            (DatasetBatch::Concentration(rows), DatasetBatch::Concentration(more)) => {
                rows.extend(more);
                Ok(())
            }
            (this, other) => Err(MismatchedBatch {
                target: this.kind(),
                incoming: other.kind(),
            }),
        }
    }

    /// Write every staged row with bulk upserts. Returns the rows written.
    pub fn upsert(&self, conn: &Connection) -> Result<usize, PersistenceError> {
        match self {
            DatasetBatch::PriceAndCap(rows) => {
                let values = rows
                    .values()
                    .map(|p| {
                        vec![
                            Value::Integer(i64::from(p.currency_id)),
                            Value::Integer(p.ts.timestamp()),
                            Value::Real(p.price),
                            Value::Real(p.daily_volume),
                            Value::Real(p.cap),
                        ]
                    })
                    .collect();
                bulk_upsert(conn, PRICE_INSERT, PRICE_ON_CONFLICT, 5, values)
            }
            DatasetBatch::Concentration(rows) => {
                let values = rows
                    .values()
                    .map(|c| {
                        vec![
                            Value::Integer(i64::from(c.currency_id)),
                            Value::Text(c.d.format(DATE_FORMAT).to_string()),
                            Value::Real(c.whales),
                            Value::Real(c.investors),
                            Value::Real(c.retail),
                            Value::Real(c.others),
                        ]
                    })
                    .collect();
                bulk_upsert(conn, CONCENTRATION_INSERT, CONCENTRATION_ON_CONFLICT, 6, values)
            }
        }
    }
}

/// Stored price history of one currency, oldest first
pub fn price_and_cap_for(
    conn: &Connection,
    currency_id: CurrencyId,
) -> Result<Vec<PriceAndCap>, PersistenceError> {
    let mut stmt = conn.prepare(
        "SELECT ts, price, daily_volume, cap FROM price_and_cap WHERE currency_id = ?1 ORDER BY ts",
    )?;
    let rows = stmt.query_map(params![currency_id], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, f64>(1)?,
            row.get::<_, f64>(2)?,
            row.get::<_, f64>(3)?,
        ))
    })?;

    let mut result = Vec::new();
    for row in rows {
        let (ts, price, daily_volume, cap) = row?;
        let ts = from_unix(ts).ok_or_else(|| PersistenceError::Corrupt {
            table: "price_and_cap",
            reason: format!("ts out of range: {}", ts),
        })?;
        result.push(PriceAndCap {
            currency_id,
            price,
            daily_volume,
            cap,
            ts,
        });
    }
    Ok(result)
}

/// Stored concentration history of one currency, oldest first
pub fn concentration_for(
    conn: &Connection,
    currency_id: CurrencyId,
) -> Result<Vec<Concentration>, PersistenceError> {
    let mut stmt = conn.prepare(
        "SELECT d, whales, investors, retail, others FROM concentration
         WHERE currency_id = ?1 ORDER BY d",
    )?;
    let rows = stmt.query_map(params![currency_id], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, f64>(1)?,
            row.get::<_, f64>(2)?,
            row.get::<_, f64>(3)?,
            row.get::<_, f64>(4)?,
        ))
    })?;

    let mut result = Vec::new();
    for row in rows {
        let (d, whales, investors, retail, others) = row?;
        let d = NaiveDate::parse_from_str(&d, DATE_FORMAT).map_err(|e| PersistenceError::Corrupt {
            table: "concentration",
            reason: format!("bad date '{}': {}", d, e),
        })?;
        result.push(Concentration {
            currency_id,
            whales,
            investors,
            retail,
            others,
            d,
        });
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::importer::currencies;
    use crate::importer::db::Database;
    use crate::importer::types::Currency;

    fn store_currency(conn: &Connection, id: CurrencyId, slug: &str) {
        let currency = Currency {
            id,
            symbol: slug.to_uppercase(),
            slug: slug.to_string(),
            name: slug.to_string(),
            is_tracked: true,
        };
        currencies::create(conn, &currency).unwrap();
    }

    fn price(id: CurrencyId, secs: i64, value: f64) -> PriceAndCap {
        PriceAndCap {
            currency_id: id,
            price: value,
            daily_volume: value * 10.0,
            cap: value * 100.0,
            ts: from_unix(secs).unwrap(),
        }
    }

    fn conc(id: CurrencyId, day: u32, whales: f64) -> Concentration {
        Concentration {
            currency_id: id,
            whales,
            investors: 20.0,
            retail: 10.0,
            others: 70.0 - whales,
            d: NaiveDate::from_ymd_opt(2024, 3, day).unwrap(),
        }
    }

    #[test]
    fn test_overlapping_rows_last_write_wins() {
        let mut batch = DatasetBatch::from_concentrations(vec![conc(1, 1, 40.0), conc(1, 2, 41.0)]);
        batch
            .extend(DatasetBatch::from_concentrations(vec![conc(1, 2, 45.0), conc(1, 3, 46.0)]))
            .unwrap();

        assert_eq!(batch.len(), 3);
        match &batch {
            DatasetBatch::Concentration(rows) => {
                let day2 = NaiveDate::from_ymd_opt(2024, 3, 2).unwrap();
                assert_eq!(rows[&(1, day2)].whales, 45.0);
            }
            other => panic!("unexpected batch {:?}", other.kind()),
        }
    }

    #[test]
    fn test_extend_rejects_other_dataset() {
        let mut batch = DatasetBatch::empty(DatasetKind::PriceAndCap);
        let err = batch
            .extend(DatasetBatch::empty(DatasetKind::Concentration))
            .unwrap_err();
        assert_eq!(err.target, DatasetKind::PriceAndCap);
        assert_eq!(err.incoming, DatasetKind::Concentration);
        assert!(err.to_string().contains("concentration rows"));
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn test_upsert_and_read_back() {
        let db = Database::open_in_memory().unwrap();
        let tx = db.begin().await.unwrap();
        store_currency(tx.conn(), 1, "bitcoin");
        store_currency(tx.conn(), 2, "litecoin");

        let prices = DatasetBatch::from_prices(vec![
            price(1, 200, 2.0),
            price(1, 100, 1.0),
            price(2, 100, 9.0),
        ]);
        assert_eq!(prices.upsert(tx.conn()).unwrap(), 3);

        // Same key, new value
        DatasetBatch::from_prices(vec![price(1, 200, 2.5)])
            .upsert(tx.conn())
            .unwrap();

        let stored = price_and_cap_for(tx.conn(), 1).unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].ts.timestamp(), 100);
        assert_eq!(stored[1].price, 2.5);

        let concs = DatasetBatch::from_concentrations(vec![conc(1, 5, 40.0), conc(1, 4, 39.0)]);
        assert_eq!(concs.upsert(tx.conn()).unwrap(), 2);

        let stored = concentration_for(tx.conn(), 1).unwrap();
        assert_eq!(stored, vec![conc(1, 4, 39.0), conc(1, 5, 40.0)]);
        assert!(concentration_for(tx.conn(), 2).unwrap().is_empty());
    }
}
