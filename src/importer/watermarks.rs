//! Watermark store (`import_watermark` table)
//!
//! [`lock_for_update`] runs inside a transaction from
//! [`Database::begin`](super::db::Database::begin), which already holds
//! SQLite's write lock. It stamps the requested rows and reads them; nothing
//! else can change them until the transaction commits or rolls back. A second
//! pass over the same currencies waits in `begin`, and once it gets the lock,
//! reads the watermarks the first pass committed.
//!
//! SQLite locks the whole database rather than rows, so passes over disjoint
//! currency sets are serialized too.

use super::db::bulk_upsert;
use super::error::PersistenceError;
use super::types::{from_unix, CurrencyId, ImportWatermark};
use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection};
use std::collections::HashMap;

const UPSERT_INSERT: &str =
    "INSERT INTO import_watermark (currency_id, price_and_cap, concentration)";
const UPSERT_ON_CONFLICT: &str = "ON CONFLICT(currency_id) DO UPDATE SET
    price_and_cap = excluded.price_and_cap,
    concentration = excluded.concentration";

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn to_unix(t: Option<DateTime<Utc>>) -> Value {
    match t {
        Some(t) => Value::Integer(t.timestamp()),
        None => Value::Null,
    }
}

fn decode_ts(
    column: &'static str,
    secs: Option<i64>,
) -> Result<Option<DateTime<Utc>>, PersistenceError> {
    match secs {
        None => Ok(None),
        Some(secs) => from_unix(secs).map(Some).ok_or_else(|| PersistenceError::Corrupt {
            table: "import_watermark",
            reason: format!("{} out of range: {}", column, secs),
        }),
    }
}

/// Read watermarks without locking. Missing rows are simply absent from the map.
pub fn get_many(
    conn: &Connection,
    ids: &[CurrencyId],
) -> Result<HashMap<CurrencyId, ImportWatermark>, PersistenceError> {
    if ids.is_empty() {
        return Ok(HashMap::new());
    }

    let sql = format!(
        "SELECT currency_id, price_and_cap, concentration FROM import_watermark
         WHERE currency_id IN ({})",
        placeholders(ids.len())
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(ids.iter()), |row| {
        Ok((
            row.get::<_, CurrencyId>(0)?,
            row.get::<_, Option<i64>>(1)?,
            row.get::<_, Option<i64>>(2)?,
        ))
    })?;

    let mut result = HashMap::with_capacity(ids.len());
    for row in rows {
        let (currency_id, price_and_cap, concentration) = row?;
        result.insert(
            currency_id,
            ImportWatermark {
                currency_id,
                price_and_cap: decode_ts("price_and_cap", price_and_cap)?,
                concentration: decode_ts("concentration", concentration)?,
            },
        );
    }

    Ok(result)
}

/// Lock and read the watermarks of `ids` for the rest of the transaction
///
/// Must be called on a connection inside an open write transaction; it does
/// not wait for the lock itself. Currencies without a row are not an error;
/// they are missing from the returned map.
pub fn lock_for_update(
    conn: &Connection,
    ids: &[CurrencyId],
    now: DateTime<Utc>,
) -> Result<HashMap<CurrencyId, ImportWatermark>, PersistenceError> {
    if ids.is_empty() {
        return Ok(HashMap::new());
    }

    let sql = format!(
        "UPDATE import_watermark SET locked_at = ? WHERE currency_id IN ({})",
        placeholders(ids.len())
    );
    let mut values: Vec<Value> = Vec::with_capacity(ids.len() + 1);
    values.push(Value::Integer(now.timestamp()));
    values.extend(ids.iter().map(|id| Value::Integer(i64::from(*id))));

    let locked = conn.execute(&sql, params_from_iter(values.iter()))?;
    log::debug!("🔒 Locked {} of {} watermark rows", locked, ids.len());

    get_many(conn, ids)
}

/// Insert-or-update one watermark row per currency in a single statement
pub fn upsert_batch<'a, I>(conn: &Connection, watermarks: I) -> Result<usize, PersistenceError>
where
    I: IntoIterator<Item = &'a ImportWatermark>,
{
    let rows: Vec<Vec<Value>> = watermarks
        .into_iter()
        .map(|wm| {
            vec![
                Value::Integer(i64::from(wm.currency_id)),
                to_unix(wm.price_and_cap),
                to_unix(wm.concentration),
            ]
        })
        .collect();

    bulk_upsert(conn, UPSERT_INSERT, UPSERT_ON_CONFLICT, 3, rows)
}

/// Create an empty watermark row unless one already exists
pub fn seed(conn: &Connection, currency_id: CurrencyId) -> Result<(), PersistenceError> {
    conn.execute(
        "INSERT INTO import_watermark (currency_id) VALUES (?1)
         ON CONFLICT(currency_id) DO NOTHING",
        params![currency_id],
    )?;
    Ok(())
}
