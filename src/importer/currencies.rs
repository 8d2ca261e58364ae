//! `currencies` table access
//!
//! Lookups return an empty result rather than an error when nothing matches.

use super::error::PersistenceError;
use super::types::{Currency, CurrencyId};
use rusqlite::{params, params_from_iter, Connection, Row};

const SELECT_COLUMNS: &str = "SELECT id, symbol, slug, name, is_tracked FROM currencies";

fn row_to_currency(row: &Row<'_>) -> rusqlite::Result<Currency> {
    Ok(Currency {
        id: row.get(0)?,
        symbol: row.get(1)?,
        slug: row.get(2)?,
        name: row.get(3)?,
        is_tracked: row.get(4)?,
    })
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

/// Currencies whose slug is in `slugs` (any order, missing slugs skipped)
pub fn get_by_slugs(
    conn: &Connection,
    slugs: &[String],
) -> Result<Vec<Currency>, PersistenceError> {
    if slugs.is_empty() {
        return Ok(Vec::new());
    }

    let sql = format!("{} WHERE slug IN ({})", SELECT_COLUMNS, placeholders(slugs.len()));
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(slugs.iter()), row_to_currency)?;

    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn get_by_id(conn: &Connection, id: CurrencyId) -> Result<Option<Currency>, PersistenceError> {
    let sql = format!("{} WHERE id = ?1", SELECT_COLUMNS);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query_map(params![id], row_to_currency)?;

    Ok(rows.next().transpose()?)
}

/// All currencies marked as tracked, ordered by id
pub fn get_tracked(conn: &Connection) -> Result<Vec<Currency>, PersistenceError> {
    let sql = format!("{} WHERE is_tracked = 1 ORDER BY id", SELECT_COLUMNS);
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], row_to_currency)?;

    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Insert a currency, or mark the existing row with the same id as tracked
///
/// Conflict-safe: creating the same currency twice leaves one row. The
/// stored slug is never rewritten.
pub fn create(conn: &Connection, currency: &Currency) -> Result<(), PersistenceError> {
    conn.execute(
        r#"
        INSERT INTO currencies (id, symbol, slug, name, is_tracked)
        VALUES (?1, ?2, ?3, ?4, ?5)
        ON CONFLICT(id) DO UPDATE SET
            is_tracked = MAX(is_tracked, excluded.is_tracked)
        "#,
        params![
            currency.id,
            currency.symbol,
            currency.slug,
            currency.name,
            currency.is_tracked,
        ],
    )?;
    Ok(())
}

/// Set `is_tracked` on the given currencies
pub fn mark_tracked(conn: &Connection, ids: &[CurrencyId]) -> Result<usize, PersistenceError> {
    if ids.is_empty() {
        return Ok(0);
    }

    let sql = format!(
        "UPDATE currencies SET is_tracked = 1 WHERE is_tracked = 0 AND id IN ({})",
        placeholders(ids.len())
    );
    Ok(conn.execute(&sql, params_from_iter(ids.iter()))?)
}
