//! SQLite persistence boundary
//!
//! - [`Database`] owns one connection (WAL mode)
//! - [`ImportTx`] is an explicit write transaction on that connection
//! - [`run_schema_migrations`] applies the embedded `/sql/` files
//! - [`bulk_upsert`] writes a variable-length row set per statement
//!
//! Transactions start with `BEGIN IMMEDIATE`, so the write lock is taken up
//! front and held until COMMIT or ROLLBACK. The connection itself never
//! waits on SQLite's busy handler: while another connection holds the lock,
//! [`Database::begin`] retries on the async side with exponential backoff
//! until the lock timeout runs out. Dropping the `begin` future stops the
//! wait at once.

use super::error::PersistenceError;
use rusqlite::types::Value;
use rusqlite::Connection;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;

/// Schema files, applied in order. Every file must be idempotent.
const MIGRATIONS: &[(&str, &str)] = &[
    ("01_currencies.sql", include_str!("../../sql/01_currencies.sql")),
    ("02_import_watermark.sql", include_str!("../../sql/02_import_watermark.sql")),
    ("03_price_and_cap.sql", include_str!("../../sql/03_price_and_cap.sql")),
    ("04_concentration.sql", include_str!("../../sql/04_concentration.sql")),
];

/// SQLite's default SQLITE_MAX_VARIABLE_NUMBER on older builds
const MAX_BIND_PARAMS: usize = 999;

const LOCK_RETRY_INITIAL: Duration = Duration::from_millis(10);
const LOCK_RETRY_MAX: Duration = Duration::from_millis(250);

/// Run schema migrations
///
/// Executes every embedded `.sql` file in order. All files use
/// "IF NOT EXISTS" clauses, so running this on an existing database is a no-op.
pub fn run_schema_migrations(conn: &mut Connection) -> Result<(), PersistenceError> {
    log::info!("🔧 Running schema migrations");

    for (filename, sql) in MIGRATIONS {
        log::debug!("   ├─ Executing: {}", filename);
        conn.execute_batch(sql)?;
    }

    log::info!("✅ All schema migrations completed successfully ({} files)", MIGRATIONS.len());
    Ok(())
}

/// Doubling pause between write-lock attempts, bounded by a deadline
#[derive(Debug)]
struct LockBackoff {
    delay: Duration,
    give_up_at: Instant,
}

impl LockBackoff {
    fn new(lock_timeout: Duration) -> Self {
        Self {
            delay: LOCK_RETRY_INITIAL,
            give_up_at: Instant::now() + lock_timeout,
        }
    }

    /// Sleep before the next attempt; `false` once the lock timeout is spent
    async fn sleep(&mut self) -> bool {
        let now = Instant::now();
        if now >= self.give_up_at {
            return false;
        }

        let pause = self.delay.min(self.give_up_at - now);
        tokio::time::sleep(pause).await;
        self.delay = (self.delay * 2).min(LOCK_RETRY_MAX);
        true
    }
}

/// Shared handle to one SQLite connection
///
/// Cloning is cheap; clones share the connection and take turns on it.
/// Separate `Database::open` calls on the same file get separate connections
/// and contend on SQLite's own lock instead.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    lock_timeout: Duration,
}

impl Database {
    /// Open (or create) a database file and bring its schema up to date
    ///
    /// `lock_timeout` bounds how long [`Database::begin`] waits for another
    /// connection's write lock before failing with a busy error. Statements
    /// run through [`Database::with_conn`] do not wait: a write there fails
    /// at once while the lock is held elsewhere. WAL reads never wait.
    pub fn open(db_path: &str, lock_timeout: Duration) -> Result<Self, PersistenceError> {
        if let Some(parent) = std::path::Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut conn = Connection::open(db_path)?;

        // WAL lets readers proceed while an import pass holds the write lock
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(Duration::ZERO)?;
        run_schema_migrations(&mut conn)?;

        log::info!("📊 Database ready: {}", db_path);
        Ok(Self::from_connection(conn, lock_timeout))
    }

    /// Private in-memory database (for tests)
    pub fn open_in_memory() -> Result<Self, PersistenceError> {
        let mut conn = Connection::open_in_memory()?;
        run_schema_migrations(&mut conn)?;
        Ok(Self::from_connection(conn, Duration::ZERO))
    }

    fn from_connection(conn: Connection, lock_timeout: Duration) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            lock_timeout,
        }
    }

    /// Begin a write transaction, waiting up to the lock timeout for the lock
    ///
    /// Waits for other users of this handle to finish first. A connection
    /// left inside a transaction by a failed rollback is reset here. Once the
    /// lock timeout is spent, the last busy error is returned
    /// ([`PersistenceError::is_lock_timeout`]).
    pub async fn begin(&self) -> Result<ImportTx, PersistenceError> {
        let conn = self.conn.clone().lock_owned().await;

        if !conn.is_autocommit() {
            log::warn!("⚠️  Connection still inside a transaction, rolling it back before BEGIN");
            conn.execute_batch("ROLLBACK")?;
        }

        let mut backoff = LockBackoff::new(self.lock_timeout);
        let mut waiting = false;
        loop {
            let busy = match conn.execute_batch("BEGIN IMMEDIATE") {
                Ok(()) => break,
                Err(e) => PersistenceError::from(e),
            };
            if !busy.is_lock_timeout() {
                return Err(busy);
            }
            if !waiting {
                log::debug!("⏳ Write lock held by another connection, waiting");
                waiting = true;
            }
            if !backoff.sleep().await {
                log::warn!("⚠️  Gave up on the write lock after {:?}", self.lock_timeout);
                return Err(busy);
            }
        }

        Ok(ImportTx {
            conn,
            finished: false,
        })
    }

    /// Run a closure against the connection outside any explicit transaction
    pub async fn with_conn<T, E, F>(&self, f: F) -> Result<T, PersistenceError>
    where
        F: FnOnce(&Connection) -> Result<T, E>,
        E: Into<PersistenceError>,
    {
        let conn = self.conn.lock().await;
        f(&conn).map_err(Into::into)
    }
}

/// An open write transaction
///
/// Dropping an unfinished transaction rolls it back.
#[derive(Debug)]
pub struct ImportTx {
    conn: OwnedMutexGuard<Connection>,
    finished: bool,
}

impl ImportTx {
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Commit all writes made through this transaction
    ///
    /// On failure the transaction stays open so the caller can roll back.
    pub fn commit(&mut self) -> Result<(), PersistenceError> {
        self.conn.execute_batch("COMMIT")?;
        self.finished = true;
        Ok(())
    }

    /// Discard all writes made through this transaction
    ///
    /// Attempted at most once: the transaction counts as finished afterwards
    /// even if ROLLBACK itself failed.
    pub fn rollback(&mut self) -> Result<(), PersistenceError> {
        self.finished = true;
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }
}

impl Drop for ImportTx {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                log::error!("❌ Rollback of abandoned transaction failed: {}", e);
            }
        }
    }
}

/// Insert-or-update many rows with as few statements as possible
///
/// Builds `{insert} VALUES (?, ..), (?, ..) .. {on_conflict}` and executes it
/// once per chunk, each chunk staying under the bind-parameter limit.
/// Every row must have `columns` values. Returns the number of rows written.
pub fn bulk_upsert(
    conn: &Connection,
    insert: &str,
    on_conflict: &str,
    columns: usize,
    rows: Vec<Vec<Value>>,
) -> Result<usize, PersistenceError> {
    if rows.is_empty() {
        return Ok(0);
    }

    let rows_per_statement = (MAX_BIND_PARAMS / columns).max(1);
    let placeholder = format!("({})", vec!["?"; columns].join(", "));
    let mut written = 0;

    for chunk in rows.chunks(rows_per_statement) {
        let capacity = insert.len() + on_conflict.len() + chunk.len() * (placeholder.len() + 2) + 8;
        let mut sql = String::with_capacity(capacity);
        sql.push_str(insert);
        sql.push_str(" VALUES ");
        for i in 0..chunk.len() {
            if i > 0 {
                sql.push_str(", ");
            }
            sql.push_str(&placeholder);
        }
        sql.push(' ');
        sql.push_str(on_conflict);

        let params = chunk.iter().flat_map(|row| row.iter());
        conn.execute(&sql, rusqlite::params_from_iter(params))?;
        written += chunk.len();
    }

    Ok(written)
}
