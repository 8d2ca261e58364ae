//! Error taxonomy for the import pipeline
//!
//! - [`SourceError`] - anything coming back from the upstream adapter.
//!   `NotFound` is benign for dataset ranges (no rows) but fatal for
//!   bootstrap (an unknown slug cannot be created).
//! - [`PersistenceError`] - SQLite failures, including lock timeouts.
//! - [`ImportError`] - what a reconciliation pass reports to its caller.

use super::datasets::MismatchedBatch;
use super::types::DatasetKind;
use std::time::Duration;
use thiserror::Error;

/// Upstream market data source errors
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("http transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("unexpected http status {status} for {uri}")]
    Status { status: u16, uri: String },

    #[error("upstream error {code}: {message}")]
    Api { code: String, message: String },

    #[error("malformed response from {uri}: {reason}")]
    Decode { uri: String, reason: String },
}

impl SourceError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, SourceError::NotFound(_))
    }
}

/// Local store errors
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("corrupt row in {table}: {reason}")]
    Corrupt { table: &'static str, reason: String },

    #[error("database directory: {0}")]
    Io(#[from] std::io::Error),
}

impl PersistenceError {
    /// True when another connection held the write lock (past the lock timeout)
    pub fn is_lock_timeout(&self) -> bool {
        matches!(
            self,
            PersistenceError::Sqlite(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::DatabaseBusy
                    || e.code == rusqlite::ErrorCode::DatabaseLocked
        )
    }
}

/// Outcome of a failed reconciliation pass
#[derive(Debug, Error)]
pub enum ImportError {
    #[error("bootstrap of currency '{slug}' failed: {source}")]
    Bootstrap {
        slug: String,
        #[source]
        source: SourceError,
    },

    #[error("fetching {dataset} for '{slug}' failed: {source}")]
    Fetch {
        slug: String,
        dataset: DatasetKind,
        #[source]
        source: SourceError,
    },

    #[error("persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("internal fault: {0}")]
    Internal(String),

    #[error("internal fault: {0}")]
    Batch(#[from] MismatchedBatch),

    #[error("import cancelled")]
    Cancelled,

    #[error("import exceeded its deadline of {0:?}")]
    DeadlineExceeded(Duration),

    #[error("{cause}; rollback also failed: {rollback}")]
    RollbackFailed {
        cause: Box<ImportError>,
        rollback: PersistenceError,
    },
}
