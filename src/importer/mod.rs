//! # Watermark-Driven Import Pipeline
//!
//! This module mirrors upstream market analytics into SQLite:
//! - Resolves requested currency slugs, creating unknown currencies
//! - Locks per-currency import watermarks for the duration of one pass
//! - Fetches only the ranges each dataset's staleness policy asks for
//! - Writes every dataset batch and the new watermarks in ONE transaction
//!
//! ## Architecture
//!
//! ```text
//! collector_task (timer)
//!     ↓
//! Reconciler::import(slugs)
//!     ├─ CurrencyBootstrap::resolve   (own short transactions)
//!     └─ ImportTx (single transaction)
//!         ├─ watermarks::lock_for_update
//!         ├─ DatasetImporter::fetch   (per currency, per dataset)
//!         ├─ DatasetBatch::upsert     (per dataset, bulk)
//!         ├─ watermarks::upsert_batch
//!         └─ commit / rollback
//! ```
//!
//! **Key Principle:** a watermark only moves together with the rows it
//! covers. Advancing it without the data would lose that range forever;
//! writing data without advancing it would re-fetch the range every pass.
//!
//! ## Schema Reference
//!
//! All tables are created from the embedded files in `/sql/`:
//! - `currencies` → [`Currency`]
//! - `import_watermark` → [`ImportWatermark`]
//! - `price_and_cap` → [`PriceAndCap`]
//! - `concentration` → [`Concentration`]
//!
//! ## Module Organization
//!
//! - `types` - Domain records and dataset/range vocabulary
//! - `error` - Source, persistence and import error taxonomy
//! - `db` - Connection, transactions, migrations, bulk upsert builder
//! - `currencies` / `watermarks` / `datasets` - Table access
//! - `source` / `cmc` - Upstream adapter trait and its HTTP implementation
//! - `importers` - Per-dataset range policies and fetch logic
//! - `bootstrap` - Slug resolution and currency creation
//! - `reconciler` - One atomic import pass
//! - `scheduler` - Periodic collector loop
//! - `config` - Environment configuration

pub mod bootstrap;
pub mod cmc;
pub mod config;
pub mod currencies;
pub mod datasets;
pub mod db;
pub mod error;
pub mod importers;
pub mod reconciler;
pub mod scheduler;
pub mod source;
pub mod types;
pub mod watermarks;

// Re-export commonly used types
pub use bootstrap::CurrencyBootstrap;
pub use cmc::CmcClient;
pub use config::CollectorConfig;
pub use datasets::{DatasetBatch, MismatchedBatch};
pub use db::{Database, ImportTx};
pub use error::{ImportError, PersistenceError, SourceError};
pub use importers::{
    default_importers, ConcentrationImporter, DatasetImporter, FetchedDataset,
    PriceAndCapImporter,
};
pub use reconciler::{ImportReport, Reconciler};
pub use source::MarketDataSource;
pub use types::{
    Concentration, Currency, CurrencyId, DatasetKind, ImportWatermark, PriceAndCap, RangeSpec,
};
