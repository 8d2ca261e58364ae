//! coinsync - incremental mirror of currency market analytics
//!
//! Imports price/market-cap history and holder concentration history for a
//! set of tracked currencies into a local SQLite store. Every pass is driven
//! by per-currency watermarks so already imported ranges are not re-fetched.
//!
//! See [`importer`] for the reconciler and its collaborators.

pub mod importer;
