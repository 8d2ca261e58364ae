//! Slug resolution and currency creation
//!
//! Runs before the import transaction and never shares it: each unknown
//! currency is created (with its empty watermark) in its own short
//! transaction, so a later failure in the pass does not undo creation.

use super::currencies;
use super::db::Database;
use super::error::{ImportError, PersistenceError};
use super::source::MarketDataSource;
use super::types::Currency;
use super::watermarks;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Trim, lower-case, drop blanks and duplicates; first occurrence keeps its place
pub fn normalize_slugs<S: AsRef<str>>(slugs: &[S]) -> Vec<String> {
    let mut seen = HashSet::new();
    slugs
        .iter()
        .map(|s| s.as_ref().trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .filter(|s| seen.insert(s.clone()))
        .collect()
}

#[derive(Clone)]
pub struct CurrencyBootstrap {
    db: Database,
    source: Arc<dyn MarketDataSource>,
}

/// Resolved currencies plus how many of them were created just now
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved {
    pub currencies: Vec<Currency>,
    pub created: usize,
}

impl CurrencyBootstrap {
    pub fn new(db: Database, source: Arc<dyn MarketDataSource>) -> Self {
        Self { db, source }
    }

    /// Every requested currency, tracked and with a watermark row, in input order
    ///
    /// Slugs that name the same currency id resolve to one entry, the first.
    pub async fn resolve<S: AsRef<str>>(&self, slugs: &[S]) -> Result<Resolved, ImportError> {
        let slugs = normalize_slugs(slugs);
        if slugs.is_empty() {
            return Ok(Resolved {
                currencies: Vec::new(),
                created: 0,
            });
        }

        let existing = self.ensure_existing_tracked(&slugs).await?;
        let mut by_slug: HashMap<String, Currency> = existing
            .into_iter()
            .map(|c| (c.slug.clone(), c))
            .collect();

        let mut created = 0;
        for slug in &slugs {
            if by_slug.contains_key(slug) {
                continue;
            }

            let (currency, is_new) = self.create_from_upstream(slug).await?;
            if is_new {
                created += 1;
            }
            by_slug.insert(slug.clone(), currency);
        }

        let mut seen_ids = HashSet::new();
        let currencies = slugs
            .iter()
            .filter_map(|slug| by_slug.remove(slug))
            .filter(|c| seen_ids.insert(c.id))
            .collect::<Vec<_>>();

        if created > 0 {
            log::info!(
                "🆕 Bootstrapped {} new currencies ({} resolved)",
                created,
                currencies.len()
            );
        }

        Ok(Resolved { currencies, created })
    }

    /// Slugs of every tracked currency, ordered by id
    pub async fn tracked_slugs(&self) -> Result<Vec<String>, PersistenceError> {
        let tracked = self.db.with_conn(currencies::get_tracked).await?;
        Ok(tracked.into_iter().map(|c| c.slug).collect())
    }

    /// Look up known slugs; mark untracked ones tracked with a watermark row
    ///
    /// The lookup needs no lock. The write lock is taken only when something
    /// is left to mark, and both writes are no-ops if another pass got there
    /// first.
    async fn ensure_existing_tracked(
        &self,
        slugs: &[String],
    ) -> Result<Vec<Currency>, ImportError> {
        let mut existing = self
            .db
            .with_conn(|conn| currencies::get_by_slugs(conn, slugs))
            .await?;

        let untracked: Vec<_> = existing.iter().filter(|c| !c.is_tracked).map(|c| c.id).collect();
        if !untracked.is_empty() {
            let mut tx = self.db.begin().await?;
            currencies::mark_tracked(tx.conn(), &untracked)?;
            for id in &untracked {
                watermarks::seed(tx.conn(), *id)?;
            }
            tx.commit()?;
            log::info!("📌 Tracking {} existing currencies", untracked.len());
        }

        for currency in &mut existing {
            currency.is_tracked = true;
        }
        Ok(existing)
    }

    /// Fetch an unknown slug upstream; store it tracked with its empty watermark
    ///
    /// When upstream maps the slug to an id that is already stored (under
    /// another slug), the stored row is tracked and returned instead, and the
    /// flag is `false`.
    async fn create_from_upstream(&self, slug: &str) -> Result<(Currency, bool), ImportError> {
        let mut fetched = self
            .source
            .get_currency(slug)
            .await
            .map_err(|source| ImportError::Bootstrap {
                slug: slug.to_string(),
                source,
            })?;
        fetched.is_tracked = true;
        // Stored under the requested slug so later lookups by it hit
        fetched.slug = slug.to_string();

        let mut tx = self.db.begin().await?;
        let (currency, is_new) = match currencies::get_by_id(tx.conn(), fetched.id)? {
            Some(mut stored) => {
                currencies::mark_tracked(tx.conn(), &[stored.id])?;
                stored.is_tracked = true;
                (stored, false)
            }
            None => {
                currencies::create(tx.conn(), &fetched)?;
                (fetched, true)
            }
        };
        watermarks::seed(tx.conn(), currency.id)?;
        tx.commit()?;

        if is_new {
            log::debug!("   ├─ Created {} ({}) id={}", currency.slug, currency.symbol, currency.id);
        } else {
            log::warn!(
                "⚠️  Slug '{}' resolves to id={}, already stored as '{}'",
                slug,
                currency.id,
                currency.slug
            );
        }
        Ok((currency, is_new))
    }
}
