//! Upstream market data source seam
//!
//! The reconciler only ever talks to upstream through this trait, so tests
//! can script responses and the HTTP client stays swappable.

use super::error::SourceError;
use super::types::{Concentration, Currency, CurrencyId, PriceAndCap, RangeSpec};
use async_trait::async_trait;

#[async_trait]
pub trait MarketDataSource: Send + Sync {
    /// Resolve a slug to the upstream currency record
    ///
    /// `SourceError::NotFound` when upstream does not know the slug.
    async fn get_currency(&self, slug: &str) -> Result<Currency, SourceError>;

    /// Price / volume / cap points inside `range`, any order
    async fn get_price_and_cap(
        &self,
        currency_id: CurrencyId,
        range: RangeSpec,
    ) -> Result<Vec<PriceAndCap>, SourceError>;

    /// Daily holder concentration inside `range`, any order
    async fn get_concentration(
        &self,
        currency_id: CurrencyId,
        range: RangeSpec,
    ) -> Result<Vec<Concentration>, SourceError>;
}
