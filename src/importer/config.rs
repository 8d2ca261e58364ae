//! Collector configuration from environment variables

use std::env;
use std::time::Duration;

/// Configuration for the currency collector
///
/// Loaded from environment variables with sensible defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectorConfig {
    /// Master enable flag for the collector
    pub enabled: bool,

    /// Path to SQLite database file
    pub db_path: String,

    /// Currencies imported on every run, in addition to already tracked ones
    pub currency_slugs: Vec<String>,

    /// Time between runs
    pub interval: Duration,

    /// Upper bound of the random delay before the first run
    pub startup_jitter: Duration,

    /// Deadline for the transactional phase of one run
    pub run_timeout: Duration,

    /// How long a run waits for another run's watermark lock
    pub lock_timeout: Duration,

    /// Pause between consecutive upstream requests
    pub request_pause: Duration,

    pub cmc_base_url: String,
    pub cmc_cookie: Option<String>,
    pub http_timeout: Duration,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self::from_vars(|_| None)
    }
}

fn parse_or<T: std::str::FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|s| s.trim().parse().ok()).unwrap_or(default)
}

/// Split a comma-separated slug list, dropping blanks
fn parse_slugs(value: Option<String>) -> Vec<String> {
    value
        .map(|s| {
            s.split(',')
                .map(|slug| slug.trim().to_string())
                .filter(|slug| !slug.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

impl CollectorConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `COLLECTOR_ENABLED` (default: true)
    /// - `COLLECTOR_DB_PATH` (default: data/coinsync.db)
    /// - `COLLECTOR_CURRENCY_SLUGS` comma-separated (default: empty)
    /// - `COLLECTOR_INTERVAL_SECS` (default: 3600)
    /// - `COLLECTOR_STARTUP_JITTER_SECS` (default: 30)
    /// - `COLLECTOR_RUN_TIMEOUT_SECS` (default: 1800)
    /// - `COLLECTOR_LOCK_TIMEOUT_MS` (default: 30000)
    /// - `COLLECTOR_REQUEST_PAUSE_MS` (default: 1000)
    /// - `CMC_API_BASE_URL` (default: https://api.coinmarketcap.com)
    /// - `CMC_API_COOKIE` (optional)
    /// - `CMC_HTTP_TIMEOUT_SECS` (default: 10)
    pub fn from_env() -> Self {
        Self::from_vars(|key| env::var(key).ok())
    }

    /// Build a configuration from any key → value lookup
    pub fn from_vars<F>(var: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            enabled: parse_or(var("COLLECTOR_ENABLED"), true),

            db_path: var("COLLECTOR_DB_PATH").unwrap_or_else(|| "data/coinsync.db".to_string()),

            currency_slugs: parse_slugs(var("COLLECTOR_CURRENCY_SLUGS")),

            interval: Duration::from_secs(parse_or(var("COLLECTOR_INTERVAL_SECS"), 3_600)),

            startup_jitter: Duration::from_secs(parse_or(var("COLLECTOR_STARTUP_JITTER_SECS"), 30)),

            run_timeout: Duration::from_secs(parse_or(var("COLLECTOR_RUN_TIMEOUT_SECS"), 1_800)),

            lock_timeout: Duration::from_millis(parse_or(
                var("COLLECTOR_LOCK_TIMEOUT_MS"),
                30_000,
            )),

            request_pause: Duration::from_millis(parse_or(
                var("COLLECTOR_REQUEST_PAUSE_MS"),
                1_000,
            )),

            cmc_base_url: var("CMC_API_BASE_URL")
                .unwrap_or_else(|| "https://api.coinmarketcap.com".to_string()),

            cmc_cookie: var("CMC_API_COOKIE").filter(|c| !c.trim().is_empty()),

            http_timeout: Duration::from_secs(parse_or(var("CMC_HTTP_TIMEOUT_SECS"), 10)),
        }
    }
}
