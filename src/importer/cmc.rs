//! CoinMarketCap data-api integration
//!
//! Implements [`MarketDataSource`] against the public CoinMarketCap web API:
//! - Currency detail (id, symbol, name) by slug
//! - Price / volume / market cap chart points
//! - Historical holder concentration
//!
//! ## API Reference
//!
//! Every endpoint wraps its payload in the same envelope:
//!
//! ```text
//! { "data": { ... }, "status": { "error_code": "0", "error_message": "SUCCESS" } }
//! ```
//!
//! - `GET /data-api/v3/cryptocurrency/detail?slug={slug}`
//! - `GET /data-api/v3/cryptocurrency/detail/chart?id={id}&range={ALL|1Y|1M}`
//! - `GET /data-api/v3/cryptocurrency/analytics?id={id}&range={ALL|1Y|1M}`
//!
//! A 404, a `null` data field or an empty point list is reported as
//! [`SourceError::NotFound`].

use super::config::CollectorConfig;
use super::error::SourceError;
use super::source::MarketDataSource;
use super::types::{from_unix, Concentration, Currency, CurrencyId, PriceAndCap, RangeSpec};
use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::header::{HeaderMap, HeaderValue, COOKIE};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

const DETAIL_PATH: &str = "/data-api/v3/cryptocurrency/detail";
const CHART_PATH: &str = "/data-api/v3/cryptocurrency/detail/chart";
const ANALYTICS_PATH: &str = "/data-api/v3/cryptocurrency/analytics";

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: Option<T>,
    #[serde(default)]
    status: Option<Status>,
}

#[derive(Debug, Deserialize)]
struct Status {
    #[serde(default)]
    error_code: String,
    #[serde(default)]
    error_message: String,
}

#[derive(Debug, Deserialize)]
struct CurrencyData {
    id: CurrencyId,
    symbol: String,
    slug: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct ChartData {
    points: Option<HashMap<String, ChartPoint>>,
}

#[derive(Debug, Deserialize)]
struct ChartPoint {
    #[serde(default)]
    v: Vec<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnalyticsData {
    historical_concentration: Option<HistoricalConcentration>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoricalConcentration {
    historical_concentration_details: Option<Vec<ConcentrationPoint>>,
}

#[derive(Debug, Deserialize)]
struct ConcentrationPoint {
    date: String,
    whales: f64,
    #[serde(default)]
    others: f64,
    retail: f64,
    investors: f64,
}

/// Unwrap the response envelope, mapping upstream status codes to errors
fn decode_envelope<T: DeserializeOwned>(uri: &str, body: &str) -> Result<T, SourceError> {
    let envelope: Envelope<T> = serde_json::from_str(body).map_err(|e| SourceError::Decode {
        uri: uri.to_string(),
        reason: e.to_string(),
    })?;

    if let Some(status) = envelope.status {
        if !status.error_code.is_empty() && status.error_code != "0" {
            return Err(SourceError::Api {
                code: status.error_code,
                message: status.error_message,
            });
        }
    }

    envelope.data.ok_or_else(|| SourceError::NotFound(uri.to_string()))
}

fn parse_currency(uri: &str, body: &str) -> Result<Currency, SourceError> {
    let data: CurrencyData = decode_envelope(uri, body)?;

    Ok(Currency {
        id: data.id,
        symbol: data.symbol,
        slug: data.slug.to_lowercase(),
        name: data.name,
        is_tracked: false,
    })
}

/// Chart points keyed by unix seconds; points with fewer than three values are skipped
fn parse_price_and_cap(
    uri: &str,
    body: &str,
    currency_id: CurrencyId,
) -> Result<Vec<PriceAndCap>, SourceError> {
    let data: ChartData = decode_envelope(uri, body)?;
    let points = data.points.unwrap_or_default();

    let mut result = Vec::with_capacity(points.len());
    for (ts, point) in points {
        if point.v.len() < 3 {
            continue;
        }

        let ts = ts
            .parse::<i64>()
            .ok()
            .and_then(from_unix)
            .ok_or_else(|| SourceError::Decode {
                uri: uri.to_string(),
                reason: format!("bad point timestamp '{}'", ts),
            })?;

        result.push(PriceAndCap {
            currency_id,
            price: point.v[0],
            daily_volume: point.v[1],
            cap: point.v[2],
            ts,
        });
    }

    if result.is_empty() {
        return Err(SourceError::NotFound(uri.to_string()));
    }

    result.sort_by_key(|p| p.ts);
    Ok(result)
}

fn parse_concentration(
    uri: &str,
    body: &str,
    currency_id: CurrencyId,
) -> Result<Vec<Concentration>, SourceError> {
    let data: AnalyticsData = decode_envelope(uri, body)?;
    let details = data
        .historical_concentration
        .and_then(|h| h.historical_concentration_details)
        .unwrap_or_default();

    if details.is_empty() {
        return Err(SourceError::NotFound(uri.to_string()));
    }

    details
        .into_iter()
        .map(|point| {
            let d = NaiveDate::parse_from_str(&point.date, "%Y-%m-%d").map_err(|e| {
                SourceError::Decode {
                    uri: uri.to_string(),
                    reason: format!("bad date '{}': {}", point.date, e),
                }
            })?;
            Ok(Concentration {
                currency_id,
                whales: point.whales,
                investors: point.investors,
                retail: point.retail,
                others: point.others,
                d,
            })
        })
        .collect()
}

/// HTTP client for the CoinMarketCap data-api
pub struct CmcClient {
    client: reqwest::Client,
    base_url: String,
}

impl CmcClient {
    pub fn new(
        base_url: &str,
        cookie: Option<&str>,
        timeout: Duration,
    ) -> Result<Self, SourceError> {
        let mut headers = HeaderMap::new();
        if let Some(cookie) = cookie {
            let value = HeaderValue::from_str(cookie).map_err(|e| SourceError::Decode {
                uri: base_url.to_string(),
                reason: format!("invalid cookie header: {}", e),
            })?;
            headers.insert(COOKIE, value);
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn from_config(config: &CollectorConfig) -> Result<Self, SourceError> {
        Self::new(
            &config.cmc_base_url,
            config.cmc_cookie.as_deref(),
            config.http_timeout,
        )
    }

    /// GET `path` and return (uri, body) for a 2xx response
    async fn get(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<(String, String), SourceError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self.client.get(&url).query(query).send().await?;
        let uri = response.url().to_string();
        let status = response.status();

        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(SourceError::NotFound(uri));
        }
        if !status.is_success() {
            return Err(SourceError::Status {
                status: status.as_u16(),
                uri,
            });
        }

        let body = response.text().await?;
        log::debug!("🌐 GET {} → {} bytes", uri, body.len());
        Ok((uri, body))
    }
}

#[async_trait]
impl MarketDataSource for CmcClient {
    async fn get_currency(&self, slug: &str) -> Result<Currency, SourceError> {
        let (uri, body) = self.get(DETAIL_PATH, &[("slug", slug.to_string())]).await?;
        parse_currency(&uri, &body)
    }

    async fn get_price_and_cap(
        &self,
        currency_id: CurrencyId,
        range: RangeSpec,
    ) -> Result<Vec<PriceAndCap>, SourceError> {
        let query = [("id", currency_id.to_string()), ("range", range.as_param().to_string())];
        let (uri, body) = self.get(CHART_PATH, &query).await?;
        parse_price_and_cap(&uri, &body, currency_id)
    }

    async fn get_concentration(
        &self,
        currency_id: CurrencyId,
        range: RangeSpec,
    ) -> Result<Vec<Concentration>, SourceError> {
        let query = [("id", currency_id.to_string()), ("range", range.as_param().to_string())];
        let (uri, body) = self.get(ANALYTICS_PATH, &query).await?;
        parse_concentration(&uri, &body, currency_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const URI: &str = "https://api.example/test";

    #[test]
    fn test_parse_currency() {
        let body = r#"{
            "data": {"id": 1, "symbol": "BTC", "slug": "Bitcoin", "name": "Bitcoin", "statistics": {}},
            "status": {"timestamp": "2024-01-01T00:00:00Z", "error_code": "0", "error_message": "SUCCESS"}
        }"#;

        let currency = parse_currency(URI, body).unwrap();
        assert_eq!(currency.id, 1);
        assert_eq!(currency.symbol, "BTC");
        assert_eq!(currency.slug, "bitcoin");
        assert!(!currency.is_tracked);
    }

    #[test]
    fn test_api_error_code() {
        let body = r#"{"data": null, "status": {"error_code": "500", "error_message": "Internal"}}"#;

        match parse_currency(URI, body) {
            Err(SourceError::Api { code, message }) => {
                assert_eq!(code, "500");
                assert_eq!(message, "Internal");
            }
            other => panic!("expected api error, got {:?}", other),
        }
    }

    #[test]
    fn test_null_data_is_not_found() {
        let body = r#"{"data": null, "status": {"error_code": "0", "error_message": "SUCCESS"}}"#;
        assert!(parse_currency(URI, body).unwrap_err().is_not_found());
    }

    #[test]
    fn test_malformed_body_is_decode_error() {
        match parse_currency(URI, "<html>rate limited</html>") {
            Err(SourceError::Decode { uri, .. }) => assert_eq!(uri, URI),
            other => panic!("expected decode error, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_chart_points() {
        let body = r#"{
            "data": {
                "points": {
                    "1704153600": {"v": [43000.5, 21000000.0, 840000000000.0], "c": [1.0]},
                    "1704067200": {"v": [42000.0, 20000000.0, 820000000000.0]},
                    "1704240000": {"v": [44000.0]}
                }
            },
            "status": {"error_code": "0", "error_message": "SUCCESS"}
        }"#;

        let points = parse_price_and_cap(URI, body, 1).unwrap();

        // Short point skipped, remaining sorted by time
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].ts.timestamp(), 1_704_067_200);
        assert_eq!(points[0].price, 42000.0);
        assert_eq!(points[1].daily_volume, 21000000.0);
        assert_eq!(points[1].cap, 840000000000.0);
        assert!(points.iter().all(|p| p.currency_id == 1));
    }

    #[test]
    fn test_empty_chart_is_not_found() {
        let body = r#"{"data": {"points": {}}, "status": {"error_code": "0"}}"#;
        assert!(parse_price_and_cap(URI, body, 1).unwrap_err().is_not_found());
    }

    #[test]
    fn test_parse_concentration() {
        let body = r#"{
            "data": {
                "addressesByHoldings": null,
                "historicalConcentration": {
                    "historicalConcentrationDetails": [
                        {"date": "2024-03-01", "whales": 40.1, "others": 5.0, "retail": 10.2, "investors": 44.7},
                        {"date": "2024-03-02", "whales": 40.3, "others": 5.1, "retail": 10.0, "investors": 44.6}
                    ],
                    "historicalConcentrationAgg": {"whalesPercent": 40.3}
                }
            },
            "status": {"error_code": "0", "error_message": "SUCCESS"}
        }"#;

        let rows = parse_concentration(URI, body, 1027).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].d, NaiveDate::from_ymd_opt(2024, 3, 1).unwrap());
        assert_eq!(rows[0].investors, 44.7);
        assert_eq!(rows[1].others, 5.1);
        assert_eq!(rows[1].currency_id, 1027);
    }

    #[test]
    fn test_missing_concentration_is_not_found() {
        let body = r#"{"data": {"historicalConcentration": null}, "status": {"error_code": "0"}}"#;
        assert!(parse_concentration(URI, body, 1).unwrap_err().is_not_found());
    }

    #[test]
    fn test_bad_concentration_date() {
        let body = r#"{"data": {"historicalConcentration": {"historicalConcentrationDetails": [
            {"date": "03/01/2024", "whales": 1.0, "retail": 1.0, "investors": 1.0}
        ]}}}"#;
        assert!(matches!(
            parse_concentration(URI, body, 1),
            Err(SourceError::Decode { .. })
        ));
    }

    #[tokio::test]
    #[ignore] // Run only when testing with live API
    async fn test_live_bitcoin_detail() {
        let client =
            CmcClient::new("https://api.coinmarketcap.com", None, Duration::from_secs(10)).unwrap();

        let currency = client.get_currency("bitcoin").await.unwrap();
        assert_eq!(currency.id, 1);

        let points = client.get_price_and_cap(currency.id, RangeSpec::OneMonth).await.unwrap();
        assert!(!points.is_empty());
    }
}
