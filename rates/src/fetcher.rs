//! Price source access.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use ratekeeper_common::Currency;
use reqwest::header::{ACCEPT, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::error::{FetchError, FetchResult};

/// Trait for external price sources.
#[async_trait]
pub trait RateFetcher: Send + Sync {
    /// Get the source name.
    fn name(&self) -> &str;

    /// Fetch the rate of `base` in each of `quotes`.
    ///
    /// Quotes the source does not report are absent from the map; callers
    /// must read a missing key as "not obtained", never as zero.
    async fn fetch(
        &self,
        base: &Currency,
        quotes: &[Currency],
    ) -> FetchResult<HashMap<Currency, Decimal>>;
}

/// Check the shape of a fetch request before going to the network.
pub fn validate_request(base: &Currency, quotes: &[Currency]) -> FetchResult<()> {
    if base.code().is_empty() {
        return Err(FetchError::InvalidRequest("base asset is empty".to_string()));
    }
    if quotes.is_empty() {
        return Err(FetchError::InvalidRequest(
            "at least one quote currency is required".to_string(),
        ));
    }
    if let Some(bad) = quotes.iter().find(|q| !q.is_three_letter_code()) {
        return Err(FetchError::InvalidRequest(format!(
            "quote currency {bad:?} is not a three-letter code"
        )));
    }
    Ok(())
}

/// Run a fetch with an upper bound on its duration.
///
/// An elapsed timeout is reported as [`FetchError::Network`].
pub async fn fetch_with_timeout(
    fetcher: &dyn RateFetcher,
    base: &Currency,
    quotes: &[Currency],
    timeout: Duration,
) -> FetchResult<HashMap<Currency, Decimal>> {
    match tokio::time::timeout(timeout, fetcher.fetch(base, quotes)).await {
        Ok(result) => result,
        Err(_) => Err(FetchError::Network(format!(
            "{} did not answer within {:?}",
            fetcher.name(),
            timeout
        ))),
    }
}

/// Configuration for the CoinGecko price source.
#[derive(Debug, Clone)]
pub struct CoinGeckoConfig {
    /// API root, without the `/simple/price` suffix.
    pub base_url: String,
    /// Optional demo API key.
    pub api_key: Option<String>,
    /// Per-request timeout enforced by the HTTP client.
    pub timeout: Duration,
}

impl Default for CoinGeckoConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.coingecko.com/api/v3".to_string(),
            api_key: None,
            timeout: Duration::from_secs(10),
        }
    }
}

/// CoinGecko-backed price source using `/simple/price`.
pub struct CoinGeckoFetcher {
    client: Client,
    config: CoinGeckoConfig,
}

impl CoinGeckoFetcher {
    /// Create a new fetcher.
    pub fn new(config: CoinGeckoConfig) -> FetchResult<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| FetchError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    /// Map an asset symbol to CoinGecko's asset id.
    pub fn asset_id(asset: &Currency) -> Option<&'static str> {
        match asset.code() {
            "BTC" => Some("bitcoin"),
            "ETH" => Some("ethereum"),
            "LTC" => Some("litecoin"),
            "XMR" => Some("monero"),
            "SOL" => Some("solana"),
            _ => None,
        }
    }

    fn price_url(&self) -> String {
        format!("{}/simple/price", self.config.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl RateFetcher for CoinGeckoFetcher {
    fn name(&self) -> &str {
        "coingecko"
    }

    #[instrument(skip(self, quotes), fields(base = %base, quotes = quotes.len()))]
    async fn fetch(
        &self,
        base: &Currency,
        quotes: &[Currency],
    ) -> FetchResult<HashMap<Currency, Decimal>> {
        validate_request(base, quotes)?;
        let asset_id = Self::asset_id(base)
            .ok_or_else(|| FetchError::InvalidRequest(format!("unknown asset {base}")))?;

        let vs_currencies = quotes
            .iter()
            .map(|q| q.code().to_lowercase())
            .collect::<Vec<_>>()
            .join(",");

        let mut request = self
            .client
            .get(self.price_url())
            .query(&[("ids", asset_id), ("vs_currencies", vs_currencies.as_str())])
            .header(ACCEPT, "application/json");
        if let Some(key) = &self.config.api_key {
            request = request.header("x-cg-demo-api-key", key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse().ok());
            return Err(FetchError::RateLimited { retry_after_secs });
        }
        if !status.is_success() {
            return Err(FetchError::Network(format!(
                "price source returned status {status}"
            )));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| FetchError::Network(format!("failed to read body: {e}")))?;

        parse_price_response(&body, asset_id, quotes)
    }
}

/// Parse a `/simple/price` body such as `{"bitcoin": {"usd": 50000.0, "eur": 45000.1}}`.
pub fn parse_price_response(
    body: &[u8],
    asset_id: &str,
    quotes: &[Currency],
) -> FetchResult<HashMap<Currency, Decimal>> {
    let parsed: HashMap<String, HashMap<String, Value>> = serde_json::from_slice(body)
        .map_err(|e| FetchError::MalformedResponse(format!("invalid JSON: {e}")))?;

    let prices = parsed.get(asset_id).ok_or_else(|| {
        FetchError::MalformedResponse(format!("missing asset key {asset_id:?}"))
    })?;

    let mut rates = HashMap::with_capacity(quotes.len());
    for quote in quotes {
        let key = quote.code().to_lowercase();
        match prices.get(&key) {
            None => debug!(quote = %quote, "Quote not reported by price source"),
            Some(value) => match decimal_from_json(value) {
                Some(rate) if rate > Decimal::ZERO => {
                    rates.insert(quote.clone(), rate);
                }
                _ => warn!(quote = %quote, value = %value, "Discarding unusable rate"),
            },
        }
    }

    Ok(rates)
}

fn decimal_from_json(value: &Value) -> Option<Decimal> {
    let Value::Number(number) = value else {
        return None;
    };
    let text = number.to_string();
    Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .ok()
}

/// Scripted price source for tests.
#[cfg(any(test, feature = "test-utils"))]
pub struct MockRateFetcher {
    rates: dashmap::DashMap<ratekeeper_common::RatePair, Decimal>,
    failure: parking_lot::Mutex<Option<FetchError>>,
    latency: parking_lot::Mutex<Option<Duration>>,
    calls: std::sync::atomic::AtomicUsize,
}

#[cfg(any(test, feature = "test-utils"))]
impl MockRateFetcher {
    /// Create a mock that reports nothing.
    pub fn new() -> Self {
        Self {
            rates: dashmap::DashMap::new(),
            failure: parking_lot::Mutex::new(None),
            latency: parking_lot::Mutex::new(None),
            calls: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    /// Report `rate` for `pair` from now on.
    pub fn set_rate(&self, pair: ratekeeper_common::RatePair, rate: Decimal) {
        self.rates.insert(pair, rate);
    }

    /// Stop reporting `pair`.
    pub fn remove_rate(&self, pair: &ratekeeper_common::RatePair) {
        self.rates.remove(pair);
    }

    /// Fail every fetch with `error` until cleared.
    pub fn fail_with(&self, error: FetchError) {
        *self.failure.lock() = Some(error);
    }

    /// Stop failing.
    pub fn clear_failure(&self) {
        *self.failure.lock() = None;
    }

    /// Delay every fetch by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = Some(latency);
    }

    /// Number of fetch calls so far.
    pub fn calls(&self) -> usize {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(any(test, feature = "test-utils"))]
impl Default for MockRateFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(any(test, feature = "test-utils"))]
#[async_trait]
impl RateFetcher for MockRateFetcher {
    fn name(&self) -> &str {
        "mock"
    }

    async fn fetch(
        &self,
        base: &Currency,
        quotes: &[Currency],
    ) -> FetchResult<HashMap<Currency, Decimal>> {
        self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);

        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let failure = self.failure.lock().clone();
        if let Some(error) = failure {
            return Err(error);
        }

        validate_request(base, quotes)?;

        Ok(quotes
            .iter()
            .filter_map(|quote| {
                let pair = ratekeeper_common::RatePair::new(base.clone(), quote.clone());
                self.rates.get(&pair).map(|rate| (quote.clone(), *rate))
            })
            .collect())
    }
}
