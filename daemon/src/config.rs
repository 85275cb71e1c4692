//! Daemon configuration.

use std::time::Duration;

use ratekeeper_common::{constants, Currency, DurationExt};
use ratekeeper_rates::{CoinGeckoConfig, CoinGeckoFetcher, RateCacheConfig, SchedulerConfig};

/// Main daemon configuration.
#[derive(Debug, Clone)]
pub struct RatekeeperConfig {
    /// Asset priced by the refresh loop.
    pub base_asset: String,
    /// Quote currencies fetched every cycle.
    pub quotes: Vec<String>,
    /// Period between refresh cycles.
    pub refresh_interval: Duration,
    /// Delay before the first refresh.
    pub initial_delay: Duration,
    /// Upper bound on each outbound fetch.
    pub fetch_timeout: Duration,
    /// Price source API root.
    pub source_url: String,
    /// Optional price source API key.
    pub api_key: Option<String>,
    /// Database URL. Without it rates live in memory.
    pub database_url: Option<String>,
    /// Maximum database connections.
    pub database_max_connections: u32,
    /// Period of the metrics log line.
    pub metrics_log_interval: Duration,
    /// Log level.
    pub log_level: String,
}

impl Default for RatekeeperConfig {
    fn default() -> Self {
        Self {
            base_asset: "BTC".to_string(),
            quotes: vec!["USD".to_string(), "EUR".to_string()],
            refresh_interval: constants::refresh_interval().as_std(),
            initial_delay: constants::initial_refresh_delay().as_std(),
            fetch_timeout: constants::fetch_timeout().as_std(),
            source_url: CoinGeckoConfig::default().base_url,
            api_key: None,
            database_url: None,
            database_max_connections: 5,
            metrics_log_interval: Duration::from_secs(60),
            log_level: "info".to_string(),
        }
    }
}

impl RatekeeperConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    ///
    /// Unparseable numbers keep their default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(base) = lookup("RATEKEEPER_BASE_ASSET") {
            config.base_asset = base.trim().to_uppercase();
        }

        if let Some(quotes) = lookup("RATEKEEPER_QUOTES") {
            config.quotes = quotes
                .split(',')
                .map(|q| q.trim().to_uppercase())
                .filter(|q| !q.is_empty())
                .collect();
        }

        if let Some(secs) = parse_secs(&lookup, "RATEKEEPER_REFRESH_SECS") {
            config.refresh_interval = secs;
        }

        if let Some(secs) = parse_secs(&lookup, "RATEKEEPER_INITIAL_DELAY_SECS") {
            config.initial_delay = secs;
        }

        if let Some(secs) = parse_secs(&lookup, "RATEKEEPER_FETCH_TIMEOUT_SECS") {
            config.fetch_timeout = secs;
        }

        if let Some(secs) = parse_secs(&lookup, "RATEKEEPER_METRICS_LOG_SECS") {
            config.metrics_log_interval = secs;
        }

        if let Some(url) = lookup("RATEKEEPER_SOURCE_URL") {
            config.source_url = url;
        }

        if let Some(key) = lookup("COINGECKO_API_KEY").filter(|k| !k.is_empty()) {
            config.api_key = Some(key);
        }

        if let Some(url) = lookup("DATABASE_URL").filter(|u| !u.is_empty()) {
            config.database_url = Some(url);
        }

        if let Some(max) = lookup("DATABASE_MAX_CONNECTIONS").and_then(|v| v.parse().ok()) {
            config.database_max_connections = max;
        }

        if let Some(level) = lookup("LOG_LEVEL") {
            config.log_level = level;
        }

        config
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), String> {
        let base = Currency::parse(&self.base_asset).map_err(|e| e.to_string())?;
        if CoinGeckoFetcher::asset_id(&base).is_none() {
            return Err(format!("Base asset {base} is not supported by the price source"));
        }

        if self.quotes.is_empty() {
            return Err("At least one quote currency is required".to_string());
        }
        for quote in &self.quotes {
            Currency::parse(quote).map_err(|e| e.to_string())?;
        }

        if self.refresh_interval.is_zero() {
            return Err("Refresh interval cannot be 0".to_string());
        }

        if self.fetch_timeout.is_zero() {
            return Err("Fetch timeout cannot be 0".to_string());
        }

        if self.source_url.is_empty() {
            return Err("Source URL cannot be empty".to_string());
        }

        if self.metrics_log_interval.is_zero() {
            return Err("Metrics log interval cannot be 0".to_string());
        }

        Ok(())
    }

    /// The base asset.
    pub fn base(&self) -> Currency {
        Currency::new(self.base_asset.as_str())
    }

    /// The quote currencies.
    pub fn quote_currencies(&self) -> Vec<Currency> {
        self.quotes.iter().map(|q| Currency::new(q.as_str())).collect()
    }

    /// Scheduler settings.
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            base: self.base(),
            quotes: self.quote_currencies(),
            interval: self.refresh_interval,
            initial_delay: self.initial_delay,
            fetch_timeout: self.fetch_timeout,
        }
    }

    /// Cache settings. The fallback warms every configured quote.
    pub fn cache_config(&self) -> RateCacheConfig {
        RateCacheConfig {
            common_quotes: self.quote_currencies(),
            fetch_timeout: self.fetch_timeout,
        }
    }

    /// Price source settings.
    pub fn source_config(&self) -> CoinGeckoConfig {
        CoinGeckoConfig {
            base_url: self.source_url.clone(),
            api_key: self.api_key.clone(),
            timeout: self.fetch_timeout,
        }
    }
}

fn parse_secs(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<Duration> {
    lookup(key)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}
