//! Read-through latest-rate cache with a single fetch-on-miss fallback.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ratekeeper_common::{now, Currency, RatePair, RateRecord};
use tracing::{debug, info, instrument, warn};

use crate::error::{RateError, RateResult};
use crate::fetcher::{fetch_with_timeout, RateFetcher};
use crate::store::RateStore;

/// Configuration for the rate cache.
#[derive(Debug, Clone)]
pub struct RateCacheConfig {
    /// Quotes fetched together on a miss, so one call warms the common pairs.
    pub common_quotes: Vec<Currency>,
    /// Upper bound on the fallback fetch.
    pub fetch_timeout: Duration,
}

impl Default for RateCacheConfig {
    fn default() -> Self {
        Self {
            common_quotes: vec![Currency::usd(), Currency::eur()],
            fetch_timeout: Duration::from_secs(10),
        }
    }
}

/// Latest-rate view over a [`RateStore`].
pub struct RateCache {
    store: Arc<dyn RateStore>,
    fetcher: Arc<dyn RateFetcher>,
    config: RateCacheConfig,
    hits: AtomicU64,
    misses: AtomicU64,
    fallback_failures: AtomicU64,
}

impl RateCache {
    /// Create a new cache.
    pub fn new(
        store: Arc<dyn RateStore>,
        fetcher: Arc<dyn RateFetcher>,
        config: RateCacheConfig,
    ) -> Self {
        Self {
            store,
            fetcher,
            config,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            fallback_failures: AtomicU64::new(0),
        }
    }

    /// Get the latest rate for a pair.
    ///
    /// A stored record is returned without touching the network. On a miss the
    /// price source is asked once; if the pair is still missing afterwards the
    /// result is [`RateError::Unavailable`].
    #[instrument(skip(self), fields(pair = %pair))]
    pub async fn get(&self, pair: &RatePair) -> RateResult<RateRecord> {
        if let Some(record) = self.store.get_latest(pair).await? {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!("Cache hit");
            return Ok(record);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        warn!("No cached rate, fetching from price source");
        self.fill_from_source(pair).await?;

        match self.store.get_latest(pair).await? {
            Some(record) => Ok(record),
            None => {
                self.fallback_failures.fetch_add(1, Ordering::Relaxed);
                Err(RateError::Unavailable(pair.clone()))
            }
        }
    }

    /// Get cache statistics.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            fallback_failures: self.fallback_failures.load(Ordering::Relaxed),
        }
    }

    /// Quotes requested on a miss for `pair`.
    fn quotes_for(&self, pair: &RatePair) -> Vec<Currency> {
        let mut quotes: BTreeSet<Currency> = self.config.common_quotes.iter().cloned().collect();
        quotes.insert(pair.quote.clone());
        quotes.into_iter().collect()
    }

    /// One fetch for the pair's base; store whatever came back.
    ///
    /// Fetch errors are logged and swallowed: the caller re-reads the store
    /// and reports `Unavailable`. Store errors propagate.
    async fn fill_from_source(&self, pair: &RatePair) -> RateResult<()> {
        let quotes = self.quotes_for(pair);
        let rates = match fetch_with_timeout(
            self.fetcher.as_ref(),
            &pair.base,
            &quotes,
            self.config.fetch_timeout,
        )
        .await
        {
            Ok(rates) => rates,
            Err(e) => {
                warn!(
                    source = self.fetcher.name(),
                    reason = e.reason(),
                    error = %e,
                    "Fallback fetch failed"
                );
                return Ok(());
            }
        };

        let observed_at = now();
        for (quote, rate) in rates {
            let fetched_pair = RatePair::new(pair.base.clone(), quote);
            match RateRecord::new(fetched_pair.clone(), rate, observed_at) {
                Ok(record) => {
                    let outcome = self.store.upsert_latest(record).await?;
                    info!(pair = %fetched_pair, rate = %rate, ?outcome, "Stored fetched rate");
                }
                Err(e) => warn!(pair = %fetched_pair, error = %e, "Skipping invalid fetched rate"),
            }
        }

        Ok(())
    }
}

/// Cache statistics.
///
/// Every miss triggers exactly one fallback fetch, so `misses` also counts
/// fetch attempts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub fallback_failures: u64,
}

/// Shared rate cache.
pub type SharedRateCache = Arc<RateCache>;
