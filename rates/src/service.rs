//! Read and conversion entry points for an outer API layer.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Duration;
use ratekeeper_common::{cutoff_for, Currency, HistoryEntry, RatePair, RateRecord, Timestamp};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{info, instrument};

use crate::conversion::{Conversion, ConversionEngine};
use crate::error::{RateError, RateResult};
use crate::metrics::{MetricsSnapshot, RefreshMetrics};
use crate::scheduler::{CycleOutcome, RefreshScheduler};
use crate::store::RateStore;

/// Failed cycles in a row before health reports degraded.
const DEGRADED_AFTER_FAILURES: u64 = 3;

/// Latest rate of the base asset in every configured quote.
#[derive(Debug, Clone, Serialize)]
pub struct LatestRates {
    pub base: Currency,
    pub rates: BTreeMap<Currency, RateRecord>,
}

/// Overall service health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// No refresh has completed yet.
    Starting,
    /// Refreshes are succeeding.
    Healthy,
    /// Recent refreshes keep failing; served rates are getting old.
    Degraded,
}

/// Health report including the last successful refresh time.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub version: &'static str,
    pub last_successful_refresh: Option<Timestamp>,
    pub consecutive_failures: u64,
}

/// The core's inbound interface.
pub struct RateService {
    store: Arc<dyn RateStore>,
    engine: Arc<ConversionEngine>,
    scheduler: Arc<RefreshScheduler>,
    metrics: Arc<RefreshMetrics>,
}

impl RateService {
    /// Create a new service.
    pub fn new(
        store: Arc<dyn RateStore>,
        engine: Arc<ConversionEngine>,
        scheduler: Arc<RefreshScheduler>,
    ) -> Self {
        let metrics = scheduler.metrics().clone();
        Self {
            store,
            engine,
            scheduler,
            metrics,
        }
    }

    fn base(&self) -> &Currency {
        &self.scheduler.config().base
    }

    fn quotes(&self) -> &[Currency] {
        &self.scheduler.config().quotes
    }

    /// Stored rate for a pair, without falling back to the price source.
    pub async fn latest_rate(&self, pair: &RatePair) -> RateResult<RateRecord> {
        self.store
            .get_latest(pair)
            .await?
            .ok_or_else(|| RateError::NotFound(pair.clone()))
    }

    /// Stored rates for every configured quote, read in one store pass.
    ///
    /// Fails with `NotFound` on the first configured quote without a rate.
    pub async fn latest_rates(&self) -> RateResult<LatestRates> {
        let mut stored: BTreeMap<Currency, RateRecord> = self
            .store
            .latest_pairs()
            .await?
            .into_iter()
            .filter(|record| &record.pair.base == self.base())
            .map(|record| (record.pair.quote.clone(), record))
            .collect();

        let mut rates = BTreeMap::new();
        for quote in self.quotes() {
            let record = stored.remove(quote).ok_or_else(|| {
                RateError::NotFound(RatePair::new(self.base().clone(), quote.clone()))
            })?;
            rates.insert(quote.clone(), record);
        }
        Ok(LatestRates {
            base: self.base().clone(),
            rates,
        })
    }

    /// Convert `amount` of the base asset into `quote`.
    pub async fn convert(&self, amount: Decimal, quote: &Currency) -> RateResult<Conversion> {
        self.engine.convert(amount, quote).await
    }

    /// Convert `amount` into every configured quote.
    pub async fn convert_all(&self, amount: Decimal) -> RateResult<Vec<Conversion>> {
        self.engine.convert_all(amount).await
    }

    /// History entries within the last `window`, oldest first.
    #[instrument(skip(self))]
    pub async fn history_since(&self, window: Duration) -> RateResult<Vec<HistoryEntry>> {
        let entries = self.store.history_since(cutoff_for(window)).await?;
        info!(
            count = entries.len(),
            window_hours = window.num_hours(),
            "Retrieved rate history"
        );
        Ok(entries)
    }

    /// Total number of history entries.
    pub async fn history_count(&self) -> RateResult<u64> {
        Ok(self.store.count_history().await?)
    }

    /// The base asset followed by the configured quotes.
    pub fn supported_currencies(&self) -> Vec<Currency> {
        std::iter::once(self.base().clone())
            .chain(self.quotes().iter().cloned())
            .collect()
    }

    /// Trigger a refresh cycle outside the schedule.
    pub async fn refresh_now(&self) -> CycleOutcome {
        self.scheduler.run_cycle().await
    }

    /// Refresh metrics snapshot.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Current health.
    pub fn health(&self) -> HealthReport {
        let snapshot = self.metrics.snapshot();
        let status = if snapshot.consecutive_failures >= DEGRADED_AFTER_FAILURES {
            HealthStatus::Degraded
        } else if snapshot.last_success_at.is_none() {
            HealthStatus::Starting
        } else {
            HealthStatus::Healthy
        };

        HealthReport {
            status,
            version: env!("CARGO_PKG_VERSION"),
            last_successful_refresh: snapshot.last_success_at,
            consecutive_failures: snapshot.consecutive_failures,
        }
    }
}
