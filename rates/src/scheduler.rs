//! Periodic rate refresh.
//!
//! One background task ticks on a fixed period after an initial delay. Each
//! tick runs a refresh cycle:
//!
//! ```text
//! Idle -> Fetching -> Committing -> Idle
//!                  \-> Failed
//! Failed -> Fetching  (next cycle)
//! ```
//!
//! A failed cycle writes nothing and never stops the loop; the next tick is
//! the retry. `Failed` stays visible until that retry starts. At most one cycle is in flight; ticks that arrive while one is
//! still running are skipped.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use ratekeeper_common::{now, Currency, HistoryEntry, RatePair, RateRecord, Timestamp};
use rust_decimal::Decimal;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use crate::error::FetchError;
use crate::fetcher::{fetch_with_timeout, RateFetcher};
use crate::metrics::RefreshMetrics;
use crate::store::RateStore;

/// Configuration for the refresh scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Asset to price.
    pub base: Currency,
    /// Quotes to fetch every cycle. History is written only when all arrive.
    pub quotes: Vec<Currency>,
    /// Period between cycles.
    pub interval: Duration,
    /// Delay before the first cycle.
    pub initial_delay: Duration,
    /// Upper bound on each fetch.
    pub fetch_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            base: Currency::btc(),
            quotes: vec![Currency::usd(), Currency::eur()],
            interval: Duration::from_secs(300),
            initial_delay: Duration::from_secs(10),
            fetch_timeout: Duration::from_secs(10),
        }
    }
}

impl SchedulerConfig {
    /// Validate configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.quotes.is_empty() {
            return Err("At least one quote currency is required".to_string());
        }
        if let Some(bad) = self.quotes.iter().find(|q| !q.is_three_letter_code()) {
            return Err(format!("Quote currency {bad} is not a three-letter code"));
        }
        if self.interval.is_zero() {
            return Err("Refresh interval cannot be 0".to_string());
        }
        if self.fetch_timeout.is_zero() {
            return Err("Fetch timeout cannot be 0".to_string());
        }
        Ok(())
    }
}

/// Where the current cycle is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshPhase {
    Idle,
    Fetching,
    Committing,
    /// The last cycle's fetch failed. Cleared when the next cycle starts.
    Failed,
}

/// Result of one refresh cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Every configured quote was stored and one history entry written.
    Committed { stored: usize },
    /// Some quotes were missing; what arrived was stored, history skipped.
    Partial {
        stored: usize,
        missing: Vec<Currency>,
    },
    /// The fetch failed; nothing was written.
    Failed(FetchError),
    /// Another cycle was still running.
    Skipped,
}

/// Drives the fetcher on a timer and writes results to the store.
pub struct RefreshScheduler {
    fetcher: Arc<dyn RateFetcher>,
    store: Arc<dyn RateStore>,
    config: SchedulerConfig,
    metrics: Arc<RefreshMetrics>,
    in_flight: AtomicBool,
    phase: RwLock<RefreshPhase>,
}

impl RefreshScheduler {
    /// Create a new scheduler.
    pub fn new(
        fetcher: Arc<dyn RateFetcher>,
        store: Arc<dyn RateStore>,
        config: SchedulerConfig,
        metrics: Arc<RefreshMetrics>,
    ) -> Self {
        Self {
            fetcher,
            store,
            config,
            metrics,
            in_flight: AtomicBool::new(false),
            phase: RwLock::new(RefreshPhase::Idle),
        }
    }

    /// Get the configuration.
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Get the current phase.
    pub fn phase(&self) -> RefreshPhase {
        *self.phase.read()
    }

    /// Check whether a cycle is running.
    pub fn is_cycle_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Get the shared metrics.
    pub fn metrics(&self) -> &Arc<RefreshMetrics> {
        &self.metrics
    }

    /// Run one refresh cycle now.
    ///
    /// Returns [`CycleOutcome::Skipped`] if a cycle is already in flight.
    #[instrument(skip(self), fields(base = %self.config.base))]
    pub async fn run_cycle(&self) -> CycleOutcome {
        self.metrics.cycle_started();
        let Some(_guard) = InFlightGuard::acquire(self) else {
            self.metrics.cycle_skipped();
            debug!("Refresh cycle already in flight");
            return CycleOutcome::Skipped;
        };

        info!("Refreshing rates from {}", self.fetcher.name());
        self.set_phase(RefreshPhase::Fetching);

        let fetched = fetch_with_timeout(
            self.fetcher.as_ref(),
            &self.config.base,
            &self.config.quotes,
            self.config.fetch_timeout,
        )
        .await;

        match fetched {
            Ok(rates) => {
                self.set_phase(RefreshPhase::Committing);
                self.commit(rates, now()).await
            }
            Err(e) => {
                self.set_phase(RefreshPhase::Failed);
                error!(reason = e.reason(), error = %e, "Rate refresh failed");
                self.metrics.cycle_failed(e.to_string());
                CycleOutcome::Failed(e)
            }
        }
    }

    /// Spawn the periodic loop.
    pub fn start(self: &Arc<Self>) -> RefreshHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let scheduler = Arc::clone(self);
        let task = tokio::spawn(async move { scheduler.run_loop(shutdown_rx).await });
        RefreshHandle { shutdown_tx, task }
    }

    async fn run_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            base = %self.config.base,
            quotes = ?self.config.quotes,
            interval_secs = self.config.interval.as_secs(),
            initial_delay_secs = self.config.initial_delay.as_secs(),
            "Refresh scheduler started"
        );

        tokio::select! {
            _ = tokio::time::sleep(self.config.initial_delay) => {}
            _ = shutdown.changed() => {
                info!("Refresh scheduler stopped before first cycle");
                return;
            }
        }

        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut current: Option<JoinHandle<CycleOutcome>> = None;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.is_cycle_in_flight() {
                        self.metrics.cycle_started();
                        self.metrics.cycle_skipped();
                        warn!("Previous refresh cycle still running, skipping tick");
                        continue;
                    }
                    let scheduler = Arc::clone(&self);
                    current = Some(tokio::spawn(async move { scheduler.run_cycle().await }));
                }
                _ = shutdown.changed() => break,
            }
        }

        // The in-flight cycle is bounded by the fetch timeout.
        if let Some(cycle) = current.take() {
            if let Err(e) = cycle.await {
                error!(error = %e, "Refresh cycle task failed");
            }
        }
        info!("Refresh scheduler stopped");
    }

    /// Store what was fetched. Store errors are logged, never propagated.
    async fn commit(&self, rates: HashMap<Currency, Decimal>, observed_at: Timestamp) -> CycleOutcome {
        let base = &self.config.base;
        let mut captured = BTreeMap::new();
        let mut stored = 0;

        for quote in &self.config.quotes {
            let Some(&rate) = rates.get(quote) else {
                continue;
            };
            let pair = RatePair::new(base.clone(), quote.clone());
            let record = match RateRecord::new(pair.clone(), rate, observed_at) {
                Ok(record) => record,
                Err(e) => {
                    warn!(pair = %pair, error = %e, "Discarding invalid rate");
                    continue;
                }
            };
            captured.insert(quote.clone(), rate);

            match self.store.upsert_latest(record).await {
                Ok(outcome) => {
                    if outcome.is_applied() {
                        stored += 1;
                    }
                    info!(pair = %pair, rate = %rate, ?outcome, "Updated rate");
                }
                Err(e) => {
                    self.metrics.store_error();
                    error!(pair = %pair, error = %e, "Failed to store rate");
                }
            }
        }

        let entry = HistoryEntry::new(base.clone(), captured, observed_at);
        if !entry.covers(&self.config.quotes) {
            let missing: Vec<Currency> = self
                .config
                .quotes
                .iter()
                .filter(|q| entry.rate(q).is_none())
                .cloned()
                .collect();
            warn!(
                missing = ?missing,
                stored,
                "Partial refresh, history entry not written"
            );
            let missing_codes: Vec<&str> = missing.iter().map(|c| c.code()).collect();
            self.metrics
                .cycle_partial(format!("missing quotes: {}", missing_codes.join(",")));
            return CycleOutcome::Partial { stored, missing };
        }

        match self.store.append_history(entry).await {
            Ok(()) => {
                self.metrics.history_appended();
                info!(recorded_at = %observed_at, "Saved rates to history");
            }
            Err(e) => {
                self.metrics.store_error();
                error!(error = %e, "Failed to append history");
            }
        }

        self.metrics.cycle_committed();
        info!(stored, "Rate refresh completed");
        CycleOutcome::Committed { stored }
    }

    fn set_phase(&self, phase: RefreshPhase) {
        *self.phase.write() = phase;
    }
}

/// Marks a cycle as in flight until dropped.
struct InFlightGuard<'a> {
    scheduler: &'a RefreshScheduler,
}

impl<'a> InFlightGuard<'a> {
    fn acquire(scheduler: &'a RefreshScheduler) -> Option<Self> {
        scheduler
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { scheduler })
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        {
            let mut phase = self.scheduler.phase.write();
            if *phase != RefreshPhase::Failed {
                *phase = RefreshPhase::Idle;
            }
        }
        self.scheduler.in_flight.store(false, Ordering::Release);
    }
}

/// Owned handle to the running refresh loop.
pub struct RefreshHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl RefreshHandle {
    /// Signal shutdown and wait for the loop and any in-flight cycle.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.task.await {
            error!(error = %e, "Refresh loop task failed");
        }
    }

    /// Check whether the loop has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::MockRateFetcher;
    use crate::store::MemoryRateStore;
    use chrono::Duration as ChronoDuration;
    use rust_decimal_macros::dec;

    struct Fixture {
        store: Arc<MemoryRateStore>,
        fetcher: Arc<MockRateFetcher>,
        metrics: Arc<RefreshMetrics>,
        scheduler: Arc<RefreshScheduler>,
    }

    fn fixture(config: SchedulerConfig) -> Fixture {
        let store = Arc::new(MemoryRateStore::new());
        let fetcher = Arc::new(MockRateFetcher::new());
        let metrics = Arc::new(RefreshMetrics::new());
        let scheduler = Arc::new(RefreshScheduler::new(
            fetcher.clone(),
            store.clone(),
            config,
            metrics.clone(),
        ));
        Fixture {
            store,
            fetcher,
            metrics,
            scheduler,
        }
    }

    fn test_config() -> SchedulerConfig {
        SchedulerConfig {
            interval: Duration::from_secs(60),
            initial_delay: Duration::from_secs(10),
            fetch_timeout: Duration::from_secs(120),
            ..Default::default()
        }
    }

    fn usd() -> RatePair {
        RatePair::new("BTC", "USD")
    }

    fn eur() -> RatePair {
        RatePair::new("BTC", "EUR")
    }

    #[test]
    fn test_config_validation() {
        assert!(SchedulerConfig::default().validate().is_ok());

        let no_quotes = SchedulerConfig {
            quotes: vec![],
            ..Default::default()
        };
        assert!(no_quotes.validate().is_err());

        let zero_interval = SchedulerConfig {
            interval: Duration::ZERO,
            ..Default::default()
        };
        assert!(zero_interval.validate().is_err());
    }

    #[tokio::test]
    async fn test_complete_cycle_updates_cache_and_history() {
        let f = fixture(test_config());
        f.fetcher.set_rate(usd(), dec!(50000));
        f.fetcher.set_rate(eur(), dec!(45000.123));

        let outcome = f.scheduler.run_cycle().await;

        assert_eq!(outcome, CycleOutcome::Committed { stored: 2 });
        assert_eq!(f.store.count_history().await.unwrap(), 1);

        let usd_record = f.store.get_latest(&usd()).await.unwrap().unwrap();
        let history = f.store.history_since(usd_record.observed_at).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].recorded_at, usd_record.observed_at);
        assert_eq!(history[0].rate(&Currency::eur()), Some(dec!(45000.123)));
        assert_eq!(f.scheduler.phase(), RefreshPhase::Idle);
        assert!(f.metrics.last_success_at().is_some());
    }

    #[tokio::test]
    async fn test_partial_cycle_upserts_obtained_and_skips_history() {
        let f = fixture(test_config());
        let earlier = now() - ChronoDuration::minutes(5);
        let old_eur = RateRecord::new(eur(), dec!(44000), earlier).unwrap();
        f.store.upsert_latest(old_eur.clone()).await.unwrap();
        f.fetcher.set_rate(usd(), dec!(50000));

        let outcome = f.scheduler.run_cycle().await;

        assert_eq!(
            outcome,
            CycleOutcome::Partial {
                stored: 1,
                missing: vec![Currency::eur()],
            }
        );
        assert_eq!(
            f.store.get_latest(&usd()).await.unwrap().unwrap().rate,
            dec!(50000)
        );
        assert_eq!(f.store.get_latest(&eur()).await.unwrap(), Some(old_eur));
        assert_eq!(f.store.count_history().await.unwrap(), 0);
        assert_eq!(f.metrics.snapshot().cycles_partial, 1);
    }

    #[tokio::test]
    async fn test_failed_cycle_preserves_cache() {
        let f = fixture(test_config());
        let existing = RateRecord::new(usd(), dec!(49000), now()).unwrap();
        f.store.upsert_latest(existing.clone()).await.unwrap();
        f.fetcher.fail_with(FetchError::Network("connection refused".into()));

        let outcome = f.scheduler.run_cycle().await;

        assert!(matches!(outcome, CycleOutcome::Failed(FetchError::Network(_))));
        assert_eq!(f.store.get_latest(&usd()).await.unwrap(), Some(existing));
        assert!(f.store.get_latest(&eur()).await.unwrap().is_none());
        assert_eq!(f.store.count_history().await.unwrap(), 0);
        assert_eq!(f.metrics.snapshot().consecutive_failures, 1);
        assert_eq!(f.scheduler.phase(), RefreshPhase::Failed);
        assert!(!f.scheduler.is_cycle_in_flight());

        // The next cycle is the retry.
        f.fetcher.clear_failure();
        f.fetcher.set_rate(usd(), dec!(50000));
        f.fetcher.set_rate(eur(), dec!(45000));
        assert_eq!(
            f.scheduler.run_cycle().await,
            CycleOutcome::Committed { stored: 2 }
        );
        assert_eq!(f.metrics.snapshot().consecutive_failures, 0);
        assert_eq!(f.scheduler.phase(), RefreshPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_phase_lasts_until_next_cycle() {
        let f = fixture(test_config());
        f.fetcher.fail_with(FetchError::Network("connection refused".into()));
        f.scheduler.run_cycle().await;
        assert_eq!(f.scheduler.phase(), RefreshPhase::Failed);

        // The retry clears it once it starts.
        f.fetcher.clear_failure();
        f.fetcher.set_rate(usd(), dec!(50000));
        f.fetcher.set_rate(eur(), dec!(45000));
        f.fetcher.set_latency(Duration::from_secs(5));
        let scheduler = f.scheduler.clone();
        let retry = tokio::spawn(async move { scheduler.run_cycle().await });
        tokio::task::yield_now().await;
        assert_eq!(f.scheduler.phase(), RefreshPhase::Fetching);

        assert_eq!(retry.await.unwrap(), CycleOutcome::Committed { stored: 2 });
        assert_eq!(f.scheduler.phase(), RefreshPhase::Idle);
    }

    #[tokio::test]
    async fn test_invalid_rate_counts_as_missing() {
        let f = fixture(test_config());
        f.fetcher.set_rate(usd(), dec!(50000));
        f.fetcher.set_rate(eur(), dec!(0));

        let outcome = f.scheduler.run_cycle().await;

        assert_eq!(
            outcome,
            CycleOutcome::Partial {
                stored: 1,
                missing: vec![Currency::eur()],
            }
        );
        assert!(f.store.get_latest(&eur()).await.unwrap().is_none());
        assert_eq!(f.store.count_history().await.unwrap(), 0);
        assert_eq!(f.scheduler.phase(), RefreshPhase::Idle);
    }

    #[tokio::test]
    async fn test_history_timestamps_do_not_decrease() {
        let f = fixture(test_config());
        f.fetcher.set_rate(usd(), dec!(50000));
        f.fetcher.set_rate(eur(), dec!(45000));

        f.scheduler.run_cycle().await;
        f.fetcher.set_rate(usd(), dec!(50100));
        f.scheduler.run_cycle().await;

        let history = f
            .store
            .history_since(now() - ChronoDuration::hours(1))
            .await
            .unwrap();
        assert_eq!(history.len(), 2);
        assert!(history[1].recorded_at >= history[0].recorded_at);
        assert_eq!(history[1].rate(&Currency::usd()), Some(dec!(50100)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_cycle_is_skipped() {
        let f = fixture(test_config());
        f.fetcher.set_rate(usd(), dec!(50000));
        f.fetcher.set_rate(eur(), dec!(45000));
        f.fetcher.set_latency(Duration::from_secs(5));

        let scheduler = f.scheduler.clone();
        let first = tokio::spawn(async move { scheduler.run_cycle().await });
        tokio::task::yield_now().await;

        assert!(f.scheduler.is_cycle_in_flight());
        assert_eq!(f.scheduler.phase(), RefreshPhase::Fetching);
        assert_eq!(f.scheduler.run_cycle().await, CycleOutcome::Skipped);

        assert_eq!(first.await.unwrap(), CycleOutcome::Committed { stored: 2 });
        assert_eq!(f.fetcher.calls(), 1);
        assert!(!f.scheduler.is_cycle_in_flight());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_a_failed_cycle() {
        let config = SchedulerConfig {
            fetch_timeout: Duration::from_secs(2),
            ..test_config()
        };
        let f = fixture(config);
        f.fetcher.set_rate(usd(), dec!(50000));
        f.fetcher.set_latency(Duration::from_secs(30));

        let outcome = f.scheduler.run_cycle().await;

        assert!(matches!(outcome, CycleOutcome::Failed(FetchError::Network(_))));
        assert!(f.store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_waits_initial_delay_then_ticks() {
        let f = fixture(test_config());
        f.fetcher.set_rate(usd(), dec!(50000));
        f.fetcher.set_rate(eur(), dec!(45000));

        let handle = f.scheduler.start();

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(f.fetcher.calls(), 0);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(f.fetcher.calls(), 1);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(f.fetcher.calls(), 2);
        assert_eq!(f.store.count_history().await.unwrap(), 2);

        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_survives_failures() {
        let f = fixture(test_config());
        f.fetcher.fail_with(FetchError::MalformedResponse("missing asset".into()));

        let handle = f.scheduler.start();
        tokio::time::sleep(Duration::from_secs(10 + 60 + 1)).await;

        assert_eq!(f.fetcher.calls(), 2);
        assert_eq!(f.metrics.snapshot().cycles_failed, 2);
        assert!(!handle.is_finished());

        f.fetcher.clear_failure();
        f.fetcher.set_rate(usd(), dec!(50000));
        f.fetcher.set_rate(eur(), dec!(45000));
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(f.store.count_history().await.unwrap(), 1);

        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_cycle_causes_tick_skip() {
        let f = fixture(test_config());
        f.fetcher.set_rate(usd(), dec!(50000));
        f.fetcher.set_rate(eur(), dec!(45000));
        f.fetcher.set_latency(Duration::from_secs(90));

        let handle = f.scheduler.start();
        tokio::time::sleep(Duration::from_secs(75)).await;

        assert_eq!(f.fetcher.calls(), 1);
        assert_eq!(f.metrics.snapshot().cycles_skipped, 1);

        handle.stop().await;
        assert_eq!(f.store.count_history().await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_before_first_cycle() {
        let f = fixture(test_config());
        let handle = f.scheduler.start();
        tokio::time::sleep(Duration::from_secs(1)).await;

        handle.stop().await;
        tokio::time::sleep(Duration::from_secs(120)).await;

        assert_eq!(f.fetcher.calls(), 0);
    }
}
