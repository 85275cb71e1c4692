//! Daemon wiring and lifecycle.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{info, instrument};

use ratekeeper_rates::{
    CoinGeckoFetcher, ConversionEngine, MemoryRateStore, RateCache, RateFetcher, RateService,
    RateStore, RefreshHandle, RefreshMetrics, RefreshScheduler,
};

use crate::config::RatekeeperConfig;
use crate::error::{DaemonError, Result};
use crate::state::DaemonState;

/// Owns the rate core and its background refresh loop.
pub struct Daemon {
    config: RatekeeperConfig,
    state: Arc<RwLock<DaemonState>>,
    scheduler: Arc<RefreshScheduler>,
    service: Arc<RateService>,
    refresh: Mutex<Option<RefreshHandle>>,
}

impl Daemon {
    /// Build the daemon from configuration.
    ///
    /// Uses PostgreSQL when a database URL is configured and the `postgres`
    /// feature is enabled, memory otherwise.
    pub async fn new(config: RatekeeperConfig) -> Result<Self> {
        config.validate().map_err(DaemonError::Config)?;

        let fetcher: Arc<dyn RateFetcher> = Arc::new(CoinGeckoFetcher::new(config.source_config())?);
        let store = open_store(&config).await?;
        Ok(Self::with_components(config, fetcher, store))
    }

    /// Build the daemon around an existing fetcher and store.
    pub fn with_components(
        config: RatekeeperConfig,
        fetcher: Arc<dyn RateFetcher>,
        store: Arc<dyn RateStore>,
    ) -> Self {
        let cache = Arc::new(RateCache::new(
            store.clone(),
            fetcher.clone(),
            config.cache_config(),
        ));
        let engine = Arc::new(ConversionEngine::new(
            cache,
            config.base(),
            config.quote_currencies(),
        ));
        let scheduler = Arc::new(RefreshScheduler::new(
            fetcher,
            store.clone(),
            config.scheduler_config(),
            Arc::new(RefreshMetrics::new()),
        ));
        let service = Arc::new(RateService::new(store, engine, scheduler.clone()));

        Self {
            config,
            state: Arc::new(RwLock::new(DaemonState::Starting)),
            scheduler,
            service,
            refresh: Mutex::new(None),
        }
    }

    /// Start the refresh loop.
    #[instrument(skip(self))]
    pub fn start(&self) -> Result<()> {
        {
            let mut state = self.state.write();
            if *state != DaemonState::Starting {
                return Err(DaemonError::InvalidState(*state));
            }
            *state = DaemonState::Running;
        }

        *self.refresh.lock() = Some(self.scheduler.start());

        info!(
            base = %self.config.base_asset,
            quotes = ?self.config.quotes,
            refresh_secs = self.config.refresh_interval.as_secs(),
            "Daemon started"
        );
        Ok(())
    }

    /// Stop the refresh loop, waiting for any in-flight cycle.
    #[instrument(skip(self))]
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.write();
            match *state {
                DaemonState::Stopped | DaemonState::ShuttingDown => return Ok(()),
                _ => *state = DaemonState::ShuttingDown,
            }
        }
        info!("Stopping daemon");

        let handle = self.refresh.lock().take();
        if let Some(handle) = handle {
            handle.stop().await;
        }

        *self.state.write() = DaemonState::Stopped;
        info!("Daemon stopped");
        Ok(())
    }

    /// Get the current daemon state.
    pub fn state(&self) -> DaemonState {
        *self.state.read()
    }

    /// Check if the refresh loop is running.
    pub fn is_running(&self) -> bool {
        self.state().is_operational()
    }

    /// The inbound rate interface.
    pub fn service(&self) -> &Arc<RateService> {
        &self.service
    }

    /// Refresh loop metrics in Prometheus text format.
    pub fn prometheus_metrics(&self) -> String {
        self.scheduler.metrics().to_prometheus()
    }

    /// Get the configuration.
    pub fn config(&self) -> &RatekeeperConfig {
        &self.config
    }
}

#[cfg(feature = "postgres")]
async fn open_store(config: &RatekeeperConfig) -> Result<Arc<dyn RateStore>> {
    use ratekeeper_rates::PgRateStore;

    let Some(url) = config.database_url.as_deref() else {
        info!("No database configured, keeping rates in memory");
        return Ok(Arc::new(MemoryRateStore::new()));
    };

    let store = PgRateStore::connect(url, config.database_max_connections).await?;
    store.ensure_schema().await?;
    info!("Connected to PostgreSQL rate store");
    Ok(Arc::new(store))
}

#[cfg(not(feature = "postgres"))]
async fn open_store(config: &RatekeeperConfig) -> Result<Arc<dyn RateStore>> {
    if config.database_url.is_some() {
        tracing::warn!("DATABASE_URL is set but the postgres feature is disabled, keeping rates in memory");
    } else {
        info!("No database configured, keeping rates in memory");
    }
    Ok(Arc::new(MemoryRateStore::new()))
}
