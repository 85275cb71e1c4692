//! Ratekeeper rate engine
//!
//! Keeps the latest exchange rates of one base asset fresh, records a
//! timestamped history of complete refreshes, and converts amounts of the
//! base asset into the supported quote currencies.
//!
//! # Features
//!
//! - Periodic refresh from an external price source, one cycle at a time
//! - Latest-rate cache with a single fetch-on-miss fallback
//! - Append-only rate history with windowed queries
//! - Half-up conversion to two decimal places
//! - In-memory store, with PostgreSQL behind the `postgres` feature
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use ratekeeper_rates::{CoinGeckoConfig, CoinGeckoFetcher, MemoryRateStore, RefreshScheduler};
//!
//! let fetcher = Arc::new(CoinGeckoFetcher::new(CoinGeckoConfig::default())?);
//! let store = Arc::new(MemoryRateStore::new());
//! let scheduler = Arc::new(RefreshScheduler::new(fetcher, store, config, metrics));
//!
//! let handle = scheduler.start();
//! // ...
//! handle.stop().await;
//! ```

pub mod cache;
pub mod conversion;
pub mod error;
pub mod fetcher;
pub mod metrics;
#[cfg(feature = "postgres")]
pub mod pg_store;
pub mod scheduler;
pub mod service;
pub mod store;

pub use cache::{CacheStats, RateCache, RateCacheConfig, SharedRateCache};
pub use conversion::{round_amount, Conversion, ConversionEngine};
pub use error::{FetchError, FetchResult, RateError, RateResult, StoreError, StoreResult};
pub use fetcher::{fetch_with_timeout, CoinGeckoConfig, CoinGeckoFetcher, RateFetcher};
pub use metrics::{MetricsSnapshot, RefreshMetrics};
#[cfg(feature = "postgres")]
pub use pg_store::PgRateStore;
pub use scheduler::{CycleOutcome, RefreshHandle, RefreshPhase, RefreshScheduler, SchedulerConfig};
pub use service::{HealthReport, HealthStatus, LatestRates, RateService};
pub use store::{MemoryRateStore, RateStore, SharedRateStore, UpsertOutcome};

#[cfg(any(test, feature = "test-utils"))]
pub use fetcher::MockRateFetcher;
