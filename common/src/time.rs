//! Time utilities and constants for Ratekeeper.

use chrono::{DateTime, Duration, Utc};

/// Default timing and precision constants.
pub mod constants {
    use super::Duration;

    /// Period between scheduled refresh cycles (5 minutes).
    pub fn refresh_interval() -> Duration {
        Duration::minutes(5)
    }

    /// Delay before the first refresh cycle after startup (10 seconds).
    pub fn initial_refresh_delay() -> Duration {
        Duration::seconds(10)
    }

    /// Upper bound on a single outbound price fetch (10 seconds).
    pub fn fetch_timeout() -> Duration {
        Duration::seconds(10)
    }

    /// Default window for history queries (24 hours).
    pub fn history_window() -> Duration {
        Duration::hours(24)
    }

    /// Decimal places of converted amounts.
    pub const CONVERSION_DECIMAL_PLACES: u32 = 2;
}

/// A UTC timestamp.
pub type Timestamp = DateTime<Utc>;

/// Get the current timestamp.
pub fn now() -> Timestamp {
    Utc::now()
}

/// The cutoff for "everything within the last `window`".
///
/// A window reaching past the earliest representable time covers all of
/// history. A negative window is treated as empty and cuts off at now.
pub fn cutoff_for(window: Duration) -> Timestamp {
    let window = window.max(Duration::zero());
    now()
        .checked_sub_signed(window)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Duration extensions for convenient construction.
pub trait DurationExt {
    fn as_std(&self) -> std::time::Duration;
}

impl DurationExt for Duration {
    fn as_std(&self) -> std::time::Duration {
        self.to_std().unwrap_or(std::time::Duration::ZERO)
    }
}
