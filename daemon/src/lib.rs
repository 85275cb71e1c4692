//! Ratekeeper daemon
//!
//! Wires the rate core to a price source and a store, runs the periodic
//! refresh loop, and exposes the [`RateService`](ratekeeper_rates::RateService)
//! to whatever outer API layer is mounted on top.

pub mod config;
pub mod daemon;
pub mod error;
pub mod state;

pub use config::RatekeeperConfig;
pub use daemon::Daemon;
pub use error::DaemonError;
pub use state::DaemonState;
