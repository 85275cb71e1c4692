//! Daemon error types.

use thiserror::Error;

use ratekeeper_rates::{FetchError, StoreError};

use crate::state::DaemonState;

/// Errors raised while building or driving the daemon.
#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Price source setup failed: {0}")]
    Source(#[from] FetchError),

    #[error("Store setup failed: {0}")]
    Store(#[from] StoreError),

    #[error("Invalid daemon state for this operation: {0:?}")]
    InvalidState(DaemonState),
}

/// Result type alias for daemon operations.
pub type Result<T> = std::result::Result<T, DaemonError>;
