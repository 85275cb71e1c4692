//! Rate core error types.

use ratekeeper_common::RatePair;
use rust_decimal::Decimal;
use thiserror::Error;

/// Errors from the external price source.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    /// The request itself was unusable (no quotes, unknown asset, bad code).
    #[error("Invalid fetch request: {0}")]
    InvalidRequest(String),

    /// Transport failure, non-success status or timeout.
    #[error("Network error: {0}")]
    Network(String),

    /// The source throttled us.
    #[error("Rate limited by price source")]
    RateLimited {
        /// Seconds to wait, when the source said so.
        retry_after_secs: Option<u64>,
    },

    /// Body could not be decoded or lacked the asset key.
    #[error("Malformed response: {0}")]
    MalformedResponse(String),
}

impl FetchError {
    /// Short reason label used in logs and metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            FetchError::InvalidRequest(_) => "invalid-request",
            FetchError::Network(_) => "network",
            FetchError::RateLimited { .. } => "rate-limited",
            FetchError::MalformedResponse(_) => "malformed-response",
        }
    }
}

/// Errors from a rate store backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The backend failed to read or write.
    #[error("Store backend error: {0}")]
    Backend(String),

    /// The record could not be stored as given.
    #[error("Invalid record: {0}")]
    InvalidRecord(String),
}

/// Errors surfaced by the cache, conversion engine and service.
#[derive(Debug, Error)]
pub enum RateError {
    /// No stored rate for the pair.
    #[error("No rate stored for {0}")]
    NotFound(RatePair),

    /// Cache miss and the fallback fetch did not produce a rate.
    #[error("Rate unavailable for {0}")]
    Unavailable(RatePair),

    /// Conversion amount must be positive.
    #[error("Amount must be greater than 0, got {0}")]
    InvalidAmount(Decimal),

    /// Conversion could not find a rate to use.
    #[error("No rate data available for {0}")]
    NoRateData(RatePair),

    /// `amount × rate` does not fit in a decimal.
    #[error("Converting {amount} along {pair} overflows")]
    AmountTooLarge { amount: Decimal, pair: RatePair },

    /// Price source error.
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// Store error.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl RateError {
    /// Get error code for API responses.
    pub fn error_code(&self) -> &'static str {
        match self {
            RateError::NotFound(_) => "NOT_FOUND",
            RateError::Unavailable(_) => "UNAVAILABLE",
            RateError::InvalidAmount(_) => "INVALID_AMOUNT",
            RateError::NoRateData(_) => "NO_RATE_DATA",
            RateError::AmountTooLarge { .. } => "AMOUNT_TOO_LARGE",
            RateError::Fetch(_) => "FETCH_ERROR",
            RateError::Store(_) => "STORE_ERROR",
        }
    }
}

/// Result type for price source calls.
pub type FetchResult<T> = Result<T, FetchError>;

/// Result type for store calls.
pub type StoreResult<T> = Result<T, StoreError>;

/// Result type for rate operations.
pub type RateResult<T> = Result<T, RateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_error_reasons() {
        assert_eq!(FetchError::Network("x".into()).reason(), "network");
        assert_eq!(
            FetchError::RateLimited {
                retry_after_secs: Some(30)
            }
            .reason(),
            "rate-limited"
        );
        assert_eq!(
            FetchError::MalformedResponse("x".into()).reason(),
            "malformed-response"
        );
    }

    #[test]
    fn test_rate_error_from_fetch() {
        let err: RateError = FetchError::Network("down".into()).into();
        assert_eq!(err.error_code(), "FETCH_ERROR");
        assert_eq!(err.to_string(), "Network error: down");
    }
}
