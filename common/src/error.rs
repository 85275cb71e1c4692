//! Validation errors for shared rate types.

use rust_decimal::Decimal;
use thiserror::Error;

/// Errors raised while constructing shared rate types.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommonError {
    /// Currency code is not a three-letter alphabetic code.
    #[error("Invalid currency code: {0:?}")]
    InvalidCurrency(String),

    /// Rate is zero or negative.
    #[error("Rate must be positive, got {0}")]
    InvalidRate(Decimal),
}

impl CommonError {
    /// Get error code for API responses.
    pub fn error_code(&self) -> &'static str {
        match self {
            CommonError::InvalidCurrency(_) => "INVALID_CURRENCY",
            CommonError::InvalidRate(_) => "INVALID_RATE",
        }
    }
}

/// Result type alias for shared type construction.
pub type Result<T> = std::result::Result<T, CommonError>;
