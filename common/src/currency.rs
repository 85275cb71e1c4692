//! Currency codes and rate pairs.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{CommonError, Result};

/// Uppercase currency or asset code, e.g. `BTC`, `USD`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Currency(String);

impl Currency {
    /// Create a new currency from code. The code is uppercased and trimmed.
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into().trim().to_uppercase())
    }

    /// Create a currency, rejecting anything that is not a three-letter code.
    pub fn parse(code: &str) -> Result<Self> {
        let currency = Self::new(code);
        if currency.is_three_letter_code() {
            Ok(currency)
        } else {
            Err(CommonError::InvalidCurrency(code.to_string()))
        }
    }

    /// Get the currency code.
    pub fn code(&self) -> &str {
        &self.0
    }

    /// Check whether this is a three-letter alphabetic code.
    pub fn is_three_letter_code(&self) -> bool {
        self.0.len() == 3 && self.0.chars().all(|c| c.is_ascii_alphabetic())
    }

    pub fn btc() -> Self {
        Self::new("BTC")
    }

    pub fn usd() -> Self {
        Self::new("USD")
    }

    pub fn eur() -> Self {
        Self::new("EUR")
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Currency {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// A (base asset, quote currency) pair. This is the cache key for latest rates.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RatePair {
    /// Asset being priced.
    pub base: Currency,
    /// Currency the price is expressed in.
    pub quote: Currency,
}

impl RatePair {
    /// Create a new rate pair.
    pub fn new(base: impl Into<Currency>, quote: impl Into<Currency>) -> Self {
        Self {
            base: base.into(),
            quote: quote.into(),
        }
    }
}

impl fmt::Display for RatePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, self.quote)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_currency_normalizes_case() {
        assert_eq!(Currency::new("usd"), Currency::usd());
        assert_eq!(Currency::new(" eur "), Currency::eur());
        assert_eq!(Currency::new("btc").code(), "BTC");
    }

    #[test]
    fn test_currency_parse() {
        assert_eq!(Currency::parse("gbp").unwrap().code(), "GBP");
        assert!(matches!(
            Currency::parse("US"),
            Err(CommonError::InvalidCurrency(_))
        ));
        assert!(Currency::parse("US1").is_err());
        assert!(Currency::parse("").is_err());
        assert!(Currency::parse("EURO").is_err());
    }

    #[test]
    fn test_pair_identity_is_case_insensitive() {
        let a = RatePair::new("btc", "usd");
        let b = RatePair::new(Currency::btc(), Currency::usd());
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "BTC/USD");
    }
}
