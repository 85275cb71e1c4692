//! Rate observations: the latest-rate record and the history log entry.

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::currency::{Currency, RatePair};
use crate::error::{CommonError, Result};
use crate::time::Timestamp;

/// The current observation for one pair.
///
/// At most one record exists per pair in the latest-rate store; a newer
/// record replaces the old one as a whole.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateRecord {
    /// The pair this rate belongs to.
    pub pair: RatePair,
    /// Price of one unit of base in quote. Always positive.
    pub rate: Decimal,
    /// When the rate was fetched from the price source.
    pub observed_at: Timestamp,
}

impl RateRecord {
    /// Create a new rate record.
    pub fn new(pair: RatePair, rate: Decimal, observed_at: Timestamp) -> Result<Self> {
        if rate <= Decimal::ZERO {
            return Err(CommonError::InvalidRate(rate));
        }
        Ok(Self {
            pair,
            rate,
            observed_at,
        })
    }

    /// Check whether this record was observed after `other`.
    pub fn is_newer_than(&self, other: &RateRecord) -> bool {
        self.observed_at > other.observed_at
    }
}

/// One row of the append-only history log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// The base asset all rates are quoted for.
    pub base: Currency,
    /// Quote currency to rate, captured at the same instant.
    pub rates: BTreeMap<Currency, Decimal>,
    /// When the entry was recorded.
    pub recorded_at: Timestamp,
}

impl HistoryEntry {
    /// Create a new history entry.
    pub fn new(
        base: Currency,
        rates: BTreeMap<Currency, Decimal>,
        recorded_at: Timestamp,
    ) -> Self {
        Self {
            base,
            rates,
            recorded_at,
        }
    }

    /// Rate for a quote currency, if captured.
    pub fn rate(&self, quote: &Currency) -> Option<Decimal> {
        self.rates.get(quote).copied()
    }

    /// Check whether every one of `quotes` has a rate in this entry.
    pub fn covers(&self, quotes: &[Currency]) -> bool {
        quotes.iter().all(|q| self.rates.contains_key(q))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::now;
    use rust_decimal_macros::dec;

    #[test]
    fn test_record_rejects_non_positive_rate() {
        let pair = RatePair::new("BTC", "USD");
        assert!(RateRecord::new(pair.clone(), dec!(50000.00), now()).is_ok());
        assert_eq!(
            RateRecord::new(pair.clone(), Decimal::ZERO, now()),
            Err(CommonError::InvalidRate(Decimal::ZERO))
        );
        assert!(RateRecord::new(pair, dec!(-1), now()).is_err());
    }

    #[test]
    fn test_record_ordering() {
        let pair = RatePair::new("BTC", "USD");
        let t = now();
        let older = RateRecord::new(pair.clone(), dec!(1), t).unwrap();
        let newer =
            RateRecord::new(pair, dec!(2), t + chrono::Duration::seconds(1)).unwrap();
        assert!(newer.is_newer_than(&older));
        assert!(!older.is_newer_than(&newer));
        assert!(!older.is_newer_than(&older));
    }

    #[test]
    fn test_history_entry_accessors() {
        let rates = BTreeMap::from([
            (Currency::usd(), dec!(50000)),
            (Currency::eur(), dec!(45000.123)),
        ]);
        let entry = HistoryEntry::new(Currency::btc(), rates, now());

        assert_eq!(entry.rate(&Currency::eur()), Some(dec!(45000.123)));
        assert_eq!(entry.rate(&Currency::new("GBP")), None);
        assert!(entry.covers(&[Currency::usd(), Currency::eur()]));
        assert!(!entry.covers(&[Currency::usd(), Currency::new("GBP")]));
    }

    #[test]
    fn test_history_entry_serializes_quotes_as_keys() {
        let rates = BTreeMap::from([(Currency::usd(), dec!(50000.5))]);
        let entry = HistoryEntry::new(Currency::btc(), rates, now());
        let json = serde_json::to_value(&entry).unwrap();

        assert_eq!(json["base"], "BTC");
        assert!(json["rates"].get("USD").is_some());
    }
}
