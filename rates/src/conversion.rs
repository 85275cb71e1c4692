//! Amount conversion using cached rates.

use std::sync::Arc;

use ratekeeper_common::{constants::CONVERSION_DECIMAL_PLACES, Currency, RatePair, Timestamp};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::cache::RateCache;
use crate::error::{RateError, RateResult};

/// A completed conversion of base-asset units into a quote currency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversion {
    /// Amount of the base asset.
    pub amount: Decimal,
    /// `amount × rate`, rounded half up to two places.
    pub converted: Decimal,
    /// Rate used.
    pub rate: Decimal,
    /// The pair converted along.
    pub pair: RatePair,
    /// When the rate used was observed. Not the conversion time.
    pub observed_at: Timestamp,
}

impl Conversion {
    /// Quote currency of the converted amount.
    pub fn quote(&self) -> &Currency {
        &self.pair.quote
    }
}

/// Round a money-like amount half up (away from zero on ties).
pub fn round_amount(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(CONVERSION_DECIMAL_PLACES, RoundingStrategy::MidpointAwayFromZero)
}

/// Converts base-asset amounts with rates from the [`RateCache`].
pub struct ConversionEngine {
    cache: Arc<RateCache>,
    base: Currency,
    quotes: Vec<Currency>,
}

impl ConversionEngine {
    /// Create a new engine for `base`, converting into `quotes` by default.
    pub fn new(cache: Arc<RateCache>, base: Currency, quotes: Vec<Currency>) -> Self {
        Self {
            cache,
            base,
            quotes,
        }
    }

    /// The base asset.
    pub fn base(&self) -> &Currency {
        &self.base
    }

    /// Convert `amount` of the base asset into `quote`.
    #[instrument(skip(self), fields(base = %self.base))]
    pub async fn convert(&self, amount: Decimal, quote: &Currency) -> RateResult<Conversion> {
        if amount <= Decimal::ZERO {
            return Err(RateError::InvalidAmount(amount));
        }

        let pair = RatePair::new(self.base.clone(), quote.clone());
        let record = match self.cache.get(&pair).await {
            Ok(record) => record,
            Err(RateError::Unavailable(pair)) => return Err(RateError::NoRateData(pair)),
            Err(e) => return Err(e),
        };

        let Some(product) = amount.checked_mul(record.rate) else {
            warn!(pair = %pair, amount = %amount, rate = %record.rate, "Conversion overflowed");
            return Err(RateError::AmountTooLarge { amount, pair });
        };

        let conversion = Conversion {
            amount,
            converted: round_amount(product),
            rate: record.rate,
            pair,
            observed_at: record.observed_at,
        };

        info!(
            pair = %conversion.pair,
            amount = %conversion.amount,
            converted = %conversion.converted,
            "Conversion completed"
        );

        Ok(conversion)
    }

    /// Convert `amount` into every configured quote.
    ///
    /// Fails as a whole if any quote has no rate.
    pub async fn convert_all(&self, amount: Decimal) -> RateResult<Vec<Conversion>> {
        let mut conversions = Vec::with_capacity(self.quotes.len());
        for quote in &self.quotes {
            conversions.push(self.convert(amount, quote).await?);
        }
        Ok(conversions)
    }
}
