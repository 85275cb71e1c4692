//! PostgreSQL rate store.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use ratekeeper_common::{Currency, HistoryEntry, RatePair, RateRecord, Timestamp};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use tracing::info;

use crate::error::{StoreError, StoreResult};
use crate::store::{RateStore, UpsertOutcome};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS rate_latest (
        base TEXT NOT NULL,
        quote TEXT NOT NULL,
        rate NUMERIC NOT NULL CHECK (rate > 0),
        observed_at TIMESTAMPTZ NOT NULL,
        PRIMARY KEY (base, quote)
    )",
    "CREATE TABLE IF NOT EXISTS rate_history (
        id BIGSERIAL PRIMARY KEY,
        base TEXT NOT NULL,
        rates JSONB NOT NULL,
        recorded_at TIMESTAMPTZ NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS rate_history_recorded_at_idx ON rate_history (recorded_at)",
];

/// Rate store on a PostgreSQL pool.
pub struct PgRateStore {
    pool: PgPool,
}

impl PgRateStore {
    /// Connect to `database_url`.
    pub async fn connect(database_url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(backend)?;
        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create tables and indexes if they are missing.
    pub async fn ensure_schema(&self) -> StoreResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(backend)?;
        }
        info!("Rate store schema ready");
        Ok(())
    }
}

fn backend(e: sqlx::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn record_from_row(row: &PgRow) -> StoreResult<RateRecord> {
    let base: String = row.try_get("base").map_err(backend)?;
    let quote: String = row.try_get("quote").map_err(backend)?;
    let rate: Decimal = row.try_get("rate").map_err(backend)?;
    let observed_at: DateTime<Utc> = row.try_get("observed_at").map_err(backend)?;
    RateRecord::new(RatePair::new(base, quote), rate, observed_at)
        .map_err(|e| StoreError::InvalidRecord(e.to_string()))
}

fn history_from_row(row: &PgRow) -> StoreResult<HistoryEntry> {
    let base: String = row.try_get("base").map_err(backend)?;
    let Json(rates): Json<BTreeMap<Currency, Decimal>> =
        row.try_get("rates").map_err(backend)?;
    let recorded_at: DateTime<Utc> = row.try_get("recorded_at").map_err(backend)?;
    Ok(HistoryEntry::new(Currency::new(base), rates, recorded_at))
}

#[async_trait]
impl RateStore for PgRateStore {
    async fn get_latest(&self, pair: &RatePair) -> StoreResult<Option<RateRecord>> {
        let row = sqlx::query(
            "SELECT base, quote, rate, observed_at FROM rate_latest WHERE base = $1 AND quote = $2",
        )
        .bind(pair.base.code())
        .bind(pair.quote.code())
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        row.as_ref().map(record_from_row).transpose()
    }

    async fn upsert_latest(&self, record: RateRecord) -> StoreResult<UpsertOutcome> {
        if record.rate <= Decimal::ZERO {
            return Err(StoreError::InvalidRecord(format!(
                "non-positive rate {} for {}",
                record.rate, record.pair
            )));
        }

        // xmax = 0 only for freshly inserted rows; no row back means the
        // conflict guard kept a newer record.
        let row = sqlx::query(
            "INSERT INTO rate_latest (base, quote, rate, observed_at)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (base, quote) DO UPDATE
                SET rate = EXCLUDED.rate, observed_at = EXCLUDED.observed_at
                WHERE rate_latest.observed_at <= EXCLUDED.observed_at
             RETURNING (xmax = 0) AS inserted",
        )
        .bind(record.pair.base.code())
        .bind(record.pair.quote.code())
        .bind(record.rate)
        .bind(record.observed_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        match row {
            None => Ok(UpsertOutcome::Stale),
            Some(row) => {
                let inserted: bool = row.try_get("inserted").map_err(backend)?;
                Ok(if inserted {
                    UpsertOutcome::Inserted
                } else {
                    UpsertOutcome::Replaced
                })
            }
        }
    }

    async fn latest_pairs(&self) -> StoreResult<Vec<RateRecord>> {
        let rows = sqlx::query(
            "SELECT base, quote, rate, observed_at FROM rate_latest ORDER BY base, quote",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        rows.iter().map(record_from_row).collect()
    }

    async fn append_history(&self, entry: HistoryEntry) -> StoreResult<()> {
        sqlx::query("INSERT INTO rate_history (base, rates, recorded_at) VALUES ($1, $2, $3)")
            .bind(entry.base.code())
            .bind(Json(&entry.rates))
            .bind(entry.recorded_at)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn count_history(&self) -> StoreResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM rate_history")
            .fetch_one(&self.pool)
            .await
            .map_err(backend)?;
        Ok(count.max(0) as u64)
    }

    async fn history_since(&self, cutoff: Timestamp) -> StoreResult<Vec<HistoryEntry>> {
        // timestamptz stops at 4713 BC; anything that early means "all history".
        let cutoff = (cutoff.year() >= 1).then_some(cutoff);
        let rows = sqlx::query(
            "SELECT base, rates, recorded_at FROM rate_history
             WHERE $1::timestamptz IS NULL OR recorded_at >= $1
             ORDER BY recorded_at ASC, id ASC",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        rows.iter().map(history_from_row).collect()
    }
}
