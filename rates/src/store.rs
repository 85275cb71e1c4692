//! Latest-rate and history storage.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use ratekeeper_common::{HistoryEntry, RatePair, RateRecord, Timestamp};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::debug;

use crate::error::{StoreError, StoreResult};

/// What an upsert did to the latest-rate slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// No record existed for the pair.
    Inserted,
    /// An older or equally old record was replaced.
    Replaced,
    /// A newer record was already present; nothing changed.
    Stale,
}

impl UpsertOutcome {
    /// Whether the incoming record is now the stored one.
    pub fn is_applied(&self) -> bool {
        !matches!(self, UpsertOutcome::Stale)
    }
}

/// Storage contract for the latest-rate slots and the history log.
///
/// Implementations must make `upsert_latest` a single atomic replace per pair:
/// concurrent readers see either the old record or the new one, never a gap
/// and never one writer's rate with another writer's timestamp.
#[async_trait]
pub trait RateStore: Send + Sync {
    /// Get the latest record for a pair, `None` when absent.
    async fn get_latest(&self, pair: &RatePair) -> StoreResult<Option<RateRecord>>;

    /// Replace the latest record for `record.pair`.
    ///
    /// A stored record with a later `observed_at` wins and the write is
    /// dropped; equal timestamps resolve last-writer-wins.
    async fn upsert_latest(&self, record: RateRecord) -> StoreResult<UpsertOutcome>;

    /// Snapshot of every latest record.
    async fn latest_pairs(&self) -> StoreResult<Vec<RateRecord>>;

    /// Append an entry to the history log. Duplicates are kept.
    async fn append_history(&self, entry: HistoryEntry) -> StoreResult<()>;

    /// Number of history entries.
    async fn count_history(&self) -> StoreResult<u64>;

    /// History entries with `recorded_at >= cutoff`, oldest first.
    async fn history_since(&self, cutoff: Timestamp) -> StoreResult<Vec<HistoryEntry>>;
}

/// Shared store handle.
pub type SharedRateStore = Arc<dyn RateStore>;

/// In-process store backed by a concurrent map and an ordered log.
pub struct MemoryRateStore {
    latest: DashMap<RatePair, RateRecord>,
    history: RwLock<Vec<HistoryEntry>>,
}

impl MemoryRateStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            latest: DashMap::new(),
            history: RwLock::new(Vec::new()),
        }
    }

    /// Number of pairs with a latest record.
    pub fn len(&self) -> usize {
        self.latest.len()
    }

    /// Check if no pair has a latest record.
    pub fn is_empty(&self) -> bool {
        self.latest.is_empty()
    }
}

impl Default for MemoryRateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RateStore for MemoryRateStore {
    async fn get_latest(&self, pair: &RatePair) -> StoreResult<Option<RateRecord>> {
        Ok(self.latest.get(pair).map(|r| r.clone()))
    }

    async fn upsert_latest(&self, record: RateRecord) -> StoreResult<UpsertOutcome> {
        if record.rate <= Decimal::ZERO {
            return Err(StoreError::InvalidRecord(format!(
                "non-positive rate {} for {}",
                record.rate, record.pair
            )));
        }

        // The entry guard holds the shard lock, so check and replace are one step.
        let outcome = match self.latest.entry(record.pair.clone()) {
            Entry::Occupied(mut slot) => {
                if slot.get().is_newer_than(&record) {
                    UpsertOutcome::Stale
                } else {
                    slot.insert(record);
                    UpsertOutcome::Replaced
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(record);
                UpsertOutcome::Inserted
            }
        };

        Ok(outcome)
    }

    async fn latest_pairs(&self) -> StoreResult<Vec<RateRecord>> {
        let mut records: Vec<RateRecord> = self.latest.iter().map(|r| r.clone()).collect();
        records.sort_by(|a, b| a.pair.cmp(&b.pair));
        Ok(records)
    }

    async fn append_history(&self, entry: HistoryEntry) -> StoreResult<()> {
        let mut history = self.history.write();
        // Keep the log sorted even if a caller's clock stepped backwards.
        let position = history.partition_point(|e| e.recorded_at <= entry.recorded_at);
        if position != history.len() {
            debug!(
                recorded_at = %entry.recorded_at,
                "History entry older than log tail, inserting in order"
            );
        }
        history.insert(position, entry);
        Ok(())
    }

    async fn count_history(&self) -> StoreResult<u64> {
        Ok(self.history.read().len() as u64)
    }

    async fn history_since(&self, cutoff: Timestamp) -> StoreResult<Vec<HistoryEntry>> {
        let history = self.history.read();
        let start = history.partition_point(|e| e.recorded_at < cutoff);
        Ok(history[start..].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use proptest::prelude::*;
    use ratekeeper_common::{now, Currency};
    use rust_decimal_macros::dec;
    use std::collections::BTreeMap;
    use tokio_test::assert_ok;

    fn record(quote: &str, rate: Decimal, observed_at: Timestamp) -> RateRecord {
        RateRecord::new(RatePair::new("BTC", quote), rate, observed_at).unwrap()
    }

    fn entry(usd: Decimal, recorded_at: Timestamp) -> HistoryEntry {
        HistoryEntry::new(
            Currency::btc(),
            BTreeMap::from([(Currency::usd(), usd), (Currency::eur(), usd)]),
            recorded_at,
        )
    }

    #[tokio::test]
    async fn test_upsert_then_get() {
        let store = MemoryRateStore::new();
        let t = now();

        let outcome = assert_ok!(store.upsert_latest(record("USD", dec!(50000), t)).await);
        assert_eq!(outcome, UpsertOutcome::Inserted);

        let stored = store
            .get_latest(&RatePair::new("BTC", "USD"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.rate, dec!(50000));
        assert_eq!(stored.observed_at, t);
    }

    #[tokio::test]
    async fn test_get_missing_pair() {
        let store = MemoryRateStore::new();
        let result = store.get_latest(&RatePair::new("BTC", "USD")).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_upsert_replaces_whole_record() {
        let store = MemoryRateStore::new();
        let t = now();
        store.upsert_latest(record("USD", dec!(50000), t)).await.unwrap();

        let later = t + Duration::seconds(300);
        let outcome = store
            .upsert_latest(record("USD", dec!(51000.5), later))
            .await
            .unwrap();
        assert_eq!(outcome, UpsertOutcome::Replaced);

        let stored = store
            .get_latest(&RatePair::new("BTC", "USD"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored, record("USD", dec!(51000.5), later));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_upsert_never_regresses_to_older_record() {
        let store = MemoryRateStore::new();
        let t = now();
        store.upsert_latest(record("USD", dec!(51000), t)).await.unwrap();

        let outcome = store
            .upsert_latest(record("USD", dec!(49000), t - Duration::seconds(5)))
            .await
            .unwrap();
        assert_eq!(outcome, UpsertOutcome::Stale);
        assert!(!outcome.is_applied());

        let stored = store
            .get_latest(&RatePair::new("BTC", "USD"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.rate, dec!(51000));
        assert_eq!(stored.observed_at, t);
    }

    #[tokio::test]
    async fn test_upsert_rejects_non_positive_rate() {
        let store = MemoryRateStore::new();
        let bad = RateRecord {
            pair: RatePair::new("BTC", "USD"),
            rate: Decimal::ZERO,
            observed_at: now(),
        };
        let result = store.upsert_latest(bad).await;
        assert!(matches!(result, Err(StoreError::InvalidRecord(_))));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_pairs_are_independent() {
        let store = MemoryRateStore::new();
        let t = now();
        store.upsert_latest(record("USD", dec!(50000), t)).await.unwrap();
        store.upsert_latest(record("EUR", dec!(45000), t)).await.unwrap();

        let all = store.latest_pairs().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].pair.quote, Currency::eur());
        assert_eq!(all[1].pair.quote, Currency::usd());
    }

    #[tokio::test]
    async fn test_concurrent_upserts_leave_one_writers_tuple() {
        let store = Arc::new(MemoryRateStore::new());
        let t = now();

        let mut tasks = Vec::new();
        for i in 0..32i64 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                let rate = Decimal::from(50000 + i);
                store
                    .upsert_latest(record("USD", rate, t + Duration::seconds(i % 4)))
                    .await
                    .unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let stored = store
            .get_latest(&RatePair::new("BTC", "USD"))
            .await
            .unwrap()
            .unwrap();
        let i = (stored.rate - Decimal::from(50000)).mantissa() as i64;
        assert_eq!(stored.observed_at, t + Duration::seconds(i % 4));
        assert_eq!(stored.observed_at, t + Duration::seconds(3));
    }

    #[tokio::test]
    async fn test_history_since_is_ascending_and_excludes_old() {
        let store = MemoryRateStore::new();
        let t = now();

        store.append_history(entry(dec!(1), t - Duration::hours(30))).await.unwrap();
        store.append_history(entry(dec!(2), t - Duration::hours(2))).await.unwrap();
        store.append_history(entry(dec!(3), t - Duration::hours(1))).await.unwrap();
        // Out-of-order append still lands in order.
        store.append_history(entry(dec!(4), t - Duration::hours(3))).await.unwrap();

        let recent = store.history_since(t - Duration::hours(24)).await.unwrap();
        let usd: Vec<Decimal> = recent
            .iter()
            .map(|e| e.rate(&Currency::usd()).unwrap())
            .collect();
        assert_eq!(usd, vec![dec!(4), dec!(2), dec!(3)]);
        assert!(recent.windows(2).all(|w| w[0].recorded_at <= w[1].recorded_at));
        assert_eq!(store.count_history().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_history_cutoff_is_inclusive() {
        let store = MemoryRateStore::new();
        let t = now();
        store.append_history(entry(dec!(1), t)).await.unwrap();

        assert_eq!(store.history_since(t).await.unwrap().len(), 1);
        assert!(store
            .history_since(t + Duration::milliseconds(1))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_history_entries_are_kept() {
        let store = MemoryRateStore::new();
        let e = entry(dec!(1), now());
        store.append_history(e.clone()).await.unwrap();
        store.append_history(e).await.unwrap();
        assert_eq!(store.count_history().await.unwrap(), 2);
    }

    proptest! {
        #[test]
        fn prop_upsert_replaces_not_merges(
            first in 1u64..10_000_000,
            second in 1u64..10_000_000,
            gap in 0i64..86_400,
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let store = MemoryRateStore::new();
                let t = now();
                let pair = RatePair::new("BTC", "USD");
                let older = RateRecord::new(pair.clone(), Decimal::new(first as i64, 2), t).unwrap();
                let newer = RateRecord::new(
                    pair.clone(),
                    Decimal::new(second as i64, 2),
                    t + Duration::seconds(gap),
                )
                .unwrap();

                store.upsert_latest(older).await.unwrap();
                store.upsert_latest(newer.clone()).await.unwrap();

                let stored = store.get_latest(&pair).await.unwrap().unwrap();
                prop_assert_eq!(stored, newer);
                Ok(())
            })?;
        }
    }
}
