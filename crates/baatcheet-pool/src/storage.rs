//! Durable mirror of daily key usage.
//!
//! The pool is the authority for counts while the process runs; the store
//! only lets a restart pick up where the previous process left off.

use std::sync::Arc;

use async_trait::async_trait;
use baatcheet_core::{error::Result, storage::Storage, KeyUsage};
use chrono::NaiveDate;

/// Persistence operations the key pool needs.
#[async_trait]
pub trait UsageStore: Send + Sync + 'static {
    /// Loads every counter recorded for `date`.
    async fn load_day(&self, date: NaiveDate) -> Result<Vec<KeyUsage>>;

    /// Writes one counter. Stored counts never decrease within a day.
    async fn save(&self, usage: &KeyUsage) -> Result<()>;

    /// Drops counters of days before `date`. Returns how many were removed.
    async fn prune_before(&self, date: NaiveDate) -> Result<u64>;
}

/// PostgreSQL-backed usage store.
pub struct PostgresUsageStore {
    storage: Arc<Storage>,
}

impl PostgresUsageStore {
    /// Creates a store over the shared repositories.
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl UsageStore for PostgresUsageStore {
    async fn load_day(&self, date: NaiveDate) -> Result<Vec<KeyUsage>> {
        self.storage.usage.find_by_date(date).await
    }

    async fn save(&self, usage: &KeyUsage) -> Result<()> {
        self.storage.usage.upsert(usage).await
    }

    async fn prune_before(&self, date: NaiveDate) -> Result<u64> {
        self.storage.usage.delete_before(date).await
    }
}

pub mod memory {
    //! In-memory usage store for tests and database-less deployments.

    use std::collections::HashMap;

    use baatcheet_core::Provider;
    use tokio::sync::RwLock;

    use super::*;

    type UsageKey = (Provider, u32, NaiveDate);

    /// Usage store holding counters in a map. Contents are lost on restart.
    #[derive(Debug, Default)]
    pub struct InMemoryUsageStore {
        counters: RwLock<HashMap<UsageKey, u32>>,
    }

    impl InMemoryUsageStore {
        /// Creates an empty store.
        pub fn new() -> Self {
            Self::default()
        }

        /// Stored count for one slot and day, if any.
        pub async fn count(&self, provider: Provider, slot_index: u32, date: NaiveDate) -> Option<u32> {
            self.counters.read().await.get(&(provider, slot_index, date)).copied()
        }

        /// Number of stored counters.
        pub async fn len(&self) -> usize {
            self.counters.read().await.len()
        }

        /// Whether nothing has been stored yet.
        pub async fn is_empty(&self) -> bool {
            self.counters.read().await.is_empty()
        }
    }

    #[async_trait]
    impl UsageStore for InMemoryUsageStore {
        async fn load_day(&self, date: NaiveDate) -> Result<Vec<KeyUsage>> {
            let counters = self.counters.read().await;
            let mut usage: Vec<KeyUsage> = counters
                .iter()
                .filter(|((_, _, day), _)| *day == date)
                .map(|(&(provider, slot_index, usage_date), &request_count)| KeyUsage {
                    provider,
                    slot_index,
                    usage_date,
                    request_count,
                })
                .collect();
            usage.sort_by_key(|entry| (entry.provider, entry.slot_index));
            Ok(usage)
        }

        async fn save(&self, usage: &KeyUsage) -> Result<()> {
            let mut counters = self.counters.write().await;
            let stored = counters
                .entry((usage.provider, usage.slot_index, usage.usage_date))
                .or_insert(0);
            *stored = (*stored).max(usage.request_count);
            Ok(())
        }

        async fn prune_before(&self, date: NaiveDate) -> Result<u64> {
            let mut counters = self.counters.write().await;
            let before = counters.len();
            counters.retain(|(_, _, day), _| *day >= date);
            Ok(u64::try_from(before - counters.len()).unwrap_or(u64::MAX))
        }
    }
}

#[cfg(test)]
mod tests {
    use baatcheet_core::Provider;

    use super::{memory::InMemoryUsageStore, *};

    fn usage(provider: Provider, slot_index: u32, date: NaiveDate, request_count: u32) -> KeyUsage {
        KeyUsage { provider, slot_index, usage_date: date, request_count }
    }

    #[tokio::test]
    async fn memory_store_never_lowers_a_count() {
        let store = InMemoryUsageStore::new();
        let day = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();

        store.save(&usage(Provider::Groq, 0, day, 7)).await.unwrap();
        store.save(&usage(Provider::Groq, 0, day, 5)).await.unwrap();

        assert_eq!(store.count(Provider::Groq, 0, day).await, Some(7));
    }

    #[tokio::test]
    async fn memory_store_partitions_by_day() {
        let store = InMemoryUsageStore::new();
        let monday = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();
        let tuesday = monday.succ_opt().unwrap();

        store.save(&usage(Provider::Gemini, 1, monday, 3)).await.unwrap();
        store.save(&usage(Provider::Gemini, 0, tuesday, 1)).await.unwrap();
        store.save(&usage(Provider::Groq, 0, tuesday, 2)).await.unwrap();

        let loaded = store.load_day(tuesday).await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].provider, Provider::Groq);
        assert!(loaded.iter().all(|entry| entry.usage_date == tuesday));
    }

    #[tokio::test]
    async fn pruning_keeps_cutoff_day_and_later() {
        let store = InMemoryUsageStore::new();
        let cutoff = NaiveDate::from_ymd_opt(2026, 3, 10).unwrap();
        let older = cutoff.pred_opt().unwrap();

        store.save(&usage(Provider::Groq, 0, older, 4)).await.unwrap();
        store.save(&usage(Provider::Groq, 1, older, 2)).await.unwrap();
        store.save(&usage(Provider::Groq, 0, cutoff, 1)).await.unwrap();

        assert_eq!(store.prune_before(cutoff).await.unwrap(), 2);
        assert_eq!(store.len().await, 1);
        assert_eq!(store.count(Provider::Groq, 0, cutoff).await, Some(1));
    }
}
