//! Property-based tests for key rotation and quota enforcement.

use std::{collections::HashMap, sync::Arc};

use baatcheet_core::{Provider, TestClock};
use baatcheet_pool::{KeyPool, ProviderKeys, MAX_CONSECUTIVE_ERRORS};
use proptest::prelude::*;

fn keys(provider: Provider, count: usize, daily_limit: u32) -> ProviderKeys {
    let secrets = (0..count).map(|i| format!("{provider}-secret-{i:03}")).collect();
    ProviderKeys::new(provider, secrets).with_daily_limit(daily_limit)
}

fn pool(entry: ProviderKeys) -> KeyPool {
    KeyPool::new([entry], Arc::new(TestClock::new()))
}

proptest! {
    /// With n usable keys, any n consecutive acquisitions hit n distinct
    /// keys, so usage never drifts more than one apart.
    #[test]
    fn rotation_is_fair(key_count in 1usize..8, rounds in 1usize..20) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let pool = pool(keys(Provider::Groq, key_count, 10_000));
            let mut counts: HashMap<u32, usize> = HashMap::new();

            for _ in 0..rounds {
                let mut window = Vec::with_capacity(key_count);
                for _ in 0..key_count {
                    let lease = pool.acquire(Provider::Groq).await.unwrap();
                    window.push(lease.index);
                    *counts.entry(lease.index).or_default() += 1;
                }
                window.sort_unstable();
                window.dedup();
                prop_assert_eq!(window.len(), key_count);
            }

            let min = counts.values().copied().min().unwrap_or(0);
            let max = counts.values().copied().max().unwrap_or(0);
            prop_assert_eq!(min, max);
            prop_assert_eq!(min, rounds);
            Ok(())
        })?;
    }

    /// No key is ever handed out past its daily limit, and the total handed
    /// out is exactly keys * limit.
    #[test]
    fn quota_is_never_exceeded(key_count in 1usize..6, daily_limit in 1u32..15, extra in 0usize..20) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let pool = pool(keys(Provider::Gemini, key_count, daily_limit));
            let capacity = key_count * daily_limit as usize;
            let mut granted = 0;

            for _ in 0..capacity + extra {
                if pool.acquire(Provider::Gemini).await.is_some() {
                    granted += 1;
                }
            }

            prop_assert_eq!(granted, capacity);
            let stats = pool.provider_stats(Provider::Gemini).await;
            prop_assert!(stats.keys.iter().all(|key| key.request_count <= daily_limit));
            prop_assert_eq!(stats.remaining_capacity, 0);
            prop_assert!(!pool.has_capacity(Provider::Gemini).await);
            Ok(())
        })?;
    }

    /// A key leaves rotation exactly at the error threshold.
    #[test]
    fn error_threshold_is_exact(errors in 0u32..10) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let pool = pool(keys(Provider::DeepSeek, 1, 100));

            for _ in 0..errors {
                pool.report_error(Provider::DeepSeek, 0, "upstream 502", false).await;
            }

            let usable = pool.acquire(Provider::DeepSeek).await.is_some();
            prop_assert_eq!(usable, errors < MAX_CONSECUTIVE_ERRORS);
            Ok(())
        })?;
    }
}
