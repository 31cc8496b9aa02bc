//! Recurring daily-reset check.
//!
//! The check compares UTC dates, so a reset can lag midnight by up to one
//! interval. After each reset, stored counters older than
//! [`USAGE_RETENTION_DAYS`] are pruned.

use std::{sync::Arc, time::Duration};

use chrono::Days;
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{pool::KeyPool, storage::UsageStore};

/// Default interval between date checks.
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Days of stored usage kept, today included.
pub const USAGE_RETENTION_DAYS: u64 = 7;

/// Spawns a task that calls [`KeyPool::check_daily_reset`] every `interval`
/// until `cancel` fires, pruning `store` whenever a new day starts.
pub fn spawn_daily_reset(
    pool: Arc<KeyPool>,
    store: Arc<dyn UsageStore>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if pool.check_daily_reset().await {
                        debug!("daily reset applied by scheduler");
                        prune_usage(&pool, store.as_ref()).await;
                    }
                },
            }
        }

        info!("daily reset scheduler stopped");
    })
}

async fn prune_usage(pool: &KeyPool, store: &dyn UsageStore) {
    let Some(cutoff) = pool.clock().today().checked_sub_days(Days::new(USAGE_RETENTION_DAYS - 1)) else {
        return;
    };

    match store.prune_before(cutoff).await {
        Ok(removed) => debug!(removed, cutoff = %cutoff, "pruned stored key usage"),
        Err(e) => warn!(error = %e, "failed to prune stored key usage"),
    }
}
