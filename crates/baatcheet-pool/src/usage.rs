//! Background persistence of usage counters.
//!
//! `acquire` hands each new count to a [`UsageRecorder`], which pushes it onto
//! a bounded channel without waiting. A single [`UsageWriter`] task drains the
//! channel into the [`UsageStore`]. When the channel is full the write is
//! dropped and logged; the in-memory count is unaffected.

use std::sync::Arc;

use baatcheet_core::KeyUsage;
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::storage::UsageStore;

/// Default capacity of the usage queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Non-blocking producer side of the usage queue.
#[derive(Debug, Clone)]
pub struct UsageRecorder {
    tx: mpsc::Sender<KeyUsage>,
}

impl UsageRecorder {
    /// Enqueues a counter write. Returns `false` if the write was dropped.
    pub fn record(&self, usage: KeyUsage) -> bool {
        match self.tx.try_send(usage) {
            Ok(()) => true,
            Err(TrySendError::Full(usage)) => {
                warn!(
                    provider = %usage.provider,
                    slot = usage.slot_index,
                    count = usage.request_count,
                    "usage queue full, dropping persistence write"
                );
                false
            },
            Err(TrySendError::Closed(usage)) => {
                debug!(provider = %usage.provider, slot = usage.slot_index, "usage writer stopped");
                false
            },
        }
    }
}

/// Consumer side of the usage queue.
pub struct UsageWriter {
    rx: mpsc::Receiver<KeyUsage>,
    store: Arc<dyn UsageStore>,
}

/// Creates a connected recorder and writer pair.
pub fn usage_channel(capacity: usize, store: Arc<dyn UsageStore>) -> (UsageRecorder, UsageWriter) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (UsageRecorder { tx }, UsageWriter { rx, store })
}

impl UsageWriter {
    /// Drains the queue until cancelled or every recorder is dropped.
    ///
    /// On cancellation, writes already queued are flushed before returning.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut written = 0_u64;

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    while let Ok(usage) = self.rx.try_recv() {
                        written += u64::from(self.write(&usage).await);
                    }
                    break;
                },
                next = self.rx.recv() => match next {
                    Some(usage) => written += u64::from(self.write(&usage).await),
                    None => break,
                },
            }
        }

        info!(written, "usage writer stopped");
    }

    /// Spawns [`run`](Self::run) on the tokio runtime.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    async fn write(&self, usage: &KeyUsage) -> bool {
        match self.store.save(usage).await {
            Ok(()) => true,
            Err(error) => {
                warn!(
                    provider = %usage.provider,
                    slot = usage.slot_index,
                    %error,
                    "failed to persist key usage"
                );
                false
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use baatcheet_core::Provider;
    use chrono::NaiveDate;

    use super::*;
    use crate::storage::memory::InMemoryUsageStore;

    fn usage(slot_index: u32, request_count: u32) -> KeyUsage {
        KeyUsage {
            provider: Provider::DeepSeek,
            slot_index,
            usage_date: NaiveDate::from_ymd_opt(2026, 5, 4).unwrap(),
            request_count,
        }
    }

    #[tokio::test]
    async fn full_queue_drops_instead_of_blocking() {
        let store = Arc::new(InMemoryUsageStore::new());
        let (recorder, _writer) = usage_channel(2, store);

        assert!(recorder.record(usage(0, 1)));
        assert!(recorder.record(usage(0, 2)));
        assert!(!recorder.record(usage(0, 3)));
    }

    #[tokio::test]
    async fn closed_queue_reports_drop() {
        let store = Arc::new(InMemoryUsageStore::new());
        let (recorder, writer) = usage_channel(4, store);
        drop(writer);

        assert!(!recorder.record(usage(1, 1)));
    }

    #[tokio::test]
    async fn writer_flushes_queued_writes_on_cancel() {
        let store = Arc::new(InMemoryUsageStore::new());
        let (recorder, writer) = usage_channel(8, store.clone());

        recorder.record(usage(0, 1));
        recorder.record(usage(0, 2));
        recorder.record(usage(1, 1));

        let cancel = CancellationToken::new();
        cancel.cancel();
        writer.run(cancel).await;

        let day = NaiveDate::from_ymd_opt(2026, 5, 4).unwrap();
        assert_eq!(store.count(Provider::DeepSeek, 0, day).await, Some(2));
        assert_eq!(store.count(Provider::DeepSeek, 1, day).await, Some(1));
    }

    #[tokio::test]
    async fn writer_stops_when_recorders_are_dropped() {
        let store = Arc::new(InMemoryUsageStore::new());
        let (recorder, writer) = usage_channel(8, store.clone());
        let handle = writer.spawn(CancellationToken::new());

        recorder.record(usage(2, 9));
        drop(recorder);
        handle.await.unwrap();

        assert_eq!(store.len().await, 1);
    }
}
