//! Clock abstraction shared by the key pool and the delivery engine.
//!
//! Daily quota resets, retry scheduling, and audit timestamps all read time
//! through [`Clock`] so tests can roll the calendar over or skip a backoff
//! window without waiting on the wall clock.

use std::{
    future::Future,
    pin::Pin,
    time::{Duration, Instant, SystemTime},
};

use chrono::{DateTime, NaiveDate, Utc};

#[cfg(any(test, feature = "test-util"))]
pub use self::manual::TestClock;

/// Source of time for the governance core.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Returns the current instant for duration measurements.
    fn now(&self) -> Instant;

    /// Returns the current system time for timestamps.
    fn now_system(&self) -> SystemTime;

    /// Sleeps for the specified duration.
    ///
    /// The manual test clock advances its virtual time instead of waiting.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;

    /// Current wall time as a UTC timestamp.
    fn now_utc(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from(self.now_system())
    }

    /// Current UTC calendar date. Usage counters are partitioned by this.
    fn today(&self) -> NaiveDate {
        self.now_utc().date_naive()
    }
}

/// Production clock backed by the OS and tokio timers.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealClock;

impl RealClock {
    /// Creates a new real clock instance.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for RealClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn now_system(&self) -> SystemTime {
        SystemTime::now()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

#[cfg(any(test, feature = "test-util"))]
mod manual {
    use std::sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    };
    use std::time::UNIX_EPOCH;

    use super::*;

    /// Manually driven clock for deterministic tests.
    ///
    /// Clones share the same underlying time, so a clock handed to the pool and
    /// the engine can be advanced from the test body.
    #[derive(Debug, Clone)]
    pub struct TestClock {
        monotonic_ns: Arc<AtomicU64>,
        system_ns: Arc<AtomicU64>,
        base_instant: Instant,
    }

    impl TestClock {
        /// Creates a test clock starting at the current system time.
        pub fn new() -> Self {
            Self::with_start_time(SystemTime::now())
        }

        /// Creates a test clock starting at a specific system time.
        pub fn with_start_time(start: SystemTime) -> Self {
            Self {
                monotonic_ns: Arc::new(AtomicU64::new(0)),
                system_ns: Arc::new(AtomicU64::new(nanos_since_epoch(start))),
                base_instant: Instant::now(),
            }
        }

        /// Creates a test clock starting at a UTC timestamp.
        pub fn at(start: DateTime<Utc>) -> Self {
            Self::with_start_time(SystemTime::from(start))
        }

        /// Advances both monotonic and system time.
        pub fn advance(&self, duration: Duration) {
            let duration_ns = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
            self.monotonic_ns.fetch_add(duration_ns, Ordering::AcqRel);
            self.system_ns.fetch_add(duration_ns, Ordering::AcqRel);
        }

        /// Jumps system time to `time`. Monotonic time only ever moves forward.
        pub fn jump_to(&self, time: SystemTime) {
            let target_ns = nanos_since_epoch(time);
            let current_ns = self.system_ns.load(Ordering::Acquire);

            if target_ns > current_ns {
                self.advance(Duration::from_nanos(target_ns - current_ns));
            } else {
                self.system_ns.store(target_ns, Ordering::Release);
            }
        }

        /// Total virtual time elapsed since the clock was created.
        pub fn elapsed(&self) -> Duration {
            Duration::from_nanos(self.monotonic_ns.load(Ordering::Acquire))
        }
    }

    impl Default for TestClock {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Clock for TestClock {
        fn now(&self) -> Instant {
            self.base_instant + Duration::from_nanos(self.monotonic_ns.load(Ordering::Acquire))
        }

        fn now_system(&self) -> SystemTime {
            UNIX_EPOCH + Duration::from_nanos(self.system_ns.load(Ordering::Acquire))
        }

        fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
            self.advance(duration);
            Box::pin(tokio::task::yield_now())
        }
    }

    fn nanos_since_epoch(time: SystemTime) -> u64 {
        let since_epoch = time.duration_since(UNIX_EPOCH).unwrap_or_default();
        u64::try_from(since_epoch.as_nanos()).unwrap_or(u64::MAX)
    }
}
