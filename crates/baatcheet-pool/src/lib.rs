//! Multi-key provider credential pool for the BaatCheet backend.
//!
//! Rotates keys across upstream AI and API providers, enforces per-key daily
//! quotas, takes failing or throttled keys out of rotation, and picks a
//! provider for each task type. Counts live in memory; a background writer
//! mirrors them to a [`UsageStore`] so a restart resumes today's totals.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod credentials;
pub mod error;
pub mod pool;
pub mod reset;
pub mod selector;
pub mod storage;
pub mod usage;

pub use error::{PoolError, Result, UpstreamError};
pub use pool::{
    DisableReason, KeyLease, KeyPool, KeyStats, PoolStats, ProviderKeys, ProviderStats,
    MAX_CONSECUTIVE_ERRORS,
};
pub use reset::spawn_daily_reset;
pub use selector::{default_routes, ProviderSelector};
pub use storage::{PostgresUsageStore, UsageStore};
pub use usage::{usage_channel, UsageRecorder, UsageWriter};
