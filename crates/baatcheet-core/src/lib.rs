//! Core domain models, clock abstraction, and storage for the BaatCheet
//! governance core.
//!
//! The key pool and the webhook delivery engine both build on these types:
//! provider and task identifiers on one side, webhook registrations and
//! delivery records on the other, and a shared [`Clock`] so tests control
//! time.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod models;
pub mod storage;
pub mod time;

pub use error::{CoreError, Result};
pub use models::{
    DeliveryAttemptLog, DeliveryId, DeliveryRecord, DeliveryStatus, KeyUsage, OwnerId, Provider,
    TaskType, Webhook, WebhookEventKind, WebhookId, WebhookView, TEST_EVENT,
};
#[cfg(any(test, feature = "test-util"))]
pub use time::TestClock;
pub use time::{Clock, RealClock};
