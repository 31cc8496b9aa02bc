//! Signed webhook delivery for the BaatCheet core.
//!
//! Users register endpoints with the [`WebhookRegistry`]; application code
//! reports events to the [`EventDispatcher`], which hands every subscribed
//! registration to the [`DeliveryEngine`].
//!
//! Each delivery is signed with HMAC-SHA256 over the exact body bytes, sent
//! with a fixed timeout, and retried on a fixed schedule. Registrations that
//! keep failing are deactivated until their owner re-enables them.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use baatcheet_core::{OwnerId, RealClock, WebhookEventKind};
//! use baatcheet_delivery::{
//!     storage::memory::InMemoryWebhookStore, DeliveryEngine, EngineConfig, EventDispatcher,
//!     WebhookClient, WebhookRegistry,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(InMemoryWebhookStore::new());
//! let clock = Arc::new(RealClock::new());
//! let registry = Arc::new(WebhookRegistry::new(store.clone(), clock.clone()));
//! let engine = DeliveryEngine::new(
//!     store,
//!     WebhookClient::with_defaults()?,
//!     clock,
//!     EngineConfig::default(),
//!     CancellationToken::new(),
//! );
//! let dispatcher = EventDispatcher::new(registry.clone(), engine);
//!
//! let owner = OwnerId::new();
//! registry.register(owner, "https://example.com/hook", &["message.created"]).await?;
//! let report = dispatcher
//!     .dispatch(owner, WebhookEventKind::MessageCreated, serde_json::json!({"id": 1}))
//!     .await?;
//! println!("delivered to {} receivers", report.delivered_first_attempt());
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod client;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod registry;
pub mod retry;
pub mod signing;
pub mod storage;

pub use client::{ClientConfig, DeliveryResponse, WebhookClient};
pub use dispatcher::{DispatchFailure, DispatchReport, EventDispatcher, TestDeliveryResult};
pub use engine::{AttemptOutcome, DeliveryEngine, DeliveryTicket, EngineConfig, EngineStats};
pub use error::{DeliveryError, ErrorCategory, Result};
pub use registry::{RegistryError, WebhookRegistry, WebhookUpdate};
pub use retry::{RetryDecision, RetrySchedule};
pub use storage::{PostgresWebhookStore, WebhookStore};

/// Per-attempt HTTP timeout in seconds.
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 10;

/// Terminal delivery failures after which a registration is deactivated.
pub const DEFAULT_DISABLE_THRESHOLD: u32 = 10;
