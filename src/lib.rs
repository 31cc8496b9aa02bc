//! BaatCheet governance core.
//!
//! Wires the provider key pool and the webhook delivery engine into one
//! application with layered configuration and an explicit lifecycle.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod app;
pub mod config;

pub use app::{App, AppStatus};
pub use config::Config;
