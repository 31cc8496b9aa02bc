//! Configuration for the BaatCheet governance core.

use std::{collections::BTreeMap, time::Duration};

use anyhow::{Context, Result};
use baatcheet_core::Provider;
use baatcheet_delivery::{ClientConfig, EngineConfig, RetrySchedule};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

const CONFIG_FILE: &str = "config.toml";

/// Service configuration with defaults, file, and environment overrides.
///
/// Configuration is loaded in priority order:
/// 1. Environment variables (highest priority)
/// 2. Configuration file (`config.toml`)
/// 3. Built-in defaults (lowest priority)
///
/// Provider credentials are not part of this struct; they are discovered
/// from `<PROVIDER>_API_KEY`, `<PROVIDER>_API_KEY_2`, ... at startup.
///
/// # Example
///
/// ```no_run
/// use baatcheet::Config;
///
/// let config = Config::load().expect("Failed to load configuration");
/// println!("webhooks disable after {} failures", config.webhook_disable_threshold);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    // Database
    /// PostgreSQL connection URL. Without one, state is kept in memory only.
    ///
    /// Environment variable: `DATABASE_URL`
    #[serde(default, alias = "DATABASE_URL")]
    pub database_url: Option<String>,
    /// Maximum number of database connections in the pool.
    ///
    /// Environment variable: `DATABASE_MAX_CONNECTIONS`
    #[serde(default = "default_max_connections", alias = "DATABASE_MAX_CONNECTIONS")]
    pub database_max_connections: u32,

    // Key pool
    /// Capacity of the usage persistence queue.
    ///
    /// Environment variable: `USAGE_QUEUE_CAPACITY`
    #[serde(default = "default_usage_queue_capacity", alias = "USAGE_QUEUE_CAPACITY")]
    pub usage_queue_capacity: usize,
    /// Seconds between daily reset checks.
    ///
    /// Environment variable: `RESET_CHECK_INTERVAL_SECONDS`
    #[serde(default = "default_reset_check_interval", alias = "RESET_CHECK_INTERVAL_SECONDS")]
    pub reset_check_interval_seconds: u64,
    /// Per-key daily limit overrides, keyed by provider id (`groq`,
    /// `serpapi`, ...).
    ///
    /// Environment variable: `DAILY_LIMITS` (for example `{groq=1000}`)
    #[serde(default, alias = "DAILY_LIMITS")]
    pub daily_limits: BTreeMap<String, u32>,

    // Delivery
    /// HTTP timeout for one webhook attempt in seconds.
    ///
    /// Environment variable: `DELIVERY_TIMEOUT_SECONDS`
    #[serde(default = "default_delivery_timeout", alias = "DELIVERY_TIMEOUT_SECONDS")]
    pub delivery_timeout_seconds: u64,
    /// Attempts per delivery, including the first.
    ///
    /// Environment variable: `DELIVERY_MAX_ATTEMPTS`
    #[serde(default = "default_max_attempts", alias = "DELIVERY_MAX_ATTEMPTS")]
    pub delivery_max_attempts: u32,
    /// Wait in seconds before each retry.
    ///
    /// Environment variable: `DELIVERY_BACKOFF_SECONDS` (for example `[1,5,25]`)
    #[serde(default = "default_backoff_seconds", alias = "DELIVERY_BACKOFF_SECONDS")]
    pub delivery_backoff_seconds: Vec<u64>,
    /// Terminal failures after which a webhook is deactivated.
    ///
    /// Environment variable: `WEBHOOK_DISABLE_THRESHOLD`
    #[serde(default = "default_disable_threshold", alias = "WEBHOOK_DISABLE_THRESHOLD")]
    pub webhook_disable_threshold: u32,

    // Logging
    /// Log filter.
    ///
    /// Environment variable: `RUST_LOG`
    #[serde(default = "default_log_level", alias = "RUST_LOG")]
    pub rust_log: String,
}

impl Config {
    /// Load configuration from defaults, config file, and environment variable
    /// overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be parsed or a value is invalid.
    pub fn load() -> Result<Self> {
        Self::from_figment(
            Figment::new()
                .merge(Serialized::defaults(Self::default()))
                .merge(Toml::file(CONFIG_FILE))
                .merge(Env::prefixed("")),
        )
    }

    /// Extracts and validates configuration from an assembled figment.
    ///
    /// # Errors
    ///
    /// Returns an error if extraction fails or a value is invalid.
    pub fn from_figment(figment: Figment) -> Result<Self> {
        let config: Self = figment.extract().context("Failed to load configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Per-key daily limit for `provider`, if overridden.
    pub fn daily_limit(&self, provider: Provider) -> Option<u32> {
        self.daily_limits.get(provider.as_str()).copied()
    }

    /// Interval of the daily reset check.
    pub fn reset_check_interval(&self) -> Duration {
        Duration::from_secs(self.reset_check_interval_seconds)
    }

    /// Convert to the webhook client configuration.
    pub fn to_client_config(&self) -> ClientConfig {
        ClientConfig { timeout: Duration::from_secs(self.delivery_timeout_seconds), ..ClientConfig::default() }
    }

    /// Convert to the delivery retry schedule.
    pub fn to_retry_schedule(&self) -> RetrySchedule {
        RetrySchedule {
            max_attempts: self.delivery_max_attempts,
            backoff: self.delivery_backoff_seconds.iter().copied().map(Duration::from_secs).collect(),
        }
    }

    /// Convert to the delivery engine configuration.
    pub fn to_engine_config(&self) -> EngineConfig {
        EngineConfig { schedule: self.to_retry_schedule(), disable_threshold: self.webhook_disable_threshold }
    }

    /// Get database URL with password masked for logging.
    pub fn database_url_masked(&self) -> Option<String> {
        self.database_url.as_deref().map(mask_password)
    }

    /// Validate configuration values.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first invalid value.
    pub fn validate(&self) -> Result<()> {
        if matches!(self.database_url.as_deref(), Some(url) if url.trim().is_empty()) {
            anyhow::bail!("database_url must not be empty when set");
        }

        if self.database_max_connections == 0 {
            anyhow::bail!("database max_connections must be greater than 0");
        }

        if self.usage_queue_capacity == 0 {
            anyhow::bail!("usage_queue_capacity must be greater than 0");
        }

        if self.reset_check_interval_seconds == 0 {
            anyhow::bail!("reset_check_interval_seconds must be greater than 0");
        }

        if self.delivery_timeout_seconds == 0 {
            anyhow::bail!("delivery_timeout_seconds must be greater than 0");
        }

        if self.delivery_max_attempts == 0 {
            anyhow::bail!("delivery_max_attempts must be greater than 0");
        }

        if self.delivery_max_attempts > 1 && self.delivery_backoff_seconds.is_empty() {
            anyhow::bail!("delivery_backoff_seconds must not be empty when retries are enabled");
        }

        if self.webhook_disable_threshold == 0 {
            anyhow::bail!("webhook_disable_threshold must be greater than 0");
        }

        for (provider, limit) in &self.daily_limits {
            provider
                .parse::<Provider>()
                .with_context(|| format!("daily_limits contains unknown provider '{provider}'"))?;
            if *limit == 0 {
                anyhow::bail!("daily limit for '{provider}' must be greater than 0");
            }
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            database_max_connections: default_max_connections(),
            usage_queue_capacity: default_usage_queue_capacity(),
            reset_check_interval_seconds: default_reset_check_interval(),
            daily_limits: BTreeMap::new(),
            delivery_timeout_seconds: default_delivery_timeout(),
            delivery_max_attempts: default_max_attempts(),
            delivery_backoff_seconds: default_backoff_seconds(),
            webhook_disable_threshold: default_disable_threshold(),
            rust_log: default_log_level(),
        }
    }
}

fn mask_password(url: &str) -> String {
    if let Some(at_pos) = url.find('@') {
        if let Some(colon_pos) = url[..at_pos].rfind(':') {
            if !url[colon_pos + 1..].starts_with("//") {
                let mut masked = url.to_string();
                masked.replace_range(colon_pos + 1..at_pos, "***");
                return masked;
            }
        }
    }
    url.to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_usage_queue_capacity() -> usize {
    baatcheet_pool::usage::DEFAULT_QUEUE_CAPACITY
}

fn default_reset_check_interval() -> u64 {
    baatcheet_pool::reset::DEFAULT_CHECK_INTERVAL.as_secs()
}

fn default_delivery_timeout() -> u64 {
    baatcheet_delivery::DEFAULT_TIMEOUT_SECONDS
}

fn default_max_attempts() -> u32 {
    RetrySchedule::default().max_attempts
}

fn default_backoff_seconds() -> Vec<u64> {
    RetrySchedule::default().backoff.iter().map(Duration::as_secs).collect()
}

fn default_disable_threshold() -> u32 {
    baatcheet_delivery::DEFAULT_DISABLE_THRESHOLD
}

fn default_log_level() -> String {
    "info,baatcheet=debug".to_string()
}
