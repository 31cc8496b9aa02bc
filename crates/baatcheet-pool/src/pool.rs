//! Multi-key credential pool.
//!
//! Each provider owns a fixed list of key slots behind its own mutex, so the
//! read-filter-pick-increment sequence in [`KeyPool::acquire`] is atomic per
//! provider while different providers never contend.
//!
//! A slot is usable when it is available, under the daily limit, and has
//! fewer than [`MAX_CONSECUTIVE_ERRORS`] consecutive errors. Rotation is
//! round-robin over the usable subset only.

use std::{collections::BTreeMap, fmt, future::Future, sync::Arc};

use baatcheet_core::{Clock, KeyUsage, Provider};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{
    error::{PoolError, Result, UpstreamError},
    storage::UsageStore,
    usage::UsageRecorder,
};

/// Consecutive errors after which a key is taken out of rotation.
pub const MAX_CONSECUTIVE_ERRORS: u32 = 5;

/// Why a slot was taken out of rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DisableReason {
    /// Daily quota reached. Cleared only by the daily reset.
    Quota,
    /// Provider throttled the key. Cleared only by the daily reset.
    RateLimited,
    /// Too many consecutive errors. Cleared by the next reported success.
    Errors,
}

/// Credentials and limits for one provider.
#[derive(Clone)]
pub struct ProviderKeys {
    /// Provider these keys belong to.
    pub provider: Provider,
    /// Secrets in slot order.
    pub secrets: Vec<String>,
    /// Per-key daily request ceiling.
    pub daily_limit: u32,
    /// Endpoint the keys are presented to.
    pub base_url: String,
}

impl ProviderKeys {
    /// Keys with the provider's default limit and endpoint.
    pub fn new(provider: Provider, secrets: Vec<String>) -> Self {
        Self {
            provider,
            secrets,
            daily_limit: provider.default_daily_limit(),
            base_url: provider.default_base_url().to_string(),
        }
    }

    /// Overrides the per-key daily limit.
    #[must_use]
    pub fn with_daily_limit(mut self, daily_limit: u32) -> Self {
        self.daily_limit = daily_limit;
        self
    }

    /// Overrides the base endpoint.
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

impl fmt::Debug for ProviderKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderKeys")
            .field("provider", &self.provider)
            .field("keys", &self.secrets.len())
            .field("daily_limit", &self.daily_limit)
            .field("base_url", &self.base_url)
            .finish()
    }
}

/// A key handed out by [`KeyPool::acquire`].
///
/// The caller uses `secret` as the bearer credential against `base_url` and
/// reports the outcome with `index`.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyLease {
    /// Provider the key belongs to.
    pub provider: Provider,
    /// Slot index, used when reporting the outcome.
    pub index: u32,
    /// The credential.
    pub secret: String,
    /// Base endpoint.
    pub base_url: String,
}

impl fmt::Debug for KeyLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyLease")
            .field("provider", &self.provider)
            .field("index", &self.index)
            .field("secret", &mask(&self.secret))
            .field("base_url", &self.base_url)
            .finish()
    }
}

struct KeySlot {
    index: u32,
    secret: String,
    request_count: u32,
    available: bool,
    error_count: u32,
    last_error: Option<String>,
    last_used: Option<DateTime<Utc>>,
    disabled_reason: Option<DisableReason>,
}

impl KeySlot {
    fn new(index: u32, secret: String) -> Self {
        Self {
            index,
            secret,
            request_count: 0,
            available: true,
            error_count: 0,
            last_error: None,
            last_used: None,
            disabled_reason: None,
        }
    }

    fn is_usable(&self, daily_limit: u32) -> bool {
        self.available && self.request_count < daily_limit && self.error_count < MAX_CONSECUTIVE_ERRORS
    }

    /// Quota and rate-limit disablement take precedence over an error
    /// streak, so a later success cannot put the key back early.
    fn disable(&mut self, reason: DisableReason) {
        match self.disabled_reason {
            None | Some(DisableReason::Errors) => {
                self.available = false;
                self.disabled_reason = Some(reason);
            },
            Some(DisableReason::Quota | DisableReason::RateLimited) => {},
        }
    }

    fn reset(&mut self) {
        self.request_count = 0;
        self.error_count = 0;
        self.last_error = None;
        self.available = true;
        self.disabled_reason = None;
    }

    fn stats(&self, daily_limit: u32) -> KeyStats {
        KeyStats {
            index: self.index,
            key_hint: mask(&self.secret),
            request_count: self.request_count,
            available: self.is_usable(daily_limit),
            error_count: self.error_count,
            last_error: self.last_error.clone(),
            last_used: self.last_used,
            disabled_reason: self.disabled_reason,
        }
    }
}

struct ProviderPoolState {
    provider: Provider,
    // Day the request counters belong to.
    day: NaiveDate,
    slots: Vec<KeySlot>,
    cursor: usize,
    daily_limit: u32,
    base_url: String,
    healthy: bool,
}

impl ProviderPoolState {
    fn new(keys: ProviderKeys, day: NaiveDate) -> Self {
        let slots: Vec<KeySlot> = keys
            .secrets
            .into_iter()
            .enumerate()
            .map(|(index, secret)| KeySlot::new(u32::try_from(index).unwrap_or(u32::MAX), secret))
            .collect();
        let healthy = !slots.is_empty();

        Self {
            provider: keys.provider,
            day,
            slots,
            cursor: 0,
            daily_limit: keys.daily_limit,
            base_url: keys.base_url,
            healthy,
        }
    }

    fn slot_mut(&mut self, index: u32) -> Option<&mut KeySlot> {
        self.slots.iter_mut().find(|slot| slot.index == index)
    }

    fn has_capacity(&self) -> bool {
        self.slots.iter().any(|slot| slot.is_usable(self.daily_limit))
    }

    fn acquire(&mut self, now: DateTime<Utc>) -> Option<(KeyLease, KeyUsage)> {
        let daily_limit = self.daily_limit;
        let candidates: Vec<usize> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_usable(daily_limit))
            .map(|(position, _)| position)
            .collect();

        if candidates.is_empty() {
            return None;
        }

        let pick = candidates[self.cursor % candidates.len()];
        self.cursor = (self.cursor + 1) % candidates.len();

        let slot = &mut self.slots[pick];
        slot.request_count = slot.request_count.saturating_add(1);
        slot.last_used = Some(now);
        if slot.request_count >= daily_limit {
            slot.disable(DisableReason::Quota);
            info!(provider = %self.provider, slot = slot.index, limit = daily_limit, "key reached daily quota");
        }

        let lease = KeyLease {
            provider: self.provider,
            index: slot.index,
            secret: slot.secret.clone(),
            base_url: self.base_url.clone(),
        };
        let usage = KeyUsage {
            provider: self.provider,
            slot_index: slot.index,
            usage_date: self.day,
            request_count: slot.request_count,
        };
        Some((lease, usage))
    }

    fn reset(&mut self, day: NaiveDate) {
        for slot in &mut self.slots {
            slot.reset();
        }
        self.cursor = 0;
        self.day = day;
    }

    fn stats(&self) -> ProviderStats {
        let keys: Vec<KeyStats> = self.slots.iter().map(|slot| slot.stats(self.daily_limit)).collect();
        let remaining_capacity = self
            .slots
            .iter()
            .filter(|slot| slot.is_usable(self.daily_limit))
            .map(|slot| u64::from(self.daily_limit.saturating_sub(slot.request_count)))
            .sum();

        ProviderStats {
            provider: self.provider,
            healthy: self.healthy,
            total_keys: keys.len(),
            available_keys: keys.iter().filter(|key| key.available).count(),
            requests_today: keys.iter().map(|key| u64::from(key.request_count)).sum(),
            daily_limit: self.daily_limit,
            remaining_capacity,
            keys,
        }
    }
}

/// Read-only view of one key slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyStats {
    /// Slot index.
    pub index: u32,
    /// Masked secret.
    pub key_hint: String,
    /// Requests made today.
    pub request_count: u32,
    /// Whether the slot is currently in rotation.
    pub available: bool,
    /// Consecutive errors.
    pub error_count: u32,
    /// Most recent error message.
    pub last_error: Option<String>,
    /// Last acquisition.
    pub last_used: Option<DateTime<Utc>>,
    /// Why the slot was taken out of rotation.
    pub disabled_reason: Option<DisableReason>,
}

/// Read-only view of one provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderStats {
    /// Provider.
    pub provider: Provider,
    /// Coarse health flag.
    pub healthy: bool,
    /// Configured keys.
    pub total_keys: usize,
    /// Keys currently in rotation.
    pub available_keys: usize,
    /// Requests made today across all keys.
    pub requests_today: u64,
    /// Per-key daily limit.
    pub daily_limit: u32,
    /// Requests left today across keys still in rotation.
    pub remaining_capacity: u64,
    /// Per-key detail.
    pub keys: Vec<KeyStats>,
}

/// Snapshot of the whole pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Date of the last daily reset.
    pub last_reset: NaiveDate,
    /// Per-provider detail, in [`Provider::ALL`] order.
    pub providers: Vec<ProviderStats>,
}

/// Process-wide pool of provider credentials.
pub struct KeyPool {
    providers: BTreeMap<Provider, Mutex<ProviderPoolState>>,
    clock: Arc<dyn Clock>,
    recorder: Option<UsageRecorder>,
    last_reset: Mutex<NaiveDate>,
}

impl fmt::Debug for KeyPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPool")
            .field("providers", &self.providers.keys().collect::<Vec<_>>())
            .field("persistent", &self.recorder.is_some())
            .finish_non_exhaustive()
    }
}

impl KeyPool {
    /// Builds a pool from configured keys.
    ///
    /// Providers missing from `keys` get an empty slot list and start
    /// unhealthy. If a provider appears more than once, the last entry wins.
    pub fn new(keys: impl IntoIterator<Item = ProviderKeys>, clock: Arc<dyn Clock>) -> Self {
        let today = clock.today();
        let mut providers: BTreeMap<Provider, Mutex<ProviderPoolState>> = Provider::ALL
            .into_iter()
            .map(|provider| {
                (provider, Mutex::new(ProviderPoolState::new(ProviderKeys::new(provider, Vec::new()), today)))
            })
            .collect();

        for entry in keys {
            let provider = entry.provider;
            let state = ProviderPoolState::new(entry, today);
            info!(
                provider = %provider,
                keys = state.slots.len(),
                daily_limit = state.daily_limit,
                "configured provider keys"
            );
            providers.insert(provider, Mutex::new(state));
        }

        Self { providers, clock, recorder: None, last_reset: Mutex::new(today) }
    }

    /// Mirrors every acquisition into the usage queue.
    #[must_use]
    pub fn with_recorder(mut self, recorder: UsageRecorder) -> Self {
        self.recorder = Some(recorder);
        self
    }

    /// Clock the pool reads dates from.
    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    fn state(&self, provider: Provider) -> &Mutex<ProviderPoolState> {
        // Every provider is inserted in `new`.
        &self.providers[&provider]
    }

    /// Hands out the next usable key in round-robin order.
    ///
    /// Returns `None` when no key of `provider` is usable. The persisted
    /// count is dated with the day the counter belongs to, which lags the
    /// calendar until the next daily reset runs.
    pub async fn acquire(&self, provider: Provider) -> Option<KeyLease> {
        let now = self.clock.now_utc();
        let (lease, usage) = {
            let mut state = self.state(provider).lock().await;
            state.acquire(now)
        }?;

        debug!(provider = %provider, slot = lease.index, count = usage.request_count, "acquired key");

        if let Some(recorder) = &self.recorder {
            recorder.record(usage);
        }

        Some(lease)
    }

    /// Records a failed call made with slot `index`.
    ///
    /// A rate-limited key leaves rotation at once; any other error does so
    /// after [`MAX_CONSECUTIVE_ERRORS`] in a row.
    pub async fn report_error(&self, provider: Provider, index: u32, message: &str, is_rate_limited: bool) {
        let mut state = self.state(provider).lock().await;
        let Some(slot) = state.slot_mut(index) else {
            warn!(provider = %provider, slot = index, "error reported for unknown key slot");
            return;
        };

        slot.error_count = slot.error_count.saturating_add(1);
        slot.last_error = Some(message.to_string());

        if is_rate_limited {
            slot.disable(DisableReason::RateLimited);
            warn!(provider = %provider, slot = index, "key rate limited, removed from rotation");
        } else if slot.error_count >= MAX_CONSECUTIVE_ERRORS {
            slot.disable(DisableReason::Errors);
            warn!(
                provider = %provider,
                slot = index,
                errors = slot.error_count,
                error = message,
                "key disabled after consecutive errors"
            );
        } else {
            debug!(provider = %provider, slot = index, errors = slot.error_count, error = message, "key error");
        }
    }

    /// Records a successful call made with slot `index`.
    ///
    /// Clears the error streak. Availability is restored only if the key was
    /// disabled for errors; quota and rate-limit disablement stay until the
    /// daily reset.
    pub async fn report_success(&self, provider: Provider, index: u32) {
        let mut state = self.state(provider).lock().await;
        let Some(slot) = state.slot_mut(index) else {
            warn!(provider = %provider, slot = index, "success reported for unknown key slot");
            return;
        };

        slot.error_count = 0;
        slot.last_error = None;
        if slot.disabled_reason == Some(DisableReason::Errors) {
            slot.available = true;
            slot.disabled_reason = None;
            info!(provider = %provider, slot = index, "key restored to rotation");
        }
    }

    /// Whether any key of `provider` is usable right now.
    pub async fn has_capacity(&self, provider: Provider) -> bool {
        self.state(provider).lock().await.has_capacity()
    }

    /// Coarse provider health flag.
    pub async fn is_healthy(&self, provider: Provider) -> bool {
        self.state(provider).lock().await.healthy
    }

    /// Sets the coarse provider health flag.
    pub async fn set_healthy(&self, provider: Provider, healthy: bool) {
        let mut state = self.state(provider).lock().await;
        if state.healthy != healthy {
            info!(provider = %provider, healthy, "provider health changed");
        }
        state.healthy = healthy;
    }

    /// Number of configured keys for `provider`.
    pub async fn key_count(&self, provider: Provider) -> usize {
        self.state(provider).lock().await.slots.len()
    }

    /// Resets every counter and puts every key back into rotation.
    pub async fn reset_daily(&self) {
        let today = self.clock.today();
        for state in self.providers.values() {
            state.lock().await.reset(today);
        }
        *self.last_reset.lock().await = today;
        info!("daily key usage reset");
    }

    /// Runs [`reset_daily`](Self::reset_daily) once per UTC calendar date.
    ///
    /// Returns `true` if a reset happened.
    pub async fn check_daily_reset(&self) -> bool {
        let today = self.clock.today();
        {
            let mut last_reset = self.last_reset.lock().await;
            if *last_reset == today {
                return false;
            }
            *last_reset = today;
        }

        for state in self.providers.values() {
            state.lock().await.reset(today);
        }
        info!(date = %today, "daily key usage reset");
        true
    }

    /// Seeds today's counts from the usage store.
    ///
    /// Slots already at or over quota start out of rotation. Returns the
    /// number of slots seeded.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::Storage` if the store cannot be read.
    pub async fn seed_from(&self, store: &dyn UsageStore) -> Result<usize> {
        let today = self.clock.today();
        let usage = store.load_day(today).await?;
        let mut seeded = 0;

        for entry in usage {
            let mut state = self.state(entry.provider).lock().await;
            let daily_limit = state.daily_limit;
            let Some(slot) = state.slot_mut(entry.slot_index) else {
                debug!(provider = %entry.provider, slot = entry.slot_index, "stored usage for unconfigured key");
                continue;
            };

            slot.request_count = slot.request_count.max(entry.request_count);
            if slot.request_count >= daily_limit {
                slot.disable(DisableReason::Quota);
            }
            seeded += 1;
        }

        *self.last_reset.lock().await = today;
        info!(seeded, date = %today, "seeded key usage from store");
        Ok(seeded)
    }

    /// Snapshot of one provider.
    pub async fn provider_stats(&self, provider: Provider) -> ProviderStats {
        self.state(provider).lock().await.stats()
    }

    /// Snapshot of every provider.
    pub async fn stats(&self) -> PoolStats {
        let mut providers = Vec::with_capacity(self.providers.len());
        for provider in Provider::ALL {
            providers.push(self.provider_stats(provider).await);
        }
        PoolStats { last_reset: *self.last_reset.lock().await, providers }
    }

    /// Runs `call` with a pooled key, rotating to the next key on failures
    /// tied to the credential (HTTP 401, 403, 429).
    ///
    /// The outcome of every call is reported exactly once. At most one call
    /// per configured key is made.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::Exhausted` if no key could be acquired, or
    /// `PoolError::Upstream` with the last failure otherwise.
    pub async fn call_with_rotation<T, F, Fut>(&self, provider: Provider, mut call: F) -> Result<T>
    where
        F: FnMut(KeyLease) -> Fut,
        Fut: Future<Output = std::result::Result<T, UpstreamError>>,
    {
        let max_calls = self.key_count(provider).await;
        let mut last_error = None;

        for _ in 0..max_calls {
            let Some(lease) = self.acquire(provider).await else {
                break;
            };
            let index = lease.index;

            match call(lease).await {
                Ok(value) => {
                    self.report_success(provider, index).await;
                    return Ok(value);
                },
                Err(error) => {
                    self.report_error(provider, index, &error.message, error.is_rate_limited()).await;
                    if !error.is_key_specific() {
                        return Err(PoolError::upstream(provider, error));
                    }
                    debug!(provider = %provider, slot = index, %error, "rotating to next key");
                    last_error = Some(error);
                },
            }
        }

        Err(match last_error {
            Some(error) => PoolError::upstream(provider, error),
            None => PoolError::exhausted(provider),
        })
    }
}

fn mask(secret: &str) -> String {
    let visible = secret.len().saturating_sub(4);
    let suffix = secret.get(visible..).unwrap_or_default();
    format!("...{suffix}")
}
