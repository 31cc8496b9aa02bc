//! Task-type based provider selection.

use std::{collections::HashMap, sync::Arc};

use baatcheet_core::{Provider, TaskType};
use tracing::{debug, warn};

use crate::pool::{KeyLease, KeyPool};

/// Ordered provider preferences for one task type.
pub type Route = Vec<Provider>;

/// Default preference order for every task type.
pub fn default_routes() -> HashMap<TaskType, Route> {
    use Provider::*;

    HashMap::from([
        (TaskType::Chat, vec![Groq, OpenRouter, DeepSeek, Gemini]),
        (TaskType::Code, vec![DeepSeek, Groq, OpenRouter, Gemini]),
        (TaskType::Reasoning, vec![DeepSeek, OpenRouter, Gemini]),
        (TaskType::Vision, vec![Gemini, OpenRouter, HuggingFace]),
        (TaskType::Ocr, vec![OcrSpace, Gemini]),
        (TaskType::Tts, vec![ElevenLabs, HuggingFace]),
        (TaskType::WebSearch, vec![BraveSearch, SerpApi]),
    ])
}

/// Picks a provider for a task by walking its route.
#[derive(Debug, Clone)]
pub struct ProviderSelector {
    pool: Arc<KeyPool>,
    routes: HashMap<TaskType, Route>,
}

impl ProviderSelector {
    /// Selector using [`default_routes`].
    pub fn new(pool: Arc<KeyPool>) -> Self {
        Self::with_routes(pool, default_routes())
    }

    /// Selector with custom routes. Task types without a route select
    /// nothing.
    pub fn with_routes(pool: Arc<KeyPool>, routes: HashMap<TaskType, Route>) -> Self {
        Self { pool, routes }
    }

    /// Route configured for `task`.
    pub fn route(&self, task: TaskType) -> &[Provider] {
        self.routes.get(&task).map(Vec::as_slice).unwrap_or_default()
    }

    /// First provider on the route that is healthy and has capacity.
    pub async fn select_provider(&self, task: TaskType) -> Option<Provider> {
        for &provider in self.route(task) {
            if self.pool.is_healthy(provider).await && self.pool.has_capacity(provider).await {
                debug!(task = %task, provider = %provider, "selected provider");
                return Some(provider);
            }
        }

        warn!(task = %task, "no healthy provider with capacity");
        None
    }

    /// Selects a provider and acquires one of its keys.
    ///
    /// Capacity can vanish between the check and the acquisition when other
    /// tasks race for the last key, so this keeps walking the route instead
    /// of giving up on the first miss. Each provider is tried at most once.
    pub async fn acquire_for(&self, task: TaskType) -> Option<(Provider, KeyLease)> {
        for &provider in self.route(task) {
            if !self.pool.is_healthy(provider).await {
                continue;
            }
            if let Some(lease) = self.pool.acquire(provider).await {
                return Some((provider, lease));
            }
        }

        warn!(task = %task, "no key available on any route provider");
        None
    }
}
