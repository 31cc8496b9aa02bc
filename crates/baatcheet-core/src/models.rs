//! Core domain models and strongly-typed identifiers.
//!
//! Providers and task types describe the upstream side of the backend;
//! webhooks, delivery records, and attempt logs describe the outbound
//! notification side. Identifiers are UUID newtypes so a webhook id can never
//! be passed where an owner id is expected.

use std::{fmt, str::FromStr};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;

/// Event name used by the manual "send test webhook" path.
///
/// Not part of the subscribable vocabulary.
pub const TEST_EVENT: &str = "webhook.test";

/// Identity of the user or workspace that owns webhook registrations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(transparent)]
pub struct OwnerId(pub Uuid);

impl OwnerId {
    /// Creates a new random owner ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for OwnerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for OwnerId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Strongly-typed webhook registration identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(transparent)]
pub struct WebhookId(pub Uuid);

impl WebhookId {
    /// Creates a new random webhook ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for WebhookId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WebhookId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for WebhookId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Identifier of one triggered event for one registration.
///
/// Sent to receivers in the delivery header so they can de-duplicate
/// redelivered payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(transparent)]
pub struct DeliveryId(pub Uuid);

impl DeliveryId {
    /// Creates a new random delivery ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DeliveryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DeliveryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for DeliveryId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Upstream model/API provider whose credentials are pooled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    /// Groq hosted inference.
    Groq,
    /// OpenRouter model aggregator.
    OpenRouter,
    /// DeepSeek chat and reasoning models.
    DeepSeek,
    /// Hugging Face inference API.
    HuggingFace,
    /// Google Gemini.
    Gemini,
    /// OCR.space text extraction.
    OcrSpace,
    /// Brave web search.
    BraveSearch,
    /// SerpAPI web search.
    SerpApi,
    /// ElevenLabs text-to-speech.
    ElevenLabs,
}

impl Provider {
    /// Every provider, in a stable order.
    pub const ALL: [Self; 9] = [
        Self::Groq,
        Self::OpenRouter,
        Self::DeepSeek,
        Self::HuggingFace,
        Self::Gemini,
        Self::OcrSpace,
        Self::BraveSearch,
        Self::SerpApi,
        Self::ElevenLabs,
    ];

    /// Stable identifier used in storage and configuration.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Groq => "groq",
            Self::OpenRouter => "openrouter",
            Self::DeepSeek => "deepseek",
            Self::HuggingFace => "huggingface",
            Self::Gemini => "gemini",
            Self::OcrSpace => "ocr_space",
            Self::BraveSearch => "brave_search",
            Self::SerpApi => "serpapi",
            Self::ElevenLabs => "elevenlabs",
        }
    }

    /// Environment variable holding the first key. Additional keys use the
    /// same name with a `_<n>` suffix.
    pub const fn env_prefix(self) -> &'static str {
        match self {
            Self::Groq => "GROQ_API_KEY",
            Self::OpenRouter => "OPENROUTER_API_KEY",
            Self::DeepSeek => "DEEPSEEK_API_KEY",
            Self::HuggingFace => "HUGGINGFACE_API_KEY",
            Self::Gemini => "GEMINI_API_KEY",
            Self::OcrSpace => "OCR_SPACE_API_KEY",
            Self::BraveSearch => "BRAVE_SEARCH_KEY",
            Self::SerpApi => "SERPAPI_KEY",
            Self::ElevenLabs => "ELEVENLABS_API_KEY",
        }
    }

    /// Free-tier daily request ceiling applied to each key.
    pub const fn default_daily_limit(self) -> u32 {
        match self {
            Self::Groq => 14_400,
            Self::OpenRouter => 200,
            Self::DeepSeek => 10_000,
            Self::HuggingFace => 1_000,
            Self::Gemini => 1_500,
            Self::OcrSpace => 500,
            Self::BraveSearch => 60,
            Self::SerpApi => 5,
            Self::ElevenLabs => 300,
        }
    }

    /// Base endpoint the acquired key is presented to.
    pub const fn default_base_url(self) -> &'static str {
        match self {
            Self::Groq => "https://api.groq.com/openai/v1",
            Self::OpenRouter => "https://openrouter.ai/api/v1",
            Self::DeepSeek => "https://api.deepseek.com/v1",
            Self::HuggingFace => "https://api-inference.huggingface.co",
            Self::Gemini => "https://generativelanguage.googleapis.com/v1beta",
            Self::OcrSpace => "https://api.ocr.space/parse",
            Self::BraveSearch => "https://api.search.brave.com/res/v1",
            Self::SerpApi => "https://serpapi.com",
            Self::ElevenLabs => "https://api.elevenlabs.io/v1",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|provider| provider.as_str() == s)
            .ok_or_else(|| CoreError::invalid_input(format!("unknown provider '{s}'")))
    }
}

/// Kind of work a caller needs a provider for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// General conversation.
    Chat,
    /// Code generation and review.
    Code,
    /// Long-form reasoning.
    Reasoning,
    /// Image understanding.
    Vision,
    /// Text extraction from images and documents.
    Ocr,
    /// Text-to-speech.
    Tts,
    /// Live web search.
    WebSearch,
}

impl TaskType {
    /// Every task type.
    pub const ALL: [Self; 7] =
        [Self::Chat, Self::Code, Self::Reasoning, Self::Vision, Self::Ocr, Self::Tts, Self::WebSearch];

    /// Stable identifier.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Code => "code",
            Self::Reasoning => "reasoning",
            Self::Vision => "vision",
            Self::Ocr => "ocr",
            Self::Tts => "tts",
            Self::WebSearch => "web_search",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|task| task.as_str() == s)
            .ok_or_else(|| CoreError::invalid_input(format!("unknown task type '{s}'")))
    }
}

/// Fixed vocabulary of events a webhook may subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum WebhookEventKind {
    /// A conversation was started.
    #[serde(rename = "conversation.created")]
    ConversationCreated,
    /// A conversation was deleted.
    #[serde(rename = "conversation.deleted")]
    ConversationDeleted,
    /// A user message was stored.
    #[serde(rename = "message.created")]
    MessageCreated,
    /// An assistant reply finished streaming.
    #[serde(rename = "message.completed")]
    MessageCompleted,
    /// An uploaded image was analyzed.
    #[serde(rename = "image.analyzed")]
    ImageAnalyzed,
    /// An audio upload was transcribed.
    #[serde(rename = "audio.transcribed")]
    AudioTranscribed,
    /// A conversation export is ready.
    #[serde(rename = "export.completed")]
    ExportCompleted,
    /// The owner hit a usage ceiling.
    #[serde(rename = "usage.limit_reached")]
    UsageLimitReached,
}

impl WebhookEventKind {
    /// Every subscribable event.
    pub const ALL: [Self; 8] = [
        Self::ConversationCreated,
        Self::ConversationDeleted,
        Self::MessageCreated,
        Self::MessageCompleted,
        Self::ImageAnalyzed,
        Self::AudioTranscribed,
        Self::ExportCompleted,
        Self::UsageLimitReached,
    ];

    /// Wire name of the event.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ConversationCreated => "conversation.created",
            Self::ConversationDeleted => "conversation.deleted",
            Self::MessageCreated => "message.created",
            Self::MessageCompleted => "message.completed",
            Self::ImageAnalyzed => "image.analyzed",
            Self::AudioTranscribed => "audio.transcribed",
            Self::ExportCompleted => "export.completed",
            Self::UsageLimitReached => "usage.limit_reached",
        }
    }
}

impl fmt::Display for WebhookEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WebhookEventKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| CoreError::invalid_input(format!("unknown event '{s}'")))
    }
}

/// A subscriber endpoint registered by an owner.
///
/// Carries the raw signing secret; hand [`WebhookView`] to anything that
/// renders a registration after creation.
#[derive(Clone, PartialEq, Eq)]
pub struct Webhook {
    /// Unique identifier.
    pub id: WebhookId,
    /// Owner allowed to read, update, and remove this registration.
    pub owner_id: OwnerId,
    /// Target URL (`http` or `https`).
    pub url: String,
    /// Subscribed events; never empty.
    pub events: Vec<WebhookEventKind>,
    /// HMAC-SHA256 signing secret, hex-encoded.
    pub secret: String,
    /// Inactive registrations receive nothing.
    pub active: bool,
    /// Terminally failed deliveries since the last success.
    pub failure_count: u32,
    /// Last successful delivery.
    pub last_triggered_at: Option<DateTime<Utc>>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
}

impl Webhook {
    /// Whether the registration is active and subscribed to `event`.
    pub fn receives(&self, event: WebhookEventKind) -> bool {
        self.active && self.events.contains(&event)
    }

    /// Secret with everything but the last four characters hidden.
    pub fn masked_secret(&self) -> String {
        let visible = self.secret.len().saturating_sub(4);
        let suffix = self.secret.get(visible..).unwrap_or_default();
        format!("{}{suffix}", "*".repeat(visible.min(12)))
    }

    /// Read model safe to return after creation.
    pub fn view(&self) -> WebhookView {
        WebhookView {
            id: self.id,
            owner_id: self.owner_id,
            url: self.url.clone(),
            events: self.events.clone(),
            secret: self.masked_secret(),
            active: self.active,
            failure_count: self.failure_count,
            last_triggered_at: self.last_triggered_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

impl fmt::Debug for Webhook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Webhook")
            .field("id", &self.id)
            .field("owner_id", &self.owner_id)
            .field("url", &self.url)
            .field("events", &self.events)
            .field("secret", &"<redacted>")
            .field("active", &self.active)
            .field("failure_count", &self.failure_count)
            .field("last_triggered_at", &self.last_triggered_at)
            .finish_non_exhaustive()
    }
}

/// Masked read model of a [`Webhook`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookView {
    /// Unique identifier.
    pub id: WebhookId,
    /// Owner.
    pub owner_id: OwnerId,
    /// Target URL.
    pub url: String,
    /// Subscribed events.
    pub events: Vec<WebhookEventKind>,
    /// Masked secret.
    pub secret: String,
    /// Active flag.
    pub active: bool,
    /// Terminally failed deliveries since the last success.
    pub failure_count: u32,
    /// Last successful delivery.
    pub last_triggered_at: Option<DateTime<Utc>>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
}

/// Progress of one triggered event towards one registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    /// Awaiting its first attempt or a scheduled retry.
    Pending,
    /// Delivered with a 2xx response.
    Success,
    /// Retry budget exhausted.
    Failed,
}

impl DeliveryStatus {
    /// Terminal records are never mutated again.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }

    /// Storage representation.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            other => Err(CoreError::invalid_input(format!("unknown delivery status '{other}'"))),
        }
    }
}

/// State of one event's delivery to one webhook across all its attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    /// Delivery identifier, also sent as a header.
    pub id: DeliveryId,
    /// Registration this delivery targets.
    pub webhook_id: WebhookId,
    /// Event name.
    pub event: String,
    /// Exact serialized envelope bytes; signed and sent unchanged on every
    /// attempt.
    pub payload: Vec<u8>,
    /// Current status.
    pub status: DeliveryStatus,
    /// HTTP status of the most recent response, if any.
    pub last_status_code: Option<u16>,
    /// Attempts made so far.
    pub attempts: u32,
    /// When the next attempt is due; `None` once terminal.
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Error from the most recent failed attempt.
    pub last_error: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Time the record reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
}

impl DeliveryRecord {
    /// Creates a pending record with no attempts.
    pub fn pending(
        webhook_id: WebhookId,
        event: impl Into<String>,
        payload: Vec<u8>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: DeliveryId::new(),
            webhook_id,
            event: event.into(),
            payload,
            status: DeliveryStatus::Pending,
            last_status_code: None,
            attempts: 0,
            next_retry_at: None,
            last_error: None,
            created_at,
            completed_at: None,
        }
    }
}

/// Immutable audit entry for a single HTTP attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryAttemptLog {
    /// Delivery this attempt belongs to.
    pub delivery_id: DeliveryId,
    /// 1-based attempt number.
    pub attempt_number: u32,
    /// Response status, absent on network errors and timeouts.
    pub status_code: Option<u16>,
    /// Failure description, absent on success.
    pub error: Option<String>,
    /// When the attempt started.
    pub attempted_at: DateTime<Utc>,
    /// Wall duration of the HTTP exchange.
    pub duration_ms: u64,
    /// Retry scheduled as a result of this attempt.
    pub next_retry_at: Option<DateTime<Utc>>,
}

/// Persisted daily usage of one key slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyUsage {
    /// Provider owning the slot.
    pub provider: Provider,
    /// Ordinal index of the slot.
    pub slot_index: u32,
    /// Calendar date (UTC) the count belongs to.
    pub usage_date: NaiveDate,
    /// Requests made with the key that day.
    pub request_count: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_round_trips_through_str() {
        for provider in Provider::ALL {
            assert_eq!(provider.as_str().parse::<Provider>().unwrap(), provider);
        }
        assert!("mistral".parse::<Provider>().is_err());
    }

    #[test]
    fn event_vocabulary_rejects_unknown_names() {
        assert_eq!(
            "message.completed".parse::<WebhookEventKind>().unwrap(),
            WebhookEventKind::MessageCompleted
        );
        assert!("message.deleted".parse::<WebhookEventKind>().is_err());
        assert!(TEST_EVENT.parse::<WebhookEventKind>().is_err());
    }

    #[test]
    fn event_serde_uses_wire_names() {
        let json = serde_json::to_string(&WebhookEventKind::UsageLimitReached).unwrap();
        assert_eq!(json, "\"usage.limit_reached\"");
    }

    #[test]
    fn terminal_statuses() {
        assert!(!DeliveryStatus::Pending.is_terminal());
        assert!(DeliveryStatus::Success.is_terminal());
        assert!(DeliveryStatus::Failed.is_terminal());
    }

    #[test]
    fn masked_secret_shows_only_suffix() {
        let now = Utc::now();
        let webhook = Webhook {
            id: WebhookId::new(),
            owner_id: OwnerId::new(),
            url: "https://example.com/hook".to_string(),
            events: vec![WebhookEventKind::MessageCreated],
            secret: "a".repeat(60) + "beef",
            active: true,
            failure_count: 0,
            last_triggered_at: None,
            created_at: now,
            updated_at: now,
        };

        let masked = webhook.masked_secret();
        assert!(masked.ends_with("beef"));
        assert!(!masked.contains('a'));
        assert!(!format!("{webhook:?}").contains("beef"));
    }
}
