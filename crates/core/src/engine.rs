//! GenerationEngine trait — the abstraction over generation backends.
//!
//! An engine accepts a session-scoped transcript plus merged parameters and
//! produces an ordered stream of `GenerationEvent`s over an mpsc channel.
//! The dispatcher calls `stream()` without knowing which backend is behind
//! it — pure polymorphism.
//!
//! Implementations: Local (candle, on-device) and Heavy (remote
//! OpenAI-compatible endpoint).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::message::{Message, SessionId};

/// A single event in a generation stream.
///
/// Per call the event order is fixed: at most one `First`, zero or more
/// `Token`, exactly one terminal `Done`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GenerationEvent {
    /// Emitted before the first token; carries time-to-first-token.
    First { ms: u64 },

    /// A partial text token.
    Token { text: String },

    /// The stream is complete.
    Done,
}

impl GenerationEvent {
    /// Wire name for this event type.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::First { .. } => "first",
            Self::Token { .. } => "token",
            Self::Done => "done",
        }
    }
}

/// Generation parameters. All fields optional so a caller-supplied value
/// can be merged over tier defaults — caller wins when present.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    /// Maximum tokens to generate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Context window the engine should budget for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_window: Option<u32>,

    /// Sampling temperature (0.0 = deterministic)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    /// Model identifier override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl GenerationParams {
    /// Merge `self` (caller-supplied) over `defaults` (tier config).
    /// Caller values win when present.
    pub fn merged_over(&self, defaults: &GenerationParams) -> GenerationParams {
        GenerationParams {
            max_tokens: self.max_tokens.or(defaults.max_tokens),
            context_window: self.context_window.or(defaults.context_window),
            temperature: self.temperature.or(defaults.temperature),
            model: self.model.clone().or_else(|| defaults.model.clone()),
        }
    }
}

/// Readiness of a single engine. Health never errors — an unreachable
/// backend reports a structured status instead of raising.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineStatus {
    /// Loaded and ready to generate
    Ready,
    /// Usable, but the model has not been loaded yet (lazy init)
    Cold,
    /// No backend declared in policy
    NotConfigured,
    /// Configured but the backend cannot be reached
    Unreachable,
}

/// Health snapshot for one engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineHealth {
    /// Engine name ("local", "heavy")
    pub name: String,

    /// Readiness status
    pub status: EngineStatus,

    /// Model currently configured/loaded, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Free-form detail (hardware profile, unreachable cause)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// The receiving half of a generation stream.
pub type EventStream = tokio::sync::mpsc::Receiver<std::result::Result<GenerationEvent, EngineError>>;

/// The core engine trait.
///
/// `stream()` is session-affine: engines may keep per-session generation
/// contexts (warmed state) keyed by the id, so callers must guarantee at
/// most one in-flight call per session. That guarantee lives in the
/// session gate, not here.
#[async_trait]
pub trait GenerationEngine: Send + Sync {
    /// A short name for this engine ("local", "heavy").
    fn name(&self) -> &str;

    /// Stream a generation for the given session and transcript.
    async fn stream(
        &self,
        session_id: &SessionId,
        messages: &[Message],
        params: &GenerationParams,
    ) -> std::result::Result<EventStream, EngineError>;

    /// Health probe. Must never error.
    async fn health(&self) -> EngineHealth;
}
