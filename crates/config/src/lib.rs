//! Routing-policy configuration for Valet.
//!
//! Loads the policy document from `~/.valet/policy.toml` with environment
//! variable overrides, and validates all settings at startup. The policy
//! declares per-tier generation defaults, the global routing toggles, the
//! optional heavy-tier endpoint, and the session-cache capacities.
//! It is read-only at request time.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use valet_core::{GenerationParams, Tier};

/// The root policy document.
///
/// Maps directly to `~/.valet/policy.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Persona system prompt seeded into every new session transcript.
    #[serde(default = "default_persona")]
    pub persona: String,

    /// Retry a failed non-primary call once against the local engine.
    #[serde(default = "default_true")]
    pub fallback_enabled: bool,

    /// Emit a structured log record per routing decision.
    #[serde(default = "default_true")]
    pub log_routing_decisions: bool,

    /// Local model alias or path to a .gguf file.
    #[serde(default = "default_local_model")]
    pub local_model: String,

    /// Per-tier generation defaults.
    #[serde(default)]
    pub tiers: TierTable,

    /// Heavy-tier backend. Absence of an endpoint disables the heavy
    /// tier transparently — hard-class requests run on the local engine.
    #[serde(default)]
    pub heavy: HeavyConfig,

    /// Session-cache capacities and busy policy.
    #[serde(default)]
    pub session: SessionConfig,

    /// Gateway binding.
    #[serde(default)]
    pub gateway: GatewayConfig,
}

fn default_persona() -> String {
    "You are Valet, a concise home assistant. Answer briefly and helpfully.".into()
}
fn default_true() -> bool {
    true
}
fn default_local_model() -> String {
    "tinyllama".into()
}

impl std::fmt::Debug for PolicyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyConfig")
            .field("persona", &self.persona)
            .field("fallback_enabled", &self.fallback_enabled)
            .field("log_routing_decisions", &self.log_routing_decisions)
            .field("local_model", &self.local_model)
            .field("tiers", &self.tiers)
            .field("heavy", &self.heavy)
            .field("session", &self.session)
            .field("gateway", &self.gateway)
            .finish()
    }
}

/// Generation defaults for the three tiers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierTable {
    #[serde(default = "default_router_tier")]
    pub router: TierConfig,

    #[serde(default = "default_primary_tier")]
    pub primary: TierConfig,

    #[serde(default = "default_heavy_tier")]
    pub heavy: TierConfig,
}

impl TierTable {
    /// Defaults for one tier.
    pub fn get(&self, tier: Tier) -> &TierConfig {
        match tier {
            Tier::Router => &self.router,
            Tier::Primary => &self.primary,
            Tier::Heavy => &self.heavy,
        }
    }
}

impl Default for TierTable {
    fn default() -> Self {
        Self {
            router: default_router_tier(),
            primary: default_primary_tier(),
            heavy: default_heavy_tier(),
        }
    }
}

/// Generation defaults for one tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierConfig {
    pub max_tokens: u32,
    pub context_window: u32,
    pub temperature: f32,

    /// Candidate model identifiers in preference order.
    #[serde(default)]
    pub models: Vec<String>,
}

impl TierConfig {
    /// This tier's defaults as mergeable generation parameters.
    pub fn params(&self) -> GenerationParams {
        GenerationParams {
            max_tokens: Some(self.max_tokens),
            context_window: Some(self.context_window),
            temperature: Some(self.temperature),
            model: self.models.first().cloned(),
        }
    }
}

fn default_router_tier() -> TierConfig {
    TierConfig {
        max_tokens: 96,
        context_window: 2048,
        temperature: 0.3,
        models: vec![],
    }
}

fn default_primary_tier() -> TierConfig {
    TierConfig {
        max_tokens: 256,
        context_window: 4096,
        temperature: 0.7,
        models: vec![],
    }
}

fn default_heavy_tier() -> TierConfig {
    TierConfig {
        max_tokens: 1024,
        context_window: 8192,
        temperature: 0.7,
        models: vec![],
    }
}

/// Heavy-tier backend declaration.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct HeavyConfig {
    /// OpenAI-compatible base URL. None = heavy tier disabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// API key for the endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

impl HeavyConfig {
    /// Whether a heavy backend is declared at all.
    pub fn is_configured(&self) -> bool {
        self.endpoint.is_some()
    }
}

impl std::fmt::Debug for HeavyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeavyConfig")
            .field("endpoint", &self.endpoint)
            .field("api_key", &redact(&self.api_key))
            .finish()
    }
}

/// Redact a secret for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

/// What a second request to an already-busy session does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusyPolicy {
    /// Wait for the in-flight generation to finish (FIFO).
    Queue,
    /// Fail fast with a session-busy error.
    Reject,
}

/// Session-cache capacities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Transcript registry capacity.
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    /// Idle TTL before a session is eligible for expiry eviction.
    #[serde(default = "default_session_timeout_secs")]
    pub session_timeout_secs: u64,

    /// Generation-context registry capacity (deliberately smaller than
    /// `max_sessions`; contexts are heavyweight and recreated on demand).
    #[serde(default = "default_max_contexts")]
    pub max_contexts: usize,

    /// Same-session concurrency policy.
    #[serde(default = "default_busy_policy")]
    pub busy_policy: BusyPolicy,
}

fn default_max_sessions() -> usize {
    64
}
fn default_session_timeout_secs() -> u64 {
    1800
}
fn default_max_contexts() -> usize {
    4
}
fn default_busy_policy() -> BusyPolicy {
    BusyPolicy::Queue
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_sessions: default_max_sessions(),
            session_timeout_secs: default_session_timeout_secs(),
            max_contexts: default_max_contexts(),
            busy_policy: default_busy_policy(),
        }
    }
}

/// Gateway binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".into()
}
fn default_port() -> u16 {
    3000
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl PolicyConfig {
    /// Load from the default location, honoring environment overrides:
    ///
    /// - `VALET_CONFIG` (path to the policy file)
    /// - `VALET_HEAVY_ENDPOINT` / `VALET_HEAVY_API_KEY`
    /// - `VALET_MODEL` (local model alias/path)
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::load_from(&Self::policy_path())?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Policy file location: `VALET_CONFIG` when set, otherwise
    /// `~/.valet/policy.toml`.
    pub fn policy_path() -> PathBuf {
        match std::env::var_os("VALET_CONFIG") {
            Some(path) => PathBuf::from(path),
            None => Self::config_dir().join("policy.toml"),
        }
    }

    /// Load from a specific file path (no environment overrides).
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No policy file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(endpoint) = std::env::var("VALET_HEAVY_ENDPOINT") {
            if !endpoint.is_empty() {
                self.heavy.endpoint = Some(endpoint);
            }
        }
        if self.heavy.api_key.is_none() {
            self.heavy.api_key = std::env::var("VALET_HEAVY_API_KEY").ok();
        }
        if let Ok(model) = std::env::var("VALET_MODEL") {
            self.local_model = model;
        }
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".valet")
    }

    /// Validate the policy.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, tier) in [
            ("router", &self.tiers.router),
            ("primary", &self.tiers.primary),
            ("heavy", &self.tiers.heavy),
        ] {
            if tier.temperature < 0.0 || tier.temperature > 2.0 {
                return Err(ConfigError::ValidationError(format!(
                    "tiers.{name}.temperature must be between 0.0 and 2.0"
                )));
            }
            if tier.max_tokens == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "tiers.{name}.max_tokens must be > 0"
                )));
            }
        }

        if self.session.max_sessions == 0 {
            return Err(ConfigError::ValidationError(
                "session.max_sessions must be > 0".into(),
            ));
        }
        if self.session.max_contexts == 0 {
            return Err(ConfigError::ValidationError(
                "session.max_contexts must be > 0".into(),
            ));
        }
        if self.session.max_contexts > self.session.max_sessions {
            return Err(ConfigError::ValidationError(
                "session.max_contexts must not exceed session.max_sessions".into(),
            ));
        }

        Ok(())
    }

}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            persona: default_persona(),
            fallback_enabled: true,
            log_routing_decisions: true,
            local_model: default_local_model(),
            tiers: TierTable::default(),
            heavy: HeavyConfig::default(),
            session: SessionConfig::default(),
            gateway: GatewayConfig::default(),
        }
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read policy file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse policy file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Policy validation failed: {0}")]
    ValidationError(String),
}
