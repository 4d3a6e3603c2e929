//! Session and transcript domain types.
//!
//! A `Session` is the conversational state for one caller: an ordered
//! transcript of messages plus access timestamps used by the cache's
//! TTL and LRU policies. Sessions are owned exclusively by the session
//! store and are only mutated through its append operations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a session (one conversation with one caller).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The role of a message sender in a transcript.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System instructions (persona, rules)
    System,
    /// The end user
    User,
    /// The assistant's reply
    Assistant,
}

/// A single timestamped message in a transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique message ID
    pub id: String,

    /// Who sent this message
    pub role: Role,

    /// The text content
    pub content: String,

    /// Timestamp
    pub timestamp: DateTime<Utc>,
}

impl Message {
    fn with_role(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    /// Create a new system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role(Role::System, content)
    }

    /// Create a new user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role(Role::User, content)
    }

    /// Create a new assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role(Role::Assistant, content)
    }
}

/// One caller's conversational state: ordered transcript plus the
/// timestamps the cache's eviction policies key on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Unique session ID
    pub id: SessionId,

    /// Ordered transcript
    pub messages: Vec<Message>,

    /// When this session was created
    pub created_at: DateTime<Utc>,

    /// When this session was last read or written
    pub last_accessed_at: DateTime<Utc>,
}

impl Session {
    /// Create a session seeded with a persona system message.
    pub fn new(id: SessionId, persona: &str) -> Self {
        let now = Utc::now();
        Self {
            id,
            messages: vec![Message::system(persona)],
            created_at: now,
            last_accessed_at: now,
        }
    }

    /// Append a message and refresh the access timestamp.
    pub fn push(&mut self, message: Message) {
        self.last_accessed_at = Utc::now();
        self.messages.push(message);
    }

    /// Refresh the access timestamp without mutating the transcript.
    pub fn touch(&mut self) {
        self.last_accessed_at = Utc::now();
    }

    /// Rough token-count estimate for the transcript (4 chars ≈ 1 token).
    pub fn estimated_tokens(&self) -> usize {
        self.messages.iter().map(|m| m.content.len() / 4).sum()
    }
}
