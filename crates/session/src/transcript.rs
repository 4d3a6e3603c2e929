//! Transcript registry.
//!
//! Keeps per-session conversation history in memory. Sessions are
//! created on first reference, seeded with the persona system message,
//! and handed out by value — the map is never shared by reference.
//!
//! Capacity is enforced synchronously after every creation: expired
//! sessions go first (TTL on last access), then least-recently-accessed
//! sessions until the registry is back at capacity. Eviction is a
//! policy action, not an error; it is logged for observability.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{debug, info};

use valet_core::{Message, Session, SessionId};

pub struct TranscriptStore {
    sessions: RwLock<HashMap<String, Session>>,
    max_sessions: usize,
    session_ttl: Duration,
    persona: String,
}

impl TranscriptStore {
    pub fn new(max_sessions: usize, session_ttl: Duration, persona: impl Into<String>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_sessions,
            session_ttl,
            persona: persona.into(),
        }
    }

    /// Fetch the session, creating it (with the persona seed message) if
    /// absent. Refreshes the access time either way.
    pub async fn get_or_create(&self, id: &SessionId) -> Session {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get_mut(id.as_str()) {
            session.touch();
            return session.clone();
        }

        debug!(session_id = %id, "Creating new session");
        let session = Session::new(id.clone(), &self.persona);
        sessions.insert(id.as_str().to_string(), session.clone());
        self.enforce_capacity(&mut sessions);
        session
    }

    /// Append a user message, creating the session if needed.
    pub async fn append_user(&self, id: &SessionId, content: impl Into<String>) -> Session {
        self.append(id, Message::user(content)).await
    }

    /// Append an assistant message, creating the session if needed.
    pub async fn append_assistant(&self, id: &SessionId, content: impl Into<String>) -> Session {
        self.append(id, Message::assistant(content)).await
    }

    async fn append(&self, id: &SessionId, message: Message) -> Session {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get_mut(id.as_str()) {
            session.push(message);
            return session.clone();
        }

        let mut session = Session::new(id.clone(), &self.persona);
        session.push(message);
        sessions.insert(id.as_str().to_string(), session.clone());
        self.enforce_capacity(&mut sessions);
        session
    }

    /// Delete the session entirely. Returns whether it existed.
    pub async fn reset(&self, id: &SessionId) -> bool {
        let removed = self.sessions.write().await.remove(id.as_str()).is_some();
        if removed {
            info!(session_id = %id, "Session reset");
        }
        removed
    }

    /// Current transcript for a session, if it exists.
    pub async fn messages(&self, id: &SessionId) -> Option<Vec<Message>> {
        self.sessions
            .read()
            .await
            .get(id.as_str())
            .map(|s| s.messages.clone())
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// TTL pass, then LRU until back at capacity. Runs under the write
    /// lock so the size invariant holds when the public call returns.
    fn enforce_capacity(&self, sessions: &mut HashMap<String, Session>) {
        if sessions.len() <= self.max_sessions {
            return;
        }

        let now = chrono::Utc::now();
        let ttl = chrono::Duration::from_std(self.session_ttl)
            .unwrap_or_else(|_| chrono::Duration::seconds(i64::MAX / 2));
        let expired: Vec<String> = sessions
            .iter()
            .filter(|(_, s)| now - s.last_accessed_at > ttl)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            sessions.remove(id);
            info!(session_id = %id, "Evicted expired session");
        }

        while sessions.len() > self.max_sessions {
            let oldest = sessions
                .iter()
                .min_by_key(|(_, s)| s.last_accessed_at)
                .map(|(id, _)| id.clone());
            match oldest {
                Some(id) => {
                    sessions.remove(&id);
                    info!(session_id = %id, "Evicted least-recently-used session");
                }
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use valet_core::Role;

    fn store(max: usize) -> TranscriptStore {
        TranscriptStore::new(max, Duration::from_secs(1800), "You are a test assistant.")
    }

    #[tokio::test]
    async fn creation_seeds_persona() {
        let store = store(8);
        let session = store.get_or_create(&SessionId::from("a")).await;
        assert_eq!(session.messages.len(), 1);
        assert_eq!(session.messages[0].role, Role::System);
        assert!(session.messages[0].content.contains("test assistant"));
    }

    #[tokio::test]
    async fn get_or_create_is_idempotent() {
        let store = store(8);
        let id = SessionId::from("a");
        store.append_user(&id, "hello").await;
        let session = store.get_or_create(&id).await;
        assert_eq!(session.messages.len(), 2);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn appends_preserve_order() {
        let store = store(8);
        let id = SessionId::from("a");
        store.append_user(&id, "first").await;
        store.append_assistant(&id, "second").await;
        let session = store.append_user(&id, "third").await;
        let contents: Vec<&str> = session.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, ["You are a test assistant.", "first", "second", "third"]);
    }

    #[tokio::test]
    async fn capacity_enforced_after_every_create() {
        let store = store(3);
        for i in 0..10 {
            store.get_or_create(&SessionId::from(format!("s{i}"))).await;
            assert!(store.len().await <= 3);
        }
        assert_eq!(store.len().await, 3);
    }

    #[tokio::test]
    async fn lru_evicts_least_recently_accessed() {
        let store = store(2);
        let a = SessionId::from("a");
        let b = SessionId::from("b");
        store.get_or_create(&a).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        store.get_or_create(&b).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        // Touch "a" so "b" becomes the LRU victim.
        store.get_or_create(&a).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        store.get_or_create(&SessionId::from("c")).await;

        assert!(store.messages(&a).await.is_some());
        assert!(store.messages(&b).await.is_none());
    }

    #[tokio::test]
    async fn expired_sessions_evicted_first() {
        let store = TranscriptStore::new(2, Duration::from_millis(1), "p");
        let stale = SessionId::from("stale");
        store.get_or_create(&stale).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let fresh = SessionId::from("fresh");
        store.get_or_create(&fresh).await;
        store.get_or_create(&SessionId::from("newer")).await;

        assert!(store.messages(&stale).await.is_none());
        assert!(store.messages(&fresh).await.is_some());
    }

    #[tokio::test]
    async fn reset_removes_session() {
        let store = store(8);
        let id = SessionId::from("a");
        store.append_user(&id, "hello").await;
        assert!(store.reset(&id).await);
        assert!(!store.reset(&id).await);
        assert!(store.is_empty().await);
    }
}
