//! Per-session generation gate.
//!
//! At most one generation may be in flight per session id: engines keep
//! per-session warmed contexts that are not safe under concurrent use.
//! The gate hands out a `SessionPermit` that releases on drop, so the
//! busy state clears on every exit path (completion, error, caller
//! abandoning the stream).
//!
//! Two acquisition modes mirror the configurable busy policy: `acquire`
//! queues FIFO behind the in-flight call, `try_acquire` fails fast with
//! a session-busy error. Distinct sessions never contend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::OwnedMutexGuard;
use tracing::debug;

use valet_core::{SessionError, SessionId};

type Slot = Arc<tokio::sync::Mutex<()>>;

/// Exclusive right to run a generation for one session. Dropping it
/// releases the session.
pub struct SessionPermit {
    _guard: OwnedMutexGuard<()>,
}

#[derive(Default)]
pub struct SessionGate {
    slots: Mutex<HashMap<String, Slot>>,
}

impl SessionGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait (FIFO) for exclusive access to the session.
    pub async fn acquire(&self, id: &SessionId) -> SessionPermit {
        let slot = self.slot(id);
        if slot.try_lock().is_err() {
            debug!(session_id = %id, "Session busy, queueing");
        }
        SessionPermit {
            _guard: slot.lock_owned().await,
        }
    }

    /// Fail fast if a generation is already in flight for the session.
    pub fn try_acquire(&self, id: &SessionId) -> Result<SessionPermit, SessionError> {
        let slot = self.slot(id);
        match slot.try_lock_owned() {
            Ok(guard) => Ok(SessionPermit { _guard: guard }),
            Err(_) => Err(SessionError::Busy(id.as_str().to_string())),
        }
    }

    /// Fetch or create the session's slot, shedding slots nobody holds
    /// or waits on so the map tracks live sessions only.
    fn slot(&self, id: &SessionId) -> Slot {
        let mut slots = self
            .slots
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let slot = slots
            .entry(id.as_str().to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        slots.retain(|_, s| Arc::strong_count(s) > 1);
        slot
    }
}
