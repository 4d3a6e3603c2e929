//! Session-scoped state for Valet.
//!
//! Three pieces with one lookup key (the session id) and deliberately
//! independent lifetimes:
//!
//! - [`TranscriptStore`]: lightweight, user-visible conversation
//!   history. TTL-then-LRU eviction, capacity checked after every
//!   creation.
//! - [`ContextRegistry`]: heavyweight engine-private context/handle
//!   pairs. Insertion-order FIFO eviction with a small capacity;
//!   entries are rebuilt transparently on next use.
//! - [`SessionGate`]: at-most-one in-flight generation per session,
//!   released on drop so cancellation can never wedge a session.
//!
//! Resetting a transcript does not evict the session's generation
//! context, and context eviction does not touch the transcript. Callers
//! must not assume the two co-expire.

mod context;
mod gate;
mod transcript;

pub use context::{ContextEntry, ContextRegistry};
pub use gate::{SessionGate, SessionPermit};
pub use transcript::TranscriptStore;
