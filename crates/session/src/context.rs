//! Generation-context registry.
//!
//! Engines keep expensive per-session state (a warmed model context)
//! alongside a cheap handle derived from it (decode position, token
//! history). The registry caches the pair keyed by session id so a
//! follow-up turn reuses the warmed state instead of rebuilding it.
//!
//! Eviction is insertion-order FIFO, not LRU: when the registry exceeds
//! capacity the single oldest-inserted entry is dropped. Contexts are
//! recreated transparently on next use, so the simpler policy buys
//! predictable memory at the cost of re-warming.
//!
//! Context lifetime is independent of transcript lifetime: resetting a
//! transcript does not evict its context, and vice versa.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Mutex;
use tracing::{debug, info};

use valet_core::{EngineError, SessionId};

/// A cached context/handle pair. The mutex serializes use of the pair;
/// the session gate upstream should make contention rare.
pub type ContextEntry<C, H> = Arc<Mutex<(C, H)>>;

pub struct ContextRegistry<C, H> {
    inner: Mutex<Inner<C, H>>,
    max_contexts: usize,
    evictions: AtomicU64,
}

struct Inner<C, H> {
    entries: HashMap<String, ContextEntry<C, H>>,
    /// Insertion order; ids may linger here after removal and are
    /// skipped during eviction.
    order: VecDeque<String>,
    /// Per-id build locks, so a slow factory for one session never
    /// blocks cache hits or builds for other sessions. Slots nobody
    /// holds are shed on the next lookup.
    building: HashMap<String, Arc<Mutex<()>>>,
}

impl<C, H> ContextRegistry<C, H> {
    pub fn new(max_contexts: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                order: VecDeque::new(),
                building: HashMap::new(),
            }),
            max_contexts,
            evictions: AtomicU64::new(0),
        }
    }

    /// Fetch the cached pair for `id`, or build one: `make_context`
    /// constructs the expensive context (async, may fail), then
    /// `derive_handle` builds the cheap handle from it.
    ///
    /// Concurrent first calls for the same id build once; the factory
    /// runs outside the registry lock, so other sessions keep hitting
    /// the cache (and building their own contexts) while it works.
    pub async fn get_or_create<F, Fut, G>(
        &self,
        id: &SessionId,
        make_context: F,
        derive_handle: G,
    ) -> Result<ContextEntry<C, H>, EngineError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<C, EngineError>>,
        G: FnOnce(&C) -> Result<H, EngineError>,
    {
        let build_lock = {
            let mut inner = self.inner.lock().await;
            if let Some(entry) = inner.entries.get(id.as_str()) {
                debug!(session_id = %id, "Reusing cached generation context");
                return Ok(entry.clone());
            }
            let lock = inner
                .building
                .entry(id.as_str().to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone();
            inner.building.retain(|_, l| Arc::strong_count(l) > 1);
            lock
        };
        let _building = build_lock.lock().await;

        // A concurrent caller may have finished the build while we
        // waited on its lock.
        {
            let inner = self.inner.lock().await;
            if let Some(entry) = inner.entries.get(id.as_str()) {
                debug!(session_id = %id, "Reusing cached generation context");
                return Ok(entry.clone());
            }
        }

        debug!(session_id = %id, "Building generation context");
        let context = make_context().await?;
        let handle = derive_handle(&context)?;
        let entry = Arc::new(Mutex::new((context, handle)));

        let mut inner = self.inner.lock().await;
        inner.entries.insert(id.as_str().to_string(), entry.clone());
        inner.order.push_back(id.as_str().to_string());

        while inner.entries.len() > self.max_contexts {
            match inner.order.pop_front() {
                Some(oldest) => {
                    if inner.entries.remove(&oldest).is_some() {
                        self.evictions.fetch_add(1, Ordering::Relaxed);
                        info!(session_id = %oldest, "Evicted oldest generation context");
                    }
                }
                None => break,
            }
        }

        Ok(entry)
    }

    /// Drop the context for one session, if cached.
    pub async fn remove(&self, id: &SessionId) -> bool {
        let mut inner = self.inner.lock().await;
        inner.entries.remove(id.as_str()).is_some()
    }

    /// Drop every cached context (shutdown path).
    pub async fn clear(&self) {
        let mut inner = self.inner.lock().await;
        let count = inner.entries.len();
        inner.entries.clear();
        inner.order.clear();
        if count > 0 {
            info!(count, "Cleared generation contexts");
        }
    }

    pub async fn contains(&self, id: &SessionId) -> bool {
        self.inner.lock().await.entries.contains_key(id.as_str())
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.entries.is_empty()
    }

    /// Contexts dropped by capacity eviction since construction.
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }
}
