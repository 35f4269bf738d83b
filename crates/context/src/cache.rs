//! Bounded LRU cache of resolved message nodes.
//!
//! The LRU index lives behind a short `std::sync::Mutex` critical section that
//! is never held across an `.await`. Fetches for a missing id are
//! single-flight: concurrent callers for the same id queue on a per-key async
//! gate, while callers for other ids proceed independently. An invalidation
//! that lands while a fetch is in flight keeps that fetch's result out of the
//! cache.

use std::{
    collections::{BTreeMap, HashMap},
    future::Future,
    sync::{Arc, Mutex, MutexGuard},
};

use {dashmap::DashMap, tether_common::MessageId, tracing::debug};

use crate::{error::Result, node::Node};

struct Entry {
    node: Arc<Node>,
    last_access: u64,
}

/// Recency index: `by_access` maps access ticks to ids, oldest first.
///
/// `in_flight` holds ids whose fetch is running; the flag is set when the id
/// is invalidated before that fetch lands.
#[derive(Default)]
struct LruIndex {
    entries: HashMap<MessageId, Entry>,
    by_access: BTreeMap<u64, MessageId>,
    in_flight: HashMap<MessageId, bool>,
    tick: u64,
}

impl LruIndex {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn touch(&mut self, id: &MessageId) -> Option<Arc<Node>> {
        let tick = self.next_tick();
        let entry = self.entries.get_mut(id)?;
        self.by_access.remove(&entry.last_access);
        entry.last_access = tick;
        self.by_access.insert(tick, id.clone());
        Some(Arc::clone(&entry.node))
    }

    fn insert(&mut self, node: Arc<Node>, capacity: usize) {
        let tick = self.next_tick();
        let id = node.id.clone();
        if let Some(old) = self.entries.insert(id.clone(), Entry {
            node,
            last_access: tick,
        }) {
            self.by_access.remove(&old.last_access);
        }
        self.by_access.insert(tick, id);

        while self.entries.len() > capacity {
            let Some((_, evicted)) = self.by_access.pop_first() else {
                break;
            };
            self.entries.remove(&evicted);
            debug!(id = %evicted, "evicted message node");
        }
    }

    fn remove(&mut self, id: &MessageId) -> bool {
        let pending = match self.in_flight.get_mut(id) {
            Some(stale) => {
                *stale = true;
                true
            },
            None => false,
        };
        match self.entries.remove(id) {
            Some(entry) => {
                self.by_access.remove(&entry.last_access);
                true
            },
            None => pending,
        }
    }

    /// Close the in-flight mark for `id`, returning whether it went stale.
    fn land(&mut self, id: &MessageId) -> bool {
        self.in_flight.remove(id).unwrap_or(false)
    }
}

/// Concurrency-safe, capacity-bounded message cache.
pub struct MessageCache {
    capacity: usize,
    index: Mutex<LruIndex>,
    gates: DashMap<MessageId, Arc<tokio::sync::Mutex<()>>>,
}

impl MessageCache {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            index: Mutex::new(LruIndex::default()),
            gates: DashMap::new(),
        }
    }

    fn index(&self) -> MutexGuard<'_, LruIndex> {
        self.index
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Return the cached node for `id`, refreshing its recency, or run
    /// `fetch` and cache its result.
    ///
    /// A failed fetch stores nothing and yields `None`.
    pub async fn get_or_fetch<F, Fut>(&self, id: &MessageId, fetch: F) -> Option<Arc<Node>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Node>>,
    {
        let cached = self.index().touch(id);
        if cached.is_some() {
            return cached;
        }

        let gate = Arc::clone(self.gates.entry(id.clone()).or_default().value());
        let result = {
            let _flight = gate.lock().await;
            // Another caller may have filled the entry while we waited.
            let filled = {
                let mut index = self.index();
                let filled = index.touch(id);
                if filled.is_none() {
                    index.in_flight.insert(id.clone(), false);
                }
                filled
            };
            match filled {
                Some(node) => Some(node),
                None => {
                    let fetched = fetch().await;
                    let mut index = self.index();
                    let stale = index.land(id);
                    match fetched {
                        Ok(node) => {
                            let node = Arc::new(node);
                            if stale {
                                debug!(%id, "invalidated during fetch, not caching");
                            } else {
                                index.insert(Arc::clone(&node), self.capacity);
                            }
                            Some(node)
                        },
                        Err(e) => {
                            debug!(%id, error = %e, "message fetch failed");
                            None
                        },
                    }
                },
            }
        };

        self.gates.remove_if(id, |_, g| Arc::ptr_eq(g, &gate));
        result
    }

    /// Store a locally produced node, evicting as needed.
    pub fn insert(&self, node: Node) -> Arc<Node> {
        let node = Arc::new(node);
        self.index().insert(Arc::clone(&node), self.capacity);
        node
    }

    /// Drop the entry for `id`, and keep a fetch of `id` that is currently
    /// running from caching its result. Returns whether either applied.
    pub fn invalidate(&self, id: &MessageId) -> bool {
        self.index().remove(id)
    }

    /// Read without refreshing recency.
    #[must_use]
    pub fn peek(&self, id: &MessageId) -> Option<Arc<Node>> {
        self.index()
            .entries
            .get(id)
            .map(|entry| Arc::clone(&entry.node))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.index().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
