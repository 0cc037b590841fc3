// SPDX-FileCopyrightText: 2026 Tessera Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-connection prepared statement cache with idle expiry.
//!
//! Entries own their native handle. Every way a handle leaves the cache
//! (replacement, expiry, invalidation, shutdown) goes through the eviction
//! hook exactly once, and the hook always runs outside the cache lock.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::trace;

/// Callback that closes a handle leaving the cache.
pub type EvictHook<H> = Box<dyn Fn(&str, H) + Send + Sync>;

struct Entry<H> {
    handle: H,
    generation: u64,
    last_access: Instant,
}

struct State<H> {
    entries: HashMap<String, Entry<H>>,
    next_generation: u64,
    closed: bool,
}

/// TTL cache from query text to a native statement handle.
pub struct StatementCache<H> {
    ttl: Duration,
    state: Mutex<State<H>>,
    on_evict: EvictHook<H>,
}

impl<H: Clone> StatementCache<H> {
    pub fn new(ttl: Duration, on_evict: EvictHook<H>) -> Self {
        Self {
            ttl,
            state: Mutex::new(State {
                entries: HashMap::new(),
                next_generation: 1,
                closed: false,
            }),
            on_evict,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<H>> {
        // Holders never panic mid-update, so a poisoned map is still consistent.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn evict(&self, evicted: Vec<(String, H)>) -> usize {
        let n = evicted.len();
        for (query, handle) in evicted {
            trace!(query = %query, "closing cached statement");
            (self.on_evict)(&query, handle);
        }
        if n > 0 {
            crate::telemetry::record_cache_evictions(n);
        }
        n
    }

    /// Look up `query`, refreshing its idle timer. Returns the handle and the
    /// generation ticket identifying this particular entry.
    pub fn get(&self, query: &str) -> Option<(H, u64)> {
        let now = Instant::now();
        let mut expired = Vec::new();
        let hit = {
            let mut state = self.lock();
            match state.entries.get_mut(query) {
                Some(entry) if now.duration_since(entry.last_access) < self.ttl => {
                    entry.last_access = now;
                    Some((entry.handle.clone(), entry.generation))
                }
                Some(_) => {
                    if let Some(entry) = state.entries.remove(query) {
                        expired.push((query.to_string(), entry.handle));
                    }
                    None
                }
                None => None,
            }
        };
        self.evict(expired);
        hit
    }

    /// Insert or replace `query`. The replaced handle, if any, is closed.
    ///
    /// Returns the new entry's generation, or `None` when the cache has been
    /// closed (the handle is closed immediately in that case).
    pub fn set(&self, query: &str, handle: H) -> Option<u64> {
        let mut evicted = Vec::new();
        let generation = {
            let mut state = self.lock();
            if state.closed {
                evicted.push((query.to_string(), handle));
                None
            } else {
                let generation = state.next_generation;
                state.next_generation += 1;
                let previous = state.entries.insert(
                    query.to_string(),
                    Entry {
                        handle,
                        generation,
                        last_access: Instant::now(),
                    },
                );
                if let Some(old) = previous {
                    evicted.push((query.to_string(), old.handle));
                }
                Some(generation)
            }
        };
        self.evict(evicted);
        generation
    }

    /// Drop `query` whatever its generation.
    pub fn invalidate(&self, query: &str) -> bool {
        let removed = self.lock().entries.remove(query);
        match removed {
            Some(entry) => self.evict(vec![(query.to_string(), entry.handle)]) == 1,
            None => false,
        }
    }

    /// Drop `query` only if it is still the entry identified by `generation`,
    /// so a concurrent replacement is not thrown away by a stale caller.
    pub fn invalidate_if(&self, query: &str, generation: u64) -> bool {
        let removed = {
            let mut state = self.lock();
            match state.entries.get(query) {
                Some(entry) if entry.generation == generation => state.entries.remove(query),
                _ => None,
            }
        };
        match removed {
            Some(entry) => self.evict(vec![(query.to_string(), entry.handle)]) == 1,
            None => false,
        }
    }

    /// Close every entry idle for longer than the TTL.
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<(String, H)> = {
            let mut state = self.lock();
            let stale: Vec<String> = state
                .entries
                .iter()
                .filter(|(_, e)| now.duration_since(e.last_access) >= self.ttl)
                .map(|(q, _)| q.clone())
                .collect();
            stale
                .into_iter()
                .filter_map(|q| state.entries.remove(&q).map(|e| (q, e.handle)))
                .collect()
        };
        self.evict(expired)
    }

    /// Close every entry but keep accepting new ones (connection reopened).
    pub fn clear(&self) -> usize {
        let drained: Vec<(String, H)> = self
            .lock()
            .entries
            .drain()
            .map(|(q, e)| (q, e.handle))
            .collect();
        self.evict(drained)
    }

    /// Close every entry and refuse further inserts.
    pub fn close_all(&self) -> usize {
        let drained: Vec<(String, H)> = {
            let mut state = self.lock();
            state.closed = true;
            state.entries.drain().map(|(q, e)| (q, e.handle)).collect()
        };
        self.evict(drained)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn recording_cache(ttl: Duration) -> (StatementCache<u32>, Arc<Mutex<Vec<(String, u32)>>>) {
        let closed = Arc::new(Mutex::new(Vec::new()));
        let sink = closed.clone();
        let cache = StatementCache::new(
            ttl,
            Box::new(move |q: &str, h: u32| sink.lock().unwrap().push((q.to_string(), h))),
        );
        (cache, closed)
    }

    #[test]
    fn get_after_set_returns_handle_and_generation() {
        let (cache, closed) = recording_cache(Duration::from_secs(60));
        let generation = cache.set("SELECT 1", 10).unwrap();
        assert_eq!(cache.get("SELECT 1"), Some((10, generation)));
        assert!(cache.get("SELECT 2").is_none());
        assert!(closed.lock().unwrap().is_empty());
    }

    #[test]
    fn replacement_closes_previous_handle() {
        let (cache, closed) = recording_cache(Duration::from_secs(60));
        let g1 = cache.set("q", 1).unwrap();
        let g2 = cache.set("q", 2).unwrap();
        assert!(g2 > g1);
        assert_eq!(*closed.lock().unwrap(), vec![("q".to_string(), 1)]);
        assert_eq!(cache.get("q"), Some((2, g2)));
    }

    #[test]
    fn invalidate_if_respects_generation() {
        let (cache, closed) = recording_cache(Duration::from_secs(60));
        let g1 = cache.set("q", 1).unwrap();
        let g2 = cache.set("q", 2).unwrap();
        assert!(!cache.invalidate_if("q", g1));
        assert!(cache.get("q").is_some());
        assert!(cache.invalidate_if("q", g2));
        assert!(cache.get("q").is_none());
        assert_eq!(closed.lock().unwrap().len(), 2);
    }

    #[test]
    fn expired_entries_are_closed_on_access_and_sweep() {
        let (cache, closed) = recording_cache(Duration::from_millis(20));
        cache.set("a", 1);
        cache.set("b", 2);
        std::thread::sleep(Duration::from_millis(40));
        assert!(cache.get("a").is_none());
        assert_eq!(cache.evict_expired(), 1);
        assert!(cache.is_empty());
        assert_eq!(closed.lock().unwrap().len(), 2);
    }

    #[test]
    fn close_all_closes_and_rejects_later_sets() {
        let (cache, closed) = recording_cache(Duration::from_secs(60));
        cache.set("a", 1);
        cache.set("b", 2);
        assert_eq!(cache.close_all(), 2);
        assert!(cache.is_closed());
        assert_eq!(cache.set("c", 3), None);
        assert!(cache.get("c").is_none());
        assert_eq!(closed.lock().unwrap().len(), 3);
    }

    #[test]
    fn concurrent_set_closes_every_loser() {
        let (cache, closed) = recording_cache(Duration::from_secs(60));
        let cache = Arc::new(cache);
        let handles: Vec<_> = (0..8u32)
            .map(|i| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    cache.set("shared", i);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(cache.len(), 1);
        assert_eq!(closed.lock().unwrap().len(), 7);
    }
}
