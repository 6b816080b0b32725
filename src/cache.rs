//! TTL request cache for coalescing identical in-flight fetches.
//!
//! A UI can mount the same resource view several times (progress panels,
//! sidebars) and each mount polls independently. `RequestCache` makes those
//! callers share one in-flight request and one short-lived result per key
//! instead of each hitting the network.

use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tokio::time::Instant;

/// Entries older than `ttl * EVICT_AGE_FACTOR` are dropped to bound memory.
const EVICT_AGE_FACTOR: u32 = 10;

type SharedFetch<V, E> = Shared<BoxFuture<'static, Result<V, Arc<E>>>>;

struct CacheEntry<V, E> {
    fetch: SharedFetch<V, E>,
    inserted_at: Instant,
}

/// Per-key promise cache with expiry.
///
/// Storage-agnostic and deliberately in-memory only; nothing survives a
/// process restart. Errors are wrapped in `Arc` so a settled failure can be
/// handed to every caller that shared the fetch.
pub struct RequestCache<K, V, E> {
    entries: DashMap<K, CacheEntry<V, E>>,
}

impl<K, V, E> RequestCache<K, V, E>
where
    K: Eq + Hash + Clone,
    V: Clone + Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Return the cached (possibly still in-flight) result for `key`, or run
    /// `fetch` and cache it.
    ///
    /// The shared future is stored before it is awaited, so concurrent
    /// callers arriving during the fetch observe and share it. Settled
    /// results, successes and failures alike, stay reusable until the entry
    /// expires; an expired entry is replaced, never mutated.
    pub async fn get_or_fetch<F, Fut>(&self, key: K, ttl: Duration, fetch: F) -> Result<V, Arc<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        self.evict_expired(ttl);

        let now = Instant::now();
        let shared = match self.entries.entry(key) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get();
                if now.duration_since(entry.inserted_at) < ttl {
                    entry.fetch.clone()
                } else {
                    let fresh = share(fetch());
                    occupied.insert(CacheEntry {
                        fetch: fresh.clone(),
                        inserted_at: now,
                    });
                    fresh
                }
            }
            Entry::Vacant(vacant) => {
                let fresh = share(fetch());
                vacant.insert(CacheEntry {
                    fetch: fresh.clone(),
                    inserted_at: now,
                });
                fresh
            }
        };

        shared.await
    }

    /// Number of live entries (expired-but-unevicted included).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict_expired(&self, ttl: Duration) {
        let now = Instant::now();
        let max_age = ttl * EVICT_AGE_FACTOR;
        self.entries
            .retain(|_, entry| now.duration_since(entry.inserted_at) < max_age);
    }
}

impl<K, V, E> Default for RequestCache<K, V, E>
where
    K: Eq + Hash + Clone,
    V: Clone + Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

fn share<V, E, Fut>(fetch: Fut) -> SharedFetch<V, E>
where
    V: Clone + Send + Sync + 'static,
    E: Send + Sync + 'static,
    Fut: Future<Output = Result<V, E>> + Send + 'static,
{
    fetch.map(|result| result.map_err(Arc::new)).boxed().shared()
}
