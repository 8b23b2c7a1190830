//! Concurrent key/value cache with optional per-entry expiry.
//!
//! Key features:
//! - Expiry is computed once at write time from the entry's TTL
//! - Lazy eviction: a read that finds an expired entry removes it, there is no sweeper
//! - Sharded locking via DashMap, so readers never wait on a whole-map lock
//!
//! Every operation is atomic for its own key only. Two `set` calls on
//! different keys may be observed in either order by a concurrent reader.

use dashmap::DashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Source of the current time for expiry checks.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    offset_ms: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            origin: Instant::now(),
            offset_ms: AtomicU64::new(0),
        })
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        self.offset_ms.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + Duration::from_millis(self.offset_ms.load(Ordering::SeqCst))
    }
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    fn now(&self) -> Instant {
        (**self).now()
    }
}

#[derive(Debug, Clone)]
struct Entry<V> {
    value: V,
    expires_at: Option<Instant>,
}

impl<V> Entry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now > at)
    }
}

/// Thread-safe TTL cache.
pub struct TtlCache<K, V, C = SystemClock> {
    entries: DashMap<K, Entry<V>>,
    clock: C,
}

impl<K, V> TtlCache<K, V, SystemClock>
where
    K: Eq + Hash,
    V: Clone,
{
    /// Create an empty cache on the wall clock.
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }
}

impl<K, V> Default for TtlCache<K, V, SystemClock>
where
    K: Eq + Hash,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, C> TtlCache<K, V, C>
where
    K: Eq + Hash,
    V: Clone,
    C: Clock,
{
    /// Create an empty cache driven by the given clock.
    pub fn with_clock(clock: C) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    /// Store a value. `None` or a zero TTL means the entry never expires.
    pub fn set(&self, key: K, value: V, ttl: Option<Duration>) {
        let expires_at = ttl
            .filter(|ttl| !ttl.is_zero())
            .map(|ttl| self.clock.now() + ttl);
        self.entries.insert(key, Entry { value, expires_at });
    }

    /// Get a live value, evicting it if it has expired.
    pub fn get(&self, key: &K) -> Option<V> {
        let now = self.clock.now();
        {
            let entry = self.entries.get(key)?;
            if !entry.is_expired(now) {
                return Some(entry.value.clone());
            }
        }
        // Guard dropped above; a concurrent `set` may have replaced the entry since.
        self.entries.remove_if(key, |_, entry| entry.is_expired(now));
        None
    }

    /// Get a live value or the supplied default.
    pub fn get_or(&self, key: &K, default: V) -> V {
        self.get(key).unwrap_or(default)
    }

    /// Remove an entry if present.
    pub fn delete(&self, key: &K) {
        self.entries.remove(key);
    }

    /// Remove every entry.
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Number of stored entries, including expired ones not yet evicted.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
