//! LRU/TTL cache for loaded payloads

use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace};

use conduit_core::Payload;

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Maximum number of entries
    #[serde(default = "default_max_size")]
    pub max_size: usize,
    /// TTL applied to loaded payloads (in milliseconds)
    #[serde(default = "default_ttl_ms")]
    pub ttl_ms: u64,
    /// Period of the background expiry sweep (in milliseconds)
    #[serde(default = "default_prune_interval_ms")]
    pub prune_interval_ms: u64,
}

fn default_max_size() -> usize {
    100
}

fn default_ttl_ms() -> u64 {
    5 * 60 * 1000
}

fn default_prune_interval_ms() -> u64 {
    60 * 1000
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_size: default_max_size(),
            ttl_ms: default_ttl_ms(),
            prune_interval_ms: default_prune_interval_ms(),
        }
    }
}

/// Cache statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Entries currently held
    pub size: usize,
    /// Maximum number of entries
    pub max_size: usize,
    /// Lookups that found a live entry
    pub hits: u64,
    /// Lookups that found nothing or a stale entry
    pub misses: u64,
    /// Entries removed to make room
    pub evictions: u64,
    /// Entries removed because their TTL elapsed
    pub expirations: u64,
    /// hits / (hits + misses)
    pub hit_ratio: f64,
}

/// Cache entry; replaced whole on every `set`
#[derive(Debug, Clone)]
struct CacheEntry {
    value: Payload,
    inserted_at: Instant,
    last_accessed_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn new(value: Payload, ttl: Duration) -> Self {
        let now = Instant::now();
        Self {
            value,
            inserted_at: now,
            last_accessed_at: now,
            ttl,
        }
    }

    /// Valid while the time since insertion is at most the TTL
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.inserted_at) > self.ttl
    }
}

struct CacheState {
    entries: LruCache<String, CacheEntry>,
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
}

/// Bounded LRU map with per-entry TTL
pub struct DataCache {
    settings: CacheSettings,
    /// LruCache is not thread-safe
    state: Mutex<CacheState>,
}

impl DataCache {
    /// Create a cache; a max size of zero is treated as one
    pub fn new(settings: CacheSettings) -> Self {
        let capacity = NonZeroUsize::new(settings.max_size).unwrap_or(NonZeroUsize::MIN);
        info!(
            "Creating data cache with max_size={}, ttl={}ms",
            capacity, settings.ttl_ms
        );

        Self {
            settings,
            state: Mutex::new(CacheState {
                entries: LruCache::new(capacity),
                hits: 0,
                misses: 0,
                evictions: 0,
                expirations: 0,
            }),
        }
    }

    /// TTL applied to loaded payloads
    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.settings.ttl_ms)
    }

    /// Period of the background expiry sweep
    pub fn prune_interval(&self) -> Duration {
        Duration::from_millis(self.settings.prune_interval_ms)
    }

    /// Live value for `key`, promoted to most recently used
    ///
    /// A stale entry is removed and reads as absent.
    pub fn get(&self, key: &str) -> Option<Payload> {
        let now = Instant::now();
        let mut state = self.state.lock();

        let expired = match state.entries.peek(key) {
            None => {
                state.misses += 1;
                trace!("Cache miss for {}", key);
                return None;
            }
            Some(entry) => entry.is_expired(now),
        };

        if expired {
            state.entries.pop(key);
            state.expirations += 1;
            state.misses += 1;
            debug!("Cache entry for {} expired on read", key);
            return None;
        }

        let value = state.entries.get_mut(key).map(|entry| {
            trace!(
                "Cache hit for {} after {:?} idle",
                key,
                now.saturating_duration_since(entry.last_accessed_at)
            );
            entry.last_accessed_at = now;
            entry.value.clone()
        });
        state.hits += 1;
        value
    }

    /// Insert or replace `key`, evicting the least recently used entry if a
    /// new key would exceed the size bound
    pub fn set(&self, key: &str, value: Payload, ttl: Duration) {
        let mut state = self.state.lock();

        if !state.entries.contains(key) && state.entries.len() >= state.entries.cap().get() {
            if let Some((evicted, _)) = state.entries.pop_lru() {
                state.evictions += 1;
                debug!("Evicted {} to make room for {}", evicted, key);
            }
        }

        state.entries.put(key.to_string(), CacheEntry::new(value, ttl));
    }

    /// Whether `key` holds a live entry; does not change recency
    pub fn has(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut state = self.state.lock();

        match state.entries.peek(key).map(|entry| entry.is_expired(now)) {
            None => false,
            Some(false) => true,
            Some(true) => {
                state.entries.pop(key);
                state.expirations += 1;
                false
            }
        }
    }

    /// Remove `key`; returns whether it was present
    pub fn delete(&self, key: &str) -> bool {
        self.state.lock().entries.pop(key).is_some()
    }

    /// Remove every entry whose key satisfies `predicate`
    pub fn delete_matching<P>(&self, predicate: P) -> usize
    where
        P: Fn(&str) -> bool,
    {
        let mut state = self.state.lock();
        let doomed: Vec<String> = state
            .entries
            .iter()
            .filter(|(key, _)| predicate(key))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &doomed {
            state.entries.pop(key.as_str());
        }
        doomed.len()
    }

    /// Remove every entry
    pub fn clear(&self) {
        self.state.lock().entries.clear();
        debug!("Data cache cleared");
    }

    /// Remove every entry whose TTL has elapsed
    pub fn prune(&self) -> usize {
        let now = Instant::now();
        let mut state = self.state.lock();

        let expired: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            state.entries.pop(key.as_str());
        }
        state.expirations += expired.len() as u64;

        if !expired.is_empty() {
            debug!("Pruned {} expired cache entries", expired.len());
        }
        expired.len()
    }

    /// Number of entries, live or not yet swept
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Whether the cache holds no entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys from most to least recently used
    pub fn keys(&self) -> Vec<String> {
        self.state
            .lock()
            .entries
            .iter()
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Current statistics
    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        let lookups = state.hits + state.misses;
        CacheStats {
            size: state.entries.len(),
            max_size: state.entries.cap().get(),
            hits: state.hits,
            misses: state.misses,
            evictions: state.evictions,
            expirations: state.expirations,
            hit_ratio: if lookups == 0 {
                0.0
            } else {
                state.hits as f64 / lookups as f64
            },
        }
    }

    /// Run `prune` every `interval` until the cache is dropped
    pub fn spawn_pruner(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let cache: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                match cache.upgrade() {
                    Some(cache) => {
                        cache.prune();
                    }
                    None => break,
                }
            }
            trace!("Cache pruner stopped");
        })
    }
}
