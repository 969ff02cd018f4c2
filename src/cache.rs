//! Pluggable TTL cache (`spec.md` §4.1).
//!
//! The trait stores logical JSON values rather than typed Rust values so it
//! can live behind a `dyn Cache` the way `Logger`/`Config` do; `CacheExt`
//! supplies the typed get/set convenience on top, mirroring the source's
//! "pointer to destination" call shape without needing generic trait
//! methods (not object-safe in Rust).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Seconds-to-minutes freshness window for node-level reads.
pub const NODE_DATA_TTL: Duration = Duration::from_secs(60);
/// Seconds-scale freshness window for per-VM status reads.
pub const VM_DATA_TTL: Duration = Duration::from_secs(15);

pub trait Cache: Send + Sync {
    fn get_raw(&self, key: &str) -> Option<serde_json::Value>;
    fn set_raw(&self, key: &str, value: serde_json::Value, ttl: Duration);
    fn delete(&self, key: &str);
    fn clear(&self);
    /// No persistent backend to release by default; implementations that
    /// own file handles or connections override this.
    fn close(&self) {}
}

pub trait CacheExt: Cache {
    fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get_raw(key).and_then(|v| serde_json::from_value(v).ok())
    }

    fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
        if let Ok(v) = serde_json::to_value(value) {
            self.set_raw(key, v, ttl);
        }
    }
}

impl<C: Cache + ?Sized> CacheExt for C {}

/// Prefixes a cache key for group mode so multiple clusters sharing one
/// process-wide cache never bleed data into one another (`spec.md` §9).
pub fn group_scoped_key(group: &str, profile: &str, path: &str) -> String {
    format!("group:{group}:profile:{profile}:{path}")
}

/// Always misses, accepts and discards everything. The acceptable default
/// per `spec.md` §4.1.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpCache;

impl Cache for NoOpCache {
    fn get_raw(&self, _key: &str) -> Option<serde_json::Value> {
        None
    }
    fn set_raw(&self, _key: &str, _value: serde_json::Value, _ttl: Duration) {}
    fn delete(&self, _key: &str) {}
    fn clear(&self) {}
}

struct Entry {
    value: serde_json::Value,
    expires_at: Instant,
}

/// A simple process-wide in-memory cache, sufficient to run and test the
/// core without pulling in a persistence backend (out of scope per
/// `spec.md` §1).
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Cache for MemoryCache {
    fn get_raw(&self, key: &str) -> Option<serde_json::Value> {
        let mut entries = self.entries.lock().expect("cache mutex poisoned");
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    fn set_raw(&self, key: &str, value: serde_json::Value, ttl: Duration) {
        let mut entries = self.entries.lock().expect("cache mutex poisoned");
        entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    fn delete(&self, key: &str) {
        self.entries.lock().expect("cache mutex poisoned").remove(key);
    }

    fn clear(&self) {
        self.entries.lock().expect("cache mutex poisoned").clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_within_ttl_hits() {
        let cache = MemoryCache::new();
        cache.set("k", &42u32, Duration::from_secs(60));
        assert_eq!(cache.get::<u32>("k"), Some(42));
    }

    #[test]
    fn expired_entry_is_a_miss_and_is_evicted() {
        let cache = MemoryCache::new();
        cache.set("k", &42u32, Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.get::<u32>("k"), None);
        assert!(cache.entries.lock().unwrap().is_empty());
    }

    #[test]
    fn noop_cache_always_misses() {
        let cache = NoOpCache;
        cache.set("k", &1u32, Duration::from_secs(60));
        assert_eq!(cache.get::<u32>("k"), None);
    }

    #[test]
    fn group_scoped_key_is_distinct_per_profile() {
        let a = group_scoped_key("g", "p1", "/nodes");
        let b = group_scoped_key("g", "p2", "/nodes");
        assert_ne!(a, b);
    }
}
