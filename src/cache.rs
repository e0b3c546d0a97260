use ahash::AHashMap;
use parking_lot::RwLock;

use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

/// A tiny string cache the library can park slow-to-recompute facts
/// in, like the "this RSA key already passed validation" flag keyed by
/// the key fingerprint.
///
/// The store is a capability: callers that want persistence across
/// process restarts install their own implementation; the in-memory
/// default only survives the process.
pub trait CacheStore: Send + Sync {
    fn fetch(&self, key: &str) -> Option<String>;
    fn store(&self, key: &str, value: &str, expires: Option<Duration>);
    fn clear(&self, key: &str);
}

/// Process-default in-memory cache.
#[derive(Default)]
pub struct MemoryCache {
    map: RwLock<AHashMap<String, (String, Option<Instant>)>>,
}

impl CacheStore for MemoryCache {
    fn fetch(&self, key: &str) -> Option<String> {
        let map = self.map.read();
        let (value, expires) = map.get(key)?;
        if let Some(at) = expires
            && Instant::now() >= *at
        {
            return None;
        }

        Some(value.clone())
    }

    fn store(&self, key: &str, value: &str, expires: Option<Duration>) {
        self.map.write().insert(
            key.to_string(),
            (value.to_string(), expires.map(|d| Instant::now() + d)),
        );
    }

    fn clear(&self, key: &str) {
        self.map.write().remove(key);
    }
}

static CACHE: OnceLock<Arc<dyn CacheStore>> = OnceLock::new();

/// Install a process-wide cache store.  First caller wins; returns
/// false when a store was already installed.
pub fn install(store: Arc<dyn CacheStore>) -> bool {
    CACHE.set(store).is_ok()
}

/// The process-wide cache store, lazily the in-memory default.
pub fn singleton() -> Arc<dyn CacheStore> {
    CACHE
        .get_or_init(|| Arc::new(MemoryCache::default()))
        .clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expired_entries_vanish() {
        let cache = MemoryCache::default();
        cache.store("k", "v", Some(Duration::from_secs(0)));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.fetch("k"), None);

        cache.store("k", "v", None);
        assert_eq!(cache.fetch("k").as_deref(), Some("v"));

        cache.clear("k");
        assert_eq!(cache.fetch("k"), None);
    }
}
