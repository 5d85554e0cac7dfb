//! Time-to-live cache for model catalogs and other backend metadata.
//!
//! The cache is shared by every backend built from one [`Registry`](crate::registry::Registry).
//! Keys are hashed onto a fixed set of shards so lookups for unrelated
//! providers never contend on the same lock.

use parking_lot::RwLock;
use serde_json::Value;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::catalog::ModelMetaData;
use crate::options::ProviderConfig;
use crate::registry::ProviderKind;

const SHARDS: usize = 16;

/// Default lifetime of a cached entry.
pub const DEFAULT_TTL: Duration = Duration::from_secs(10 * 60);

/// Identifies the configuration a cached value was fetched with.
///
/// Two backends share an entry only when they talk to the same endpoint with
/// the same credential presence and the same `extra` settings.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub provider: ProviderKind,
    pub base_url: String,
    pub has_credentials: bool,
    pub fingerprint: u64,
}

impl CacheKey {
    pub fn new(provider: ProviderKind, base_url: &str, config: &ProviderConfig) -> Self {
        Self {
            provider,
            base_url: base_url.to_string(),
            has_credentials: config.resolved_api_key().is_some(),
            fingerprint: fingerprint(&config.extra),
        }
    }
}

/// Stable hash of the `extra` bag. `BTreeMap` iterates in key order, so two
/// bags with the same entries always hash the same.
fn fingerprint(extra: &BTreeMap<String, Value>) -> u64 {
    let mut hasher = DefaultHasher::new();
    for (key, value) in extra {
        key.hash(&mut hasher);
        value.to_string().hash(&mut hasher);
    }
    hasher.finish()
}

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

/// Sharded TTL map. Writers replace whole entries, so readers never observe a
/// partially written value; concurrent `set`s on one key are last-writer-wins.
pub struct MetadataCache<K, V> {
    shards: Vec<RwLock<HashMap<K, Entry<V>>>>,
    ttl: Duration,
}

/// Cache of model listings, shared between backends.
pub type ModelCache = Arc<MetadataCache<CacheKey, Vec<ModelMetaData>>>;

impl<K: Hash + Eq, V: Clone> MetadataCache<K, V> {
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            shards: (0..SHARDS).map(|_| RwLock::new(HashMap::new())).collect(),
            ttl,
        }
    }

    fn shard(&self, key: &K) -> &RwLock<HashMap<K, Entry<V>>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[hasher.finish() as usize % SHARDS]
    }

    /// The cached value, unless absent or expired.
    pub fn get(&self, key: &K) -> Option<V> {
        let shard = self.shard(key).read();
        shard
            .get(key)
            .filter(|entry| entry.expires_at > Instant::now())
            .map(|entry| entry.value.clone())
    }

    pub fn set(&self, key: K, value: V) {
        let entry = Entry {
            value,
            expires_at: Instant::now() + self.ttl,
        };
        let mut shard = self.shard(&key).write();
        shard.retain(|_, e| e.expires_at > Instant::now());
        shard.insert(key, entry);
    }

    pub fn remove(&self, key: &K) {
        self.shard(key).write().remove(key);
    }

    pub fn clear(&self) {
        for shard in &self.shards {
            shard.write().clear();
        }
    }
}

impl<K: Hash + Eq, V: Clone> Default for MetadataCache<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_get_and_set() {
        let cache: MetadataCache<&str, u32> = MetadataCache::new();
        assert_eq!(cache.get(&"a"), None);
        cache.set("a", 1);
        cache.set("a", 2);
        assert_eq!(cache.get(&"a"), Some(2));
        cache.remove(&"a");
        assert_eq!(cache.get(&"a"), None);
    }

    #[test]
    fn test_entries_expire() {
        let cache: MetadataCache<&str, u32> = MetadataCache::with_ttl(Duration::from_millis(20));
        cache.set("a", 1);
        assert_eq!(cache.get(&"a"), Some(1));
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(cache.get(&"a"), None);
    }

    #[test]
    fn test_key_distinguishes_credentials_and_extra() {
        let base = ProviderConfig::new("sk-1");
        let a = CacheKey::new(ProviderKind::OpenAi, "https://api.openai.com/v1", &base);
        let b = CacheKey::new(
            ProviderKind::OpenAi,
            "https://api.openai.com/v1",
            &ProviderConfig::default(),
        );
        let c = CacheKey::new(
            ProviderKind::OpenAi,
            "https://api.openai.com/v1",
            &base.clone().with_extra("organization", json!("org-1")),
        );
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(
            a,
            CacheKey::new(
                ProviderKind::OpenAi,
                "https://api.openai.com/v1",
                &ProviderConfig::new("sk-other")
            )
        );
    }

    #[test]
    fn test_fingerprint_ignores_insertion_order() {
        let one = ProviderConfig::default()
            .with_extra("a", json!(1))
            .with_extra("b", json!("x"));
        let two = ProviderConfig::default()
            .with_extra("b", json!("x"))
            .with_extra("a", json!(1));
        assert_eq!(fingerprint(&one.extra), fingerprint(&two.extra));
    }

    #[test]
    fn test_concurrent_access() {
        let cache: Arc<MetadataCache<u32, u32>> = Arc::new(MetadataCache::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    for n in 0..100 {
                        cache.set(n % 10, i);
                        let _ = cache.get(&(n % 10));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        for key in 0..10 {
            assert!(cache.get(&key).is_some());
        }
    }
}
