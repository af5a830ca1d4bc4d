//! In-memory LRU translation cache with TTL.
//! Key: blake3 hash of (model | src_lang | tgt_lang | glossary_ver | protected_text).
//! Identical units (repeated term names, boilerplate blocks) hit the cache
//! instead of the API.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;

struct CacheEntry {
    translated_text: String,
    inserted_at: Instant,
}

pub type CacheKey = [u8; 32];

pub struct TranslationCache {
    inner: Mutex<LruCache<CacheKey, CacheEntry>>,
    ttl: Duration,
}

impl TranslationCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    pub fn compute_key(
        model: &str,
        src_lang: Option<&str>,
        tgt_lang: &str,
        glossary_ver: u32,
        protected_text: &str,
    ) -> CacheKey {
        let mut hasher = blake3::Hasher::new();
        hasher.update(model.as_bytes());
        hasher.update(b"|");
        hasher.update(src_lang.unwrap_or("auto").as_bytes());
        hasher.update(b"|");
        hasher.update(tgt_lang.as_bytes());
        hasher.update(b"|");
        hasher.update(&glossary_ver.to_le_bytes());
        hasher.update(b"|");
        hasher.update(protected_text.as_bytes());
        *hasher.finalize().as_bytes()
    }

    /// Look up a cached translation. Returns None if absent or expired.
    pub fn get(&self, key: &CacheKey) -> Option<String> {
        let mut cache = self.inner.lock();
        match cache.get(key) {
            Some(entry) if entry.inserted_at.elapsed() < self.ttl => {
                Some(entry.translated_text.clone())
            }
            Some(_) => {
                cache.pop(key);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, key: CacheKey, translated_text: String) {
        self.inner.lock().put(
            key,
            CacheEntry {
                translated_text,
                inserted_at: Instant::now(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_depends_on_target_language() {
        let a = TranslationCache::compute_key("m", Some("en"), "fr", 1, "Hello");
        let b = TranslationCache::compute_key("m", Some("en"), "de", 1, "Hello");
        assert_ne!(a, b);
        assert_eq!(a, TranslationCache::compute_key("m", Some("en"), "fr", 1, "Hello"));
    }

    #[test]
    fn test_miss_then_hit() {
        let cache = TranslationCache::new(4, Duration::from_secs(60));
        let key = TranslationCache::compute_key("m", None, "fr", 0, "Hi");
        assert!(cache.get(&key).is_none());
        cache.insert(key, "Salut".into());
        assert_eq!(cache.get(&key).as_deref(), Some("Salut"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_expired_entries_are_dropped() {
        let cache = TranslationCache::new(4, Duration::ZERO);
        let key = TranslationCache::compute_key("m", None, "fr", 0, "Hi");
        cache.insert(key, "Salut".into());
        assert!(cache.get(&key).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_capacity_evicts_least_recent() {
        let cache = TranslationCache::new(1, Duration::from_secs(60));
        let k1 = TranslationCache::compute_key("m", None, "fr", 0, "a");
        let k2 = TranslationCache::compute_key("m", None, "fr", 0, "b");
        cache.insert(k1, "A".into());
        cache.insert(k2, "B".into());
        assert!(cache.get(&k1).is_none());
        assert_eq!(cache.len(), 1);
    }
}
