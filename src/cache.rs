// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Response Cache
//!
//! This module caches RPC responses keyed by a fingerprint of the request.
//! Callers opt in per call by supplying a TTL; without one, neither reads
//! nor writes happen. The cache is a fixed-capacity LRU, so hot responses
//! stay resident and cold ones fall out under pressure.

use lru::LruCache;
use serde_json::Value;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// A reply as observed by the private queue router: the reply's AMQP
/// headers plus the decoded payload.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedResponse {
    pub headers: Value,
    pub data: Value,
}

struct CacheEntry {
    value: CachedResponse,
    inserted_at: Instant,
}

/// Bounded LRU from request fingerprint to response.
pub struct ResponseCache {
    entries: Mutex<LruCache<u64, CacheEntry>>,
}

impl ResponseCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::new(100).unwrap());
        ResponseCache {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Computes the cache key for a request: a structural hash of the
    /// message (object key order does not matter) combined with the
    /// routing key, so identical bodies to different routes stay distinct.
    pub fn fingerprint(message: &Value, route: &str) -> u64 {
        let mut hasher = DefaultHasher::new();
        hash_value(message, &mut hasher);
        let body = hasher.finish();

        let mut hasher = DefaultHasher::new();
        route.hash(&mut hasher);
        body ^ hasher.finish()
    }

    /// Returns the cached response if one exists and is younger than the
    /// caller's TTL. A stale entry is evicted on the way out.
    pub fn get(&self, key: u64, ttl: Duration) -> Option<CachedResponse> {
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        match entries.get(&key) {
            Some(entry) if entry.inserted_at.elapsed() < ttl => Some(entry.value.clone()),
            Some(_) => {
                entries.pop(&key);
                None
            }
            None => None,
        }
    }

    /// Stores a response. A `None` key means the caller did not opt into
    /// caching and the write is skipped.
    pub fn set(&self, key: Option<u64>, response: CachedResponse) {
        let Some(key) = key else { return };
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        entries.push(
            key,
            CacheEntry {
                value: response,
                inserted_at: Instant::now(),
            },
        );
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

/// Hashes a JSON value structurally: objects hash their entries in sorted
/// key order, so two maps with the same contents always collide.
fn hash_value<H: Hasher>(value: &Value, hasher: &mut H) {
    match value {
        Value::Null => 0u8.hash(hasher),
        Value::Bool(b) => {
            1u8.hash(hasher);
            b.hash(hasher);
        }
        Value::Number(n) => {
            2u8.hash(hasher);
            n.to_string().hash(hasher);
        }
        Value::String(s) => {
            3u8.hash(hasher);
            s.hash(hasher);
        }
        Value::Array(items) => {
            4u8.hash(hasher);
            items.len().hash(hasher);
            for item in items {
                hash_value(item, hasher);
            }
        }
        Value::Object(map) => {
            5u8.hash(hasher);
            map.len().hash(hasher);
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for key in keys {
                key.hash(hasher);
                hash_value(&map[key], hasher);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn response(tag: &str) -> CachedResponse {
        CachedResponse {
            headers: json!({}),
            data: json!({ "tag": tag }),
        }
    }

    #[test]
    fn fingerprint_ignores_key_order() {
        let a: Value = serde_json::from_str(r#"{"x":1,"y":{"b":2,"a":3}}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"y":{"a":3,"b":2},"x":1}"#).unwrap();
        assert_eq!(
            ResponseCache::fingerprint(&a, "route"),
            ResponseCache::fingerprint(&b, "route")
        );
    }

    #[test]
    fn fingerprint_separates_routes() {
        let msg = json!({"x": 1});
        assert_ne!(
            ResponseCache::fingerprint(&msg, "sum"),
            ResponseCache::fingerprint(&msg, "echo")
        );
    }

    #[test]
    fn hit_within_ttl() {
        let cache = ResponseCache::new(10);
        let key = ResponseCache::fingerprint(&json!({"x": 1}), "sum");
        cache.set(Some(key), response("first"));

        let hit = cache.get(key, Duration::from_secs(5)).unwrap();
        assert_eq!(hit.data["tag"], "first");
    }

    #[test]
    fn stale_entry_is_evicted() {
        let cache = ResponseCache::new(10);
        let key = ResponseCache::fingerprint(&json!({"x": 1}), "sum");
        cache.set(Some(key), response("first"));

        std::thread::sleep(Duration::from_millis(20));
        assert!(cache.get(key, Duration::from_millis(10)).is_none());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn write_without_key_is_a_noop() {
        let cache = ResponseCache::new(10);
        cache.set(None, response("ignored"));
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn capacity_bounds_the_cache() {
        let cache = ResponseCache::new(2);
        for i in 0..5u32 {
            let key = ResponseCache::fingerprint(&json!({ "i": i }), "r");
            cache.set(Some(key), response("x"));
        }
        assert_eq!(cache.len(), 2);
    }
}
