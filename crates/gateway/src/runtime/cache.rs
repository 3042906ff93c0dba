//! Bounded LRU cache shared by proxied responses and enhancement results.
//!
//! Reads and writes both refresh recency. Entries may carry a TTL; an
//! expired entry counts as a miss and is dropped on the lookup that finds it.
//! Hit/miss/eviction counters are advisory.

use std::fmt::Write as _;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::time::Instant;

struct CacheEntry<V> {
    value: V,
    created_at: Instant,
    hit_count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub max_size: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub hit_rate: f64,
}

pub struct ResponseCache<V> {
    entries: Mutex<LruCache<String, CacheEntry<V>>>,
    ttl: Option<Duration>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl<V: Clone> ResponseCache<V> {
    /// `max_size` of zero is treated as one; config validation rejects it.
    pub fn new(max_size: usize, ttl: Option<Duration>) -> Self {
        let cap = NonZeroUsize::new(max_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(cap)),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let mut entries = self.entries.lock();
        let expired = match entries.get_mut(key) {
            None => false,
            Some(entry) => {
                if self.is_expired(entry) {
                    true
                } else {
                    entry.hit_count += 1;
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(entry.value.clone());
                }
            }
        };
        if expired {
            entries.pop(key);
            tracing::debug!(key = %short(key), "cache entry expired");
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Insert or replace. Evicts the least-recently-used entry when full.
    pub fn set(&self, key: String, value: V) {
        let entry = CacheEntry {
            value,
            created_at: Instant::now(),
            hit_count: 0,
        };
        let mut entries = self.entries.lock();
        if let Some((old_key, _)) = entries.push(key.clone(), entry) {
            if old_key != key {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(key = %short(&old_key), "cache entry evicted");
            }
        }
    }

    /// Lookup count for a live entry, without touching recency.
    pub fn hit_count(&self, key: &str) -> Option<u64> {
        self.entries.lock().peek(key).map(|e| e.hit_count)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries
            .lock()
            .peek(key)
            .is_some_and(|e| !self.is_expired(e))
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry; counters are kept.
    pub fn clear(&self) -> usize {
        let mut entries = self.entries.lock();
        let n = entries.len();
        entries.clear();
        n
    }

    pub fn stats(&self) -> CacheStats {
        let (size, max_size) = {
            let entries = self.entries.lock();
            (entries.len(), entries.cap().get())
        };
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        CacheStats {
            size,
            max_size,
            hits,
            misses,
            evictions: self.evictions.load(Ordering::Relaxed),
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
        }
    }

    fn is_expired(&self, entry: &CacheEntry<V>) -> bool {
        self.ttl.is_some_and(|ttl| entry.created_at.elapsed() >= ttl)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Keys
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Key for a proxied call: server, method and params with object keys sorted,
/// so `{"a":1,"b":2}` and `{"b":2,"a":1}` share an entry.
pub fn cache_key(server: &str, method: &str, params: Option<&Value>) -> String {
    let mut canonical = String::new();
    if let Some(p) = params {
        write_canonical(p, &mut canonical);
    }
    digest(&[server, method, &canonical])
}

/// Key for an enhancement result: model plus whitespace-normalized prompt.
pub fn prompt_key(model: &str, prompt: &str) -> String {
    let normalized = prompt.split_whitespace().collect::<Vec<_>>().join(" ");
    digest(&[model, &normalized])
}

fn digest(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

fn write_canonical(v: &Value, out: &mut String) {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, k) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(k.clone()).to_string());
                out.push(':');
                write_canonical(&map[k.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => {
            let _ = write!(out, "{scalar}");
        }
    }
}

fn short(key: &str) -> &str {
    key.get(..12).unwrap_or(key)
}
