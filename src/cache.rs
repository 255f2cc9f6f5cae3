//! Response cache with lazy TTL expiry and FIFO capacity eviction.
//!
//! A cache hit bypasses the rate limiter and the failover chain entirely.
//! Expired entries are dropped on read; there is no sweep thread. When the
//! cache is at capacity, the single oldest entry is evicted on write.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};

use crate::clock::SharedClock;
use crate::config::CacheConfig;
use crate::request::Prompt;

/// Normalize a prompt and hash it together with its call type and parameters.
///
/// Normalization rule (documented here because the upstream behaviour is
/// unspecified): the prompt text is lowercased, whitespace runs are collapsed
/// to a single space, and leading/trailing whitespace is trimmed. Parameters
/// contribute in sorted key order. Two prompts differing only in case or
/// spacing therefore share a cache entry.
pub fn cache_key(call_type: &str, prompt: &Prompt) -> String {
    let normalized = normalize(&prompt.text);
    let mut hasher = Sha256::new();
    hasher.update(call_type.as_bytes());
    hasher.update(b"\n");
    hasher.update(normalized.as_bytes());
    for (key, value) in &prompt.params {
        hasher.update(b"\n");
        hasher.update(key.as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_bytes());
    }
    hex::encode(hasher.finalize())
}

fn normalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last_was_space = true;
    for ch in text.chars() {
        if ch.is_whitespace() {
            if !last_was_space {
                out.push(' ');
                last_was_space = true;
            }
        } else {
            out.extend(ch.to_lowercase());
            last_was_space = false;
        }
    }
    while out.ends_with(' ') {
        out.pop();
    }
    out
}

/// The payload stored per cache entry: enough to build a completion without
/// touching a provider again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedResponse {
    pub content: String,
    pub model: String,
    pub tokens_used: u32,
}

#[derive(Debug)]
struct CacheEntry {
    value: CachedResponse,
    created_at_ms: u64,
    ttl_ms: u64,
    hit_count: u64,
}

impl CacheEntry {
    fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.created_at_ms + self.ttl_ms
    }
}

/// Hit/miss counters, exposed for observability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
    pub evictions: u64,
}

/// Hash-keyed response cache.
pub struct ResponseCache {
    entries: HashMap<String, CacheEntry>,
    /// Insertion order for FIFO eviction.
    order: VecDeque<String>,
    capacity: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
    clock: SharedClock,
}

impl ResponseCache {
    pub fn new(config: CacheConfig, clock: SharedClock) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity: config.capacity.max(1),
            hits: 0,
            misses: 0,
            evictions: 0,
            clock,
        }
    }

    /// Look up a key. Expired entries count as misses and are dropped here.
    pub fn get(&mut self, key: &str) -> Option<CachedResponse> {
        let now = self.clock.now_millis();
        match self.entries.get_mut(key) {
            Some(entry) if !entry.is_expired(now) => {
                entry.hit_count += 1;
                self.hits += 1;
                Some(entry.value.clone())
            }
            Some(_) => {
                self.entries.remove(key);
                self.order.retain(|k| k != key);
                self.misses += 1;
                None
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Insert an entry. `ttl_ms` must be strictly positive; a zero TTL is
    /// clamped to one millisecond rather than silently caching forever.
    pub fn put(&mut self, key: String, value: CachedResponse, ttl_ms: u64) {
        let now = self.clock.now_millis();
        if self.entries.contains_key(&key) {
            // Overwrite refreshes the entry and its FIFO position.
            self.order.retain(|k| k != &key);
        } else {
            while self.entries.len() >= self.capacity {
                match self.order.pop_front() {
                    Some(oldest) => {
                        if self.entries.remove(&oldest).is_some() {
                            self.evictions += 1;
                        }
                    }
                    None => break,
                }
            }
        }
        self.order.push_back(key.clone());
        self.entries.insert(
            key,
            CacheEntry {
                value,
                created_at_ms: now,
                ttl_ms: ttl_ms.max(1),
                hit_count: 0,
            },
        );
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits,
            misses: self.misses,
            entries: self.entries.len(),
            evictions: self.evictions,
        }
    }
}
