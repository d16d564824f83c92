//! Byte-budgeted script source cache
//!
//! Entries are evicted least-recently-accessed first. Access order is kept
//! with a logical counter next to the wall-clock timestamps, so two accesses
//! in the same millisecond still order deterministically.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tracing::debug;

/// Cache key for a script: SHA-256 of its text, hex encoded
pub fn code_cache_key(code: &str) -> String {
    let digest = Sha256::digest(code.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// One cached script
#[derive(Debug, Clone)]
pub struct CompiledCodeEntry {
    pub code: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    access_tick: u64,
}

/// Size-bounded cache of script sources
///
/// Invariant: the sum of entry sizes never exceeds `max_size_bytes`.
#[derive(Debug)]
pub struct CodeCache {
    entries: HashMap<String, CompiledCodeEntry>,
    current_size: u64,
    max_size_bytes: u64,
    tick: u64,
}

impl CodeCache {
    pub fn new(max_size_bytes: u64) -> Self {
        Self {
            entries: HashMap::new(),
            current_size: 0,
            max_size_bytes,
            tick: 0,
        }
    }

    /// Return the cached code for `cache_key`, inserting `code` on a miss
    ///
    /// The returned text is always the cached text on a hit and `code`
    /// verbatim on a miss. An item larger than the whole budget empties the
    /// cache and is handed back without being retained.
    pub fn get_or_insert(&mut self, cache_key: &str, code: &str) -> String {
        self.tick += 1;
        let tick = self.tick;

        if let Some(entry) = self.entries.get_mut(cache_key) {
            entry.last_accessed = Utc::now();
            entry.access_tick = tick;
            return entry.code.clone();
        }

        let size = code.len() as u64;
        self.evict_if_needed(size);

        if size > self.max_size_bytes {
            debug!(
                cache_key = %cache_key,
                size_bytes = size,
                max_size_bytes = self.max_size_bytes,
                "Script exceeds cache budget, not cached"
            );
            return code.to_string();
        }

        let now = Utc::now();
        self.entries.insert(
            cache_key.to_string(),
            CompiledCodeEntry {
                code: code.to_string(),
                size_bytes: size,
                created_at: now,
                last_accessed: now,
                access_tick: tick,
            },
        );
        self.current_size += size;

        code.to_string()
    }

    /// Evict least-recently-accessed entries until `new_size` more bytes fit
    pub fn evict_if_needed(&mut self, new_size: u64) {
        while self.current_size + new_size > self.max_size_bytes {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.access_tick)
                .map(|(key, _)| key.clone());

            let Some(key) = oldest else {
                break;
            };

            if let Some(entry) = self.entries.remove(&key) {
                self.current_size -= entry.size_bytes;
                debug!(cache_key = %key, size_bytes = entry.size_bytes, "Evicted cached script");
            }
        }
    }

    pub fn get(&self, cache_key: &str) -> Option<&CompiledCodeEntry> {
        self.entries.get(cache_key)
    }

    pub fn current_size(&self) -> u64 {
        self.current_size
    }

    pub fn max_size_bytes(&self) -> u64 {
        self.max_size_bytes
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.current_size = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_cache_key_is_sha256_hex() {
        assert_eq!(
            code_cache_key("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_hit_returns_cached_text() {
        let mut cache = CodeCache::new(100);
        assert_eq!(cache.get_or_insert("k", "first"), "first");
        assert_eq!(cache.get_or_insert("k", "second"), "first");
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.current_size(), 5);
    }

    #[test]
    fn test_evicts_least_recently_accessed() {
        let mut cache = CodeCache::new(10);
        cache.get_or_insert("a", "aaaa");
        cache.get_or_insert("b", "bbbb");
        // Touch `a` so `b` becomes the eviction candidate.
        cache.get_or_insert("a", "");

        cache.get_or_insert("c", "cccc");

        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_none());
        assert!(cache.get("c").is_some());
        assert_eq!(cache.current_size(), 8);
    }

    #[test]
    fn test_oversize_item_empties_cache() {
        let mut cache = CodeCache::new(8);
        cache.get_or_insert("a", "aaaa");
        cache.get_or_insert("b", "bbbb");

        let code = "x".repeat(20);
        assert_eq!(cache.get_or_insert("big", &code), code);

        assert!(cache.is_empty());
        assert_eq!(cache.current_size(), 0);
    }

    proptest! {
        #[test]
        fn prop_budget_never_exceeded(
            max in 1u64..256,
            ops in prop::collection::vec((0u8..16, 0usize..64), 1..100),
        ) {
            let mut cache = CodeCache::new(max);
            for (key, len) in ops {
                let code = "x".repeat(len);
                let returned = cache.get_or_insert(&key.to_string(), &code);
                prop_assert!(cache.current_size() <= max);

                let summed: u64 = cache.entries.values().map(|e| e.size_bytes).sum();
                prop_assert_eq!(summed, cache.current_size());

                if let Some(entry) = cache.get(&key.to_string()) {
                    prop_assert_eq!(&entry.code, &returned);
                }
            }
        }
    }
}
