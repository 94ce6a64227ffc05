//! Bounded LRU cache of detection results, keyed by a hash of the scanned
//! content prefix.

use std::collections::HashMap;
use std::sync::Mutex;

use super::types::DetectionResult;

/// BLAKE3 hash of the byte prefix the detector actually scanned.
pub type PrefixHash = [u8; 32];

pub fn prefix_hash(bytes: &[u8]) -> PrefixHash {
    *blake3::hash(bytes).as_bytes()
}

struct CacheEntry {
    result: DetectionResult,
    last_access: u64,
}

struct CacheInner {
    entries: HashMap<PrefixHash, CacheEntry>,
    // Monotonic access clock; eviction removes the smallest stamp.
    clock: u64,
}

/// Capacity-bounded, least-recently-used cache. All LRU bookkeeping happens
/// inside one critical section so concurrent callers never observe a torn
/// access order.
pub struct SignatureCache {
    inner: Mutex<CacheInner>,
    capacity: usize,
}

impl SignatureCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                clock: 0,
            }),
            capacity: capacity.max(1),
        }
    }

    /// Look up a previously computed result, refreshing its recency.
    pub fn get(&self, key: &PrefixHash) -> Option<DetectionResult> {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.clock += 1;
        let clock = inner.clock;
        let entry = inner.entries.get_mut(key)?;
        entry.last_access = clock;
        Some(entry.result.clone())
    }

    /// Insert a result, evicting the least-recently-used entry at capacity.
    pub fn insert(&self, key: PrefixHash, result: DetectionResult) {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.clock += 1;
        let clock = inner.clock;
        if !inner.entries.contains_key(&key) && inner.entries.len() >= self.capacity {
            if let Some(oldest) = inner
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_access)
                .map(|(k, _)| *k)
            {
                inner.entries.remove(&oldest);
            }
        }
        inner.entries.insert(
            key,
            CacheEntry {
                result,
                last_access: clock,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
