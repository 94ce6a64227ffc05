//! Optional conversion result cache keyed by full-content hash and target
//! format. Off by default; bounded LRU when enabled.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use sha2::{Digest, Sha256};

use crate::pool::job::TargetFormat;

/// Hex SHA-256 of the complete input document. The whole content is hashed
/// so two documents sharing a prefix can never collide.
pub fn content_hash(input: &[u8]) -> String {
    hex::encode(Sha256::digest(input))
}

struct CachedConversion {
    data: Vec<u8>,
    created_at: Instant,
    last_access: u64,
}

struct CacheInner {
    entries: HashMap<(String, TargetFormat), CachedConversion>,
    clock: u64,
}

/// Bounded LRU over finished conversion outputs.
pub struct ConversionCache {
    inner: Mutex<CacheInner>,
    capacity: usize,
}

impl ConversionCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                clock: 0,
            }),
            capacity: capacity.max(1),
        }
    }

    pub fn get(&self, hash: &str, target: TargetFormat) -> Option<Vec<u8>> {
        let mut inner = self.lock();
        inner.clock += 1;
        let clock = inner.clock;
        let entry = inner.entries.get_mut(&(hash.to_string(), target))?;
        entry.last_access = clock;
        Some(entry.data.clone())
    }

    pub fn insert(&self, hash: String, target: TargetFormat, data: Vec<u8>) {
        let mut inner = self.lock();
        inner.clock += 1;
        let clock = inner.clock;
        let key = (hash, target);
        if !inner.entries.contains_key(&key) && inner.entries.len() >= self.capacity {
            if let Some((victim, age)) = inner
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_access)
                .map(|(k, e)| (k.clone(), e.created_at.elapsed()))
            {
                tracing::debug!(
                    "Evicting conversion cache entry {}/{} after {:?}",
                    &victim.0[..12.min(victim.0.len())],
                    victim.1,
                    age
                );
                inner.entries.remove(&victim);
            }
        }
        inner.entries.insert(
            key,
            CachedConversion {
                data,
                created_at: Instant::now(),
                last_access: clock,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }
}
