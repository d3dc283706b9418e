//! Bounded in-memory segment store with plan-aware eviction.
//!
//! Holds downloaded segment bytes keyed by `(video, index)` under a hard
//! byte ceiling. Entries belonging to the active prefetch plan's current,
//! next, and previous videos are protected from eviction; everything else
//! is evicted oldest-write-first when a `put` would exceed the budget. A
//! put that cannot fit even after eviction is soft-rejected, never a
//! panic.

use std::collections::{HashMap, HashSet};
use std::fmt;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::video::{Priority, VideoId};

/// Key addressing one downloaded segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SegmentKey {
    pub video: VideoId,
    pub index: u32,
}

impl SegmentKey {
    pub fn new(video: VideoId, index: u32) -> Self {
        Self { video, index }
    }
}

impl fmt::Display for SegmentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.video, self.index)
    }
}

struct CacheEntry {
    data: Bytes,
    /// Priority tag inherited from the prefetch plan active at write time.
    #[allow(dead_code)]
    priority: Priority,
    /// Monotonic write counter; eviction removes lowest-seq first.
    seq: u64,
}

struct StoreInner {
    entries: HashMap<SegmentKey, CacheEntry>,
    total_bytes: u64,
    next_seq: u64,
}

/// Entry count and byte total, for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub bytes: u64,
}

/// Thread-safe bounded segment store.
pub struct SegmentStore {
    inner: Mutex<StoreInner>,
    /// Videos whose entries must survive eviction: the active plan's
    /// current, next, and previous ids (not next-next).
    protected: RwLock<HashSet<VideoId>>,
    max_bytes: u64,
}

impl SegmentStore {
    pub fn new(max_bytes: u64) -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                entries: HashMap::new(),
                total_bytes: 0,
                next_seq: 0,
            }),
            protected: RwLock::new(HashSet::new()),
            max_bytes,
        }
    }

    /// Replace the set of plan-protected videos.
    pub fn set_protected(&self, ids: HashSet<VideoId>) {
        *self.protected.write() = ids;
    }

    pub fn is_protected(&self, id: &VideoId) -> bool {
        self.protected.read().contains(id)
    }

    /// Insert a segment, evicting unprotected entries oldest-first until the
    /// budget holds. Returns the evicted keys so the caller can reset the
    /// corresponding segment states.
    ///
    /// If the budget cannot be met because the remaining occupancy is all
    /// protected, nothing is evicted or inserted and [`Error::CacheFull`]
    /// is returned.
    pub fn put(&self, key: SegmentKey, data: Bytes, priority: Priority) -> Result<Vec<SegmentKey>> {
        let size = data.len() as u64;
        if size > self.max_bytes {
            warn!(key = %key, size, budget = self.max_bytes, "Segment larger than entire cache budget");
            return Err(Error::CacheFull {
                needed: size,
                budget: self.max_bytes,
            });
        }

        let protected = self.protected.read().clone();
        let mut inner = self.inner.lock();

        // Feasibility check before touching anything: freeable bytes are
        // every entry not owned by a protected video, plus the old bytes
        // of the key being re-written (replaced regardless of protection).
        let existing = inner
            .entries
            .get(&key)
            .map(|e| e.data.len() as u64)
            .unwrap_or(0);
        let evictable: u64 = inner
            .entries
            .iter()
            .filter(|(k, _)| **k != key && !protected.contains(&k.video))
            .map(|(_, e)| e.data.len() as u64)
            .sum();
        if inner.total_bytes - evictable - existing + size > self.max_bytes {
            debug!(key = %key, size, "Cache full of protected entries; rejecting put");
            return Err(Error::CacheFull {
                needed: size,
                budget: self.max_bytes,
            });
        }

        // Re-writing an existing key frees its old bytes first.
        if let Some(old) = inner.entries.remove(&key) {
            inner.total_bytes -= old.data.len() as u64;
        }

        let mut evicted = Vec::new();
        while inner.total_bytes + size > self.max_bytes {
            let victim = inner
                .entries
                .iter()
                .filter(|(k, _)| !protected.contains(&k.video))
                .min_by_key(|(_, e)| e.seq)
                .map(|(k, _)| k.clone());

            // The feasibility check above guarantees a victim exists.
            let Some(victim) = victim else { break };
            if let Some(entry) = inner.entries.remove(&victim) {
                inner.total_bytes -= entry.data.len() as u64;
            }
            debug!(key = %victim, "Evicted segment under memory pressure");
            evicted.push(victim);
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.total_bytes += size;
        inner.entries.insert(
            key,
            CacheEntry {
                data,
                priority,
                seq,
            },
        );

        Ok(evicted)
    }

    /// Fetch a segment's bytes. `Bytes` clones are reference-counted, not
    /// copies.
    pub fn get(&self, key: &SegmentKey) -> Option<Bytes> {
        self.inner.lock().entries.get(key).map(|e| e.data.clone())
    }

    pub fn contains(&self, key: &SegmentKey) -> bool {
        self.inner.lock().entries.contains_key(key)
    }

    /// Remove one entry. Returns whether it existed.
    pub fn remove(&self, key: &SegmentKey) -> bool {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.remove(key) {
            inner.total_bytes -= entry.data.len() as u64;
            true
        } else {
            false
        }
    }

    /// Drop every entry belonging to a video. Returns the freed indices.
    pub fn remove_video(&self, id: &VideoId) -> Vec<u32> {
        let mut inner = self.inner.lock();
        let keys: Vec<SegmentKey> = inner
            .entries
            .keys()
            .filter(|k| &k.video == id)
            .cloned()
            .collect();

        let mut indices = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(entry) = inner.entries.remove(&key) {
                inner.total_bytes -= entry.data.len() as u64;
                indices.push(key.index);
            }
        }
        indices
    }

    pub fn size_bytes(&self) -> u64 {
        self.inner.lock().total_bytes
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            entries: inner.entries.len(),
            bytes: inner.total_bytes,
        }
    }
}
