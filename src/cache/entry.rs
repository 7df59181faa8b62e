//! Cache entry model.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Relative importance of an entry when the store needs to make room.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CachePriority {
    Low,
    #[default]
    Default,
    High,
    /// Pinned: never evicted for capacity, only by expiry or explicit removal.
    NotRemovable,
}

/// Expiration rules for one entry. Both limits may be set; whichever
/// fires first wins.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExpirationPolicy {
    /// Lifetime measured from insertion.
    pub absolute: Option<Duration>,
    /// Idle time allowed between reads.
    pub sliding: Option<Duration>,
}

impl ExpirationPolicy {
    pub fn is_never(&self) -> bool {
        self.absolute.is_none() && self.sliding.is_none()
    }
}

/// A cached value together with the dependency tokens it declared.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: String,
    pub value: Bytes,
    pub dependencies: BTreeSet<String>,
    pub created_at: OffsetDateTime,
    pub absolute_expiration: Option<Duration>,
    pub sliding_expiration: Option<Duration>,
    pub priority: CachePriority,
}

impl CacheEntry {
    pub fn expiration(&self) -> ExpirationPolicy {
        ExpirationPolicy {
            absolute: self.absolute_expiration,
            sliding: self.sliding_expiration,
        }
    }
}

/// The native value a [`CacheStore`](super::store::CacheStore) holds.
///
/// Every write creates a fresh `StoredEntry` with a new generation. The
/// `retired` flag is the per-entry synchronization point: whichever path
/// takes an entry out of service first (replace, remove, invalidate,
/// eviction) owns the cleanup of its dependency edges, and every later
/// path sees the flag and backs off.
#[derive(Debug)]
pub struct StoredEntry {
    entry: CacheEntry,
    generation: u64,
    retired: AtomicBool,
}

impl StoredEntry {
    pub fn new(entry: CacheEntry, generation: u64) -> Self {
        Self {
            entry,
            generation,
            retired: AtomicBool::new(false),
        }
    }

    pub fn entry(&self) -> &CacheEntry {
        &self.entry
    }

    pub fn key(&self) -> &str {
        &self.entry.key
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn priority(&self) -> CachePriority {
        self.entry.priority
    }

    pub fn depends_on(&self, token: &str) -> bool {
        self.entry.dependencies.contains(token)
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    /// Returns true for exactly one caller.
    pub(crate) fn retire(&self) -> bool {
        !self.retired.swap(true, Ordering::AcqRel)
    }
}
