//! Storage primitives the caching backend is parameterized over.
//!
//! The backend owns dependency bookkeeping; a store only keeps values and
//! reports the removals it performs on its own (expiry, capacity).

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use lru::LruCache;
use metrics::counter;

use crate::error::{CacheError, CacheResult, Capability};

use super::config::CacheConfig;
use super::entry::{CachePriority, StoredEntry};
use super::events::StoreRemovalCause;
use super::keys::hash_value;
use super::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::store";
const METRIC_STORE_HIT: &str = "cachegraph_store_hit_total";
const METRIC_STORE_MISS: &str = "cachegraph_store_miss_total";
const METRIC_STORE_EVICT: &str = "cachegraph_store_evict_total";

/// Called with every entry a store drops on its own initiative.
///
/// Stores invoke it after releasing their internal locks.
pub type EvictionCallback = Arc<dyn Fn(&str, Arc<StoredEntry>, StoreRemovalCause) + Send + Sync>;

/// Features a store supports, queried once when a backend is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub clear: bool,
    pub dependencies: bool,
}

impl Capabilities {
    pub fn all() -> Self {
        Self {
            clear: true,
            dependencies: true,
        }
    }

    pub fn supports(&self, capability: Capability) -> bool {
        match capability {
            Capability::Clear => self.clear,
            Capability::Dependencies => self.dependencies,
        }
    }

    pub fn require(&self, capability: Capability) -> CacheResult<()> {
        if self.supports(capability) {
            Ok(())
        } else {
            Err(CacheError::unsupported(capability))
        }
    }
}

/// A key/value store holding [`StoredEntry`] values.
///
/// Removals requested through `put`, `remove`, `remove_if` and `clear` hand
/// the removed values back to the caller. Only removals the store decides on
/// by itself go through the eviction callback.
pub trait CacheStore: Send + Sync + 'static {
    fn capabilities(&self) -> Capabilities;

    /// Insert or replace. Returns the value that was superseded.
    fn put(&self, key: &str, value: Arc<StoredEntry>) -> CacheResult<Option<Arc<StoredEntry>>>;

    /// Read a live value, refreshing its sliding expiration.
    fn get(&self, key: &str) -> CacheResult<Option<Arc<StoredEntry>>>;

    /// Read without touching recency or expiration state.
    fn peek(&self, key: &str) -> CacheResult<Option<Arc<StoredEntry>>>;

    fn remove(&self, key: &str) -> CacheResult<Option<Arc<StoredEntry>>>;

    /// Remove the value for `key` only if `predicate` accepts it, checked
    /// atomically with the removal.
    fn remove_if(
        &self,
        key: &str,
        predicate: &dyn Fn(&StoredEntry) -> bool,
    ) -> CacheResult<Option<Arc<StoredEntry>>>;

    /// Remove everything, returning what was removed.
    fn clear(&self) -> CacheResult<Vec<Arc<StoredEntry>>> {
        Err(CacheError::unsupported(Capability::Clear))
    }

    fn keys(&self) -> CacheResult<Vec<String>>;

    fn register_eviction_callback(&self, callback: EvictionCallback);

    /// Drop expired values now instead of waiting for them to be read.
    fn purge_expired(&self) -> CacheResult<usize> {
        Ok(0)
    }

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct Slot {
    value: Arc<StoredEntry>,
    inserted_at: Instant,
    last_access: Instant,
}

impl Slot {
    fn new(value: Arc<StoredEntry>, now: Instant) -> Self {
        Self {
            value,
            inserted_at: now,
            last_access: now,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        let policy = self.value.entry().expiration();
        let elapsed = |since: Instant| now.saturating_duration_since(since);
        policy
            .absolute
            .is_some_and(|ttl: Duration| elapsed(self.inserted_at) >= ttl)
            || policy
                .sliding
                .is_some_and(|idle: Duration| elapsed(self.last_access) >= idle)
    }
}

enum Lookup {
    Hit(Arc<StoredEntry>),
    Expired(Arc<StoredEntry>),
    Miss,
}

/// One shard: an LRU for evictable entries plus a side table for pinned
/// ([`CachePriority::NotRemovable`]) entries, which never count against
/// capacity.
struct Shard {
    lru: LruCache<String, Slot>,
    pinned: HashMap<String, Slot>,
}

impl Shard {
    fn new(capacity: std::num::NonZeroUsize) -> Self {
        Self {
            lru: LruCache::new(capacity),
            pinned: HashMap::new(),
        }
    }

    fn slot_mut(&mut self, key: &str) -> Option<&mut Slot> {
        if self.pinned.contains_key(key) {
            self.pinned.get_mut(key)
        } else {
            self.lru.get_mut(key)
        }
    }

    fn slot(&self, key: &str) -> Option<&Slot> {
        self.pinned.get(key).or_else(|| self.lru.peek(key))
    }

    fn take(&mut self, key: &str) -> Option<Slot> {
        self.lru.pop(key).or_else(|| self.pinned.remove(key))
    }

    fn lookup(&mut self, key: &str, now: Instant) -> Lookup {
        match self.slot_mut(key) {
            None => return Lookup::Miss,
            Some(slot) if !slot.is_expired(now) => {
                slot.last_access = now;
                return Lookup::Hit(Arc::clone(&slot.value));
            }
            Some(_) => {}
        }
        match self.take(key) {
            Some(slot) => Lookup::Expired(slot.value),
            None => Lookup::Miss,
        }
    }

    fn len(&self) -> usize {
        self.lru.len() + self.pinned.len()
    }
}

/// In-process store: hash-routed shards, each an LRU with absolute and
/// sliding expiration measured on the monotonic clock.
///
/// Expired entries are dropped lazily on read, or eagerly by
/// [`CacheStore::purge_expired`]. `Low`, `Default` and `High` priorities share
/// one recency order; `NotRemovable` entries are exempt from capacity
/// eviction.
pub struct MemoryStore {
    shards: Box<[RwLock<Shard>]>,
    callback: RwLock<Option<EvictionCallback>>,
}

impl MemoryStore {
    pub fn new(config: &CacheConfig) -> Self {
        let shard_count = config.shards_non_zero().get();
        let per_shard = config.capacity_non_zero().get().div_ceil(shard_count);
        let per_shard =
            std::num::NonZeroUsize::new(per_shard).unwrap_or(std::num::NonZeroUsize::MIN);
        let shards = (0..shard_count)
            .map(|_| RwLock::new(Shard::new(per_shard)))
            .collect();
        Self {
            shards,
            callback: RwLock::new(None),
        }
    }

    fn shard(&self, key: &str) -> &RwLock<Shard> {
        let idx = (hash_value(key) % self.shards.len() as u64) as usize;
        &self.shards[idx]
    }

    fn notify(&self, removed: Vec<(String, Arc<StoredEntry>)>, cause: StoreRemovalCause) {
        if removed.is_empty() {
            return;
        }
        let label = match cause {
            StoreRemovalCause::Capacity => "capacity",
            StoreRemovalCause::Expired => "expired",
            StoreRemovalCause::Removed => "removed",
            StoreRemovalCause::Replaced => "replaced",
            StoreRemovalCause::Cleared => "cleared",
        };
        counter!(METRIC_STORE_EVICT, "cause" => label).increment(removed.len() as u64);

        let callback = rw_read(&self.callback, SOURCE, "notify").clone();
        if let Some(callback) = callback {
            for (key, value) in removed {
                callback(&key, value, cause);
            }
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(&CacheConfig::default())
    }
}

impl fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStore")
            .field("shards", &self.shards.len())
            .field("len", &self.len())
            .finish()
    }
}

impl CacheStore for MemoryStore {
    fn capabilities(&self) -> Capabilities {
        Capabilities::all()
    }

    fn put(&self, key: &str, value: Arc<StoredEntry>) -> CacheResult<Option<Arc<StoredEntry>>> {
        let now = Instant::now();
        let pinned = value.priority() == CachePriority::NotRemovable;
        let mut evicted = Vec::new();

        let previous = {
            let mut shard = rw_write(self.shard(key), SOURCE, "put");
            let previous = shard.take(key).map(|slot| slot.value);
            let slot = Slot::new(value, now);
            if pinned {
                shard.pinned.insert(key.to_string(), slot);
            } else if let Some((evicted_key, evicted_slot)) = shard.lru.push(key.to_string(), slot)
            {
                // The key was taken above, so push only returns a capacity victim.
                evicted.push((evicted_key, evicted_slot.value));
            }
            previous
        };

        self.notify(evicted, StoreRemovalCause::Capacity);
        Ok(previous)
    }

    fn get(&self, key: &str) -> CacheResult<Option<Arc<StoredEntry>>> {
        let lookup = rw_write(self.shard(key), SOURCE, "get").lookup(key, Instant::now());
        match lookup {
            Lookup::Hit(value) => {
                counter!(METRIC_STORE_HIT).increment(1);
                Ok(Some(value))
            }
            Lookup::Expired(value) => {
                counter!(METRIC_STORE_MISS).increment(1);
                self.notify(vec![(key.to_string(), value)], StoreRemovalCause::Expired);
                Ok(None)
            }
            Lookup::Miss => {
                counter!(METRIC_STORE_MISS).increment(1);
                Ok(None)
            }
        }
    }

    fn peek(&self, key: &str) -> CacheResult<Option<Arc<StoredEntry>>> {
        let shard = rw_read(self.shard(key), SOURCE, "peek");
        Ok(shard.slot(key).map(|slot| Arc::clone(&slot.value)))
    }

    fn remove(&self, key: &str) -> CacheResult<Option<Arc<StoredEntry>>> {
        Ok(rw_write(self.shard(key), SOURCE, "remove")
            .take(key)
            .map(|slot| slot.value))
    }

    fn remove_if(
        &self,
        key: &str,
        predicate: &dyn Fn(&StoredEntry) -> bool,
    ) -> CacheResult<Option<Arc<StoredEntry>>> {
        let mut shard = rw_write(self.shard(key), SOURCE, "remove_if");
        let matches = shard.slot(key).is_some_and(|slot| predicate(&slot.value));
        Ok(if matches {
            shard.take(key).map(|slot| slot.value)
        } else {
            None
        })
    }

    fn clear(&self) -> CacheResult<Vec<Arc<StoredEntry>>> {
        let mut removed = Vec::new();
        for shard in self.shards.iter() {
            let mut shard = rw_write(shard, SOURCE, "clear");
            while let Some((_, slot)) = shard.lru.pop_lru() {
                removed.push(slot.value);
            }
            removed.extend(shard.pinned.drain().map(|(_, slot)| slot.value));
        }
        Ok(removed)
    }

    fn keys(&self) -> CacheResult<Vec<String>> {
        let mut keys = Vec::new();
        for shard in self.shards.iter() {
            let shard = rw_read(shard, SOURCE, "keys");
            keys.extend(shard.lru.iter().map(|(key, _)| key.clone()));
            keys.extend(shard.pinned.keys().cloned());
        }
        Ok(keys)
    }

    fn register_eviction_callback(&self, callback: EvictionCallback) {
        *rw_write(&self.callback, SOURCE, "register_eviction_callback") = Some(callback);
    }

    fn purge_expired(&self) -> CacheResult<usize> {
        let now = Instant::now();
        let mut expired = Vec::new();
        for shard in self.shards.iter() {
            let mut shard = rw_write(shard, SOURCE, "purge_expired");
            let stale: Vec<String> = shard
                .lru
                .iter()
                .chain(shard.pinned.iter())
                .filter(|(_, slot)| slot.is_expired(now))
                .map(|(key, _)| key.clone())
                .collect();
            for key in stale {
                if let Some(slot) = shard.take(&key) {
                    expired.push((key, slot.value));
                }
            }
        }

        let count = expired.len();
        self.notify(expired, StoreRemovalCause::Expired);
        Ok(count)
    }

    fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| rw_read(shard, SOURCE, "len").len())
            .sum()
    }
}
