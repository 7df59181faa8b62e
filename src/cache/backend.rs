//! The caching backend: values in a pluggable store, dependency edges in a
//! separately owned index, removals published as events.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use metrics::histogram;
use serde::Serialize;
use serde::de::DeserializeOwned;
use time::OffsetDateTime;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::error::{CacheError, CacheResult, Capability};

use super::codec::{JsonCodec, ValueCodec};
use super::config::CacheConfig;
use super::dependency::DependencyIndex;
use super::entry::{CacheEntry, CachePriority, StoredEntry};
use super::events::{BackendId, CacheEvent, EventHub, RemovalReason, StoreRemovalCause};
use super::keys::{KeyCodec, KeyComponent};
use super::store::{Capabilities, CacheStore, MemoryStore};

const METRIC_INVALIDATE_MS: &str = "cachegraph_invalidate_ms";

/// Per-write options for [`CachingBackend::set_item`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemOptions {
    dependencies: BTreeSet<String>,
    absolute_expiration: Option<Duration>,
    sliding_expiration: Option<Duration>,
    priority: CachePriority,
}

impl ItemOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn depends_on<I, S>(mut self, tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies.extend(tokens.into_iter().map(Into::into));
        self
    }

    pub fn absolute_expiration(mut self, ttl: Duration) -> Self {
        self.absolute_expiration = Some(ttl);
        self
    }

    pub fn sliding_expiration(mut self, idle: Duration) -> Self {
        self.sliding_expiration = Some(idle);
        self
    }

    pub fn priority(mut self, priority: CachePriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn dependencies(&self) -> &BTreeSet<String> {
        &self.dependencies
    }
}

struct Inner<S> {
    id: BackendId,
    store: S,
    capabilities: Capabilities,
    index: DependencyIndex,
    events: EventHub,
    generations: AtomicU64,
}

impl<S: CacheStore> Inner<S> {
    fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Take an entry out of service. Only the first caller for a given entry
    /// drops its edges and gets `true`.
    fn retire(&self, stored: &StoredEntry) -> bool {
        if !stored.retire() {
            return false;
        }
        self.index.remove(
            stored.key(),
            stored.generation(),
            stored.entry().dependencies.iter().map(String::as_str),
        );
        true
    }

    fn on_store_removal(&self, key: &str, stored: Arc<StoredEntry>, cause: StoreRemovalCause) {
        let reason = RemovalReason::from(cause);
        if self.retire(&stored) {
            self.events.item_removed(key, reason);
        }
    }
}

/// Stores entries with dependency tokens and cascades invalidation.
///
/// Cloning is cheap and yields a handle to the same backend.
pub struct CachingBackend<S: CacheStore = MemoryStore, C: ValueCodec = JsonCodec> {
    inner: Arc<Inner<S>>,
    codec: C,
    keys: KeyCodec,
}

impl<S: CacheStore, C: ValueCodec + Clone> Clone for CachingBackend<S, C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            codec: self.codec.clone(),
            keys: self.keys,
        }
    }
}

impl<S: CacheStore, C: ValueCodec> fmt::Debug for CachingBackend<S, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachingBackend")
            .field("id", &self.inner.id)
            .field("capabilities", &self.inner.capabilities)
            .field("entries", &self.inner.store.len())
            .field("tokens", &self.inner.index.token_count())
            .finish()
    }
}

impl CachingBackend<MemoryStore, JsonCodec> {
    /// Backend over an in-process [`MemoryStore`] sized by `config`.
    pub fn memory(config: &CacheConfig) -> Self {
        Self::new(MemoryStore::new(config), config)
    }
}

impl<S: CacheStore> CachingBackend<S, JsonCodec> {
    pub fn new(store: S, config: &CacheConfig) -> Self {
        Self::with_codec(store, config, JsonCodec)
    }
}

impl<S: CacheStore, C: ValueCodec> CachingBackend<S, C> {
    pub fn with_codec(store: S, config: &CacheConfig, codec: C) -> Self {
        let id = BackendId::new();
        let capabilities = store.capabilities();
        let inner = Arc::new(Inner {
            id,
            store,
            capabilities,
            index: DependencyIndex::with_shards(config.shards_non_zero()),
            events: EventHub::new(id, config.event_capacity_non_zero().get()),
            generations: AtomicU64::new(0),
        });

        let weak = Arc::downgrade(&inner);
        inner
            .store
            .register_eviction_callback(Arc::new(
                move |key: &str, stored: Arc<StoredEntry>, cause: StoreRemovalCause| {
                    if let Some(inner) = weak.upgrade() {
                        inner.on_store_removal(key, stored, cause);
                    }
                },
            ));

        info!(
            backend_id = %id,
            clear = capabilities.clear,
            dependencies = capabilities.dependencies,
            "Caching backend ready"
        );

        Self {
            inner,
            codec,
            keys: KeyCodec::new(config.max_key_len),
        }
    }

    pub fn id(&self) -> BackendId {
        self.inner.id
    }

    pub fn capabilities(&self) -> Capabilities {
        self.inner.capabilities
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.inner.events.subscribe()
    }

    pub fn store(&self) -> &S {
        &self.inner.store
    }

    /// Build a key for `operation_id`, folded to this backend's length limit.
    pub fn build_key(&self, operation_id: &str, args: &[&dyn KeyComponent]) -> String {
        self.keys.build(operation_id, args)
    }

    /// Create or replace the entry for `key`.
    pub fn set_item(&self, key: &str, value: Bytes, options: ItemOptions) -> CacheResult<()> {
        let inner = &self.inner;
        if !options.dependencies.is_empty() {
            inner.capabilities.require(Capability::Dependencies)?;
        }

        let generation = inner.next_generation();
        let stored = Arc::new(StoredEntry::new(
            CacheEntry {
                key: key.to_string(),
                value,
                dependencies: options.dependencies,
                created_at: OffsetDateTime::now_utc(),
                absolute_expiration: options.absolute_expiration,
                sliding_expiration: options.sliding_expiration,
                priority: options.priority,
            },
            generation,
        ));

        // Edges go in before the value is visible, so an invalidation that
        // observes the value always finds the key in its snapshot.
        inner.index.record(
            key,
            generation,
            stored.entry().dependencies.iter().map(String::as_str),
        );

        let previous = match inner.store.put(key, Arc::clone(&stored)) {
            Ok(previous) => previous,
            Err(err) => {
                inner.retire(&stored);
                return Err(err);
            }
        };
        if let Some(previous) = previous {
            inner.retire(&previous);
        }

        debug!(
            backend_id = %inner.id,
            key,
            generation,
            dependencies = stored.entry().dependencies.len(),
            "Cache item stored"
        );
        Ok(())
    }

    pub fn get_item(&self, key: &str) -> CacheResult<Option<CacheEntry>> {
        Ok(self
            .inner
            .store
            .get(key)?
            .map(|stored| stored.entry().clone()))
    }

    pub fn contains_item(&self, key: &str) -> CacheResult<bool> {
        Ok(self.inner.store.get(key)?.is_some())
    }

    /// Remove the entry for `key`. Returns whether one existed.
    pub fn remove_item(&self, key: &str) -> CacheResult<bool> {
        let inner = &self.inner;
        match inner.store.remove(key)? {
            Some(stored) => {
                if inner.retire(&stored) {
                    inner.events.item_removed(key, RemovalReason::Removed);
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Remove every entry that currently depends on `token`.
    ///
    /// Returns the removed keys. Once this returns, none of them is readable
    /// from this backend until written again.
    pub fn invalidate_dependency(&self, token: &str) -> CacheResult<Vec<String>> {
        let inner = &self.inner;
        inner.capabilities.require(Capability::Dependencies)?;
        if !inner.index.contains(token) {
            return Ok(Vec::new());
        }

        let started = Instant::now();
        let mut removed = Vec::new();
        let outcome = inner.index.invalidate(token, |key| {
            let depends = |stored: &StoredEntry| stored.depends_on(token);
            let retired = match inner.store.remove_if(key, &depends)? {
                Some(stored) => inner.retire(&stored),
                None => false,
            };
            if retired {
                removed.push(key.to_string());
            }
            Ok(retired)
        });

        // Entries already gone are announced even when a later key failed.
        if outcome.is_ok() || !removed.is_empty() {
            inner.events.dependency_invalidated(token);
            for key in &removed {
                inner.events.item_removed(key, RemovalReason::Invalidated);
            }
        }
        if let Err(err) = outcome {
            warn!(
                backend_id = %inner.id,
                token,
                removed = removed.len(),
                error = %err,
                "Cache dependency invalidation stopped early"
            );
            return Err(err);
        }

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        histogram!(METRIC_INVALIDATE_MS).record(elapsed_ms);
        info!(
            backend_id = %inner.id,
            token,
            removed = removed.len(),
            elapsed_ms,
            "Cache dependency invalidated"
        );
        Ok(removed)
    }

    pub fn contains_dependency(&self, token: &str) -> CacheResult<bool> {
        self.inner.capabilities.require(Capability::Dependencies)?;
        Ok(self.inner.index.contains(token))
    }

    /// Remove every entry. Fails with `Unsupported` on stores that cannot
    /// clear.
    pub fn clear(&self) -> CacheResult<()> {
        let inner = &self.inner;
        inner.capabilities.require(Capability::Clear)?;

        let drained = inner.store.clear()?;
        let count = drained.len();
        for stored in drained {
            if inner.retire(&stored) {
                inner.events.item_removed(stored.key(), RemovalReason::Removed);
            }
        }
        info!(backend_id = %inner.id, removed = count, "Cache cleared");
        Ok(())
    }

    /// Drop expired entries now. Each one is reported as `Expired`.
    pub fn purge_expired(&self) -> CacheResult<usize> {
        self.inner.store.purge_expired()
    }

    pub fn set_value<T>(&self, key: &str, value: &T, options: ItemOptions) -> CacheResult<()>
    where
        T: Serialize + ?Sized,
    {
        let bytes = self.codec.encode(value)?;
        self.set_item(key, bytes, options)
    }

    pub fn get_value<T: DeserializeOwned>(&self, key: &str) -> CacheResult<Option<T>> {
        match self.get_item(key)? {
            Some(entry) => Ok(Some(self.codec.decode(&entry.value)?)),
            None => Ok(None),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.store.is_empty()
    }

    pub fn dependency_count(&self) -> usize {
        self.inner.index.token_count()
    }

    /// Verify that the index and the store agree. Only meaningful while no
    /// writes are in flight.
    pub fn check_consistency(&self) -> CacheResult<()> {
        let inner = &self.inner;

        let dangling = inner.index.dangling_tokens();
        if !dangling.is_empty() {
            return Err(CacheError::consistency(format!(
                "empty dependency sets left behind for {dangling:?}"
            )));
        }

        for edge in inner.index.edges() {
            let live = inner.store.peek(&edge.key)?;
            let matches = live.as_ref().is_some_and(|stored| {
                stored.depends_on(&edge.token) && edge.generations == [stored.generation()]
            });
            if !matches {
                return Err(CacheError::consistency(format!(
                    "token `{}` lists key `{}` (generations {:?}) without a live entry depending on it",
                    edge.token, edge.key, edge.generations
                )));
            }
        }

        for key in inner.store.keys()? {
            let Some(stored) = inner.store.peek(&key)? else {
                continue;
            };
            for token in &stored.entry().dependencies {
                if !inner.index.keys_for(token).contains(&key) {
                    return Err(CacheError::consistency(format!(
                        "entry `{key}` depends on `{token}` but the token does not list it"
                    )));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> CachingBackend {
        CachingBackend::memory(&CacheConfig::default())
    }

    fn drain(rx: &mut broadcast::Receiver<CacheEvent>) -> Vec<CacheEvent> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    #[test]
    fn set_get_and_remove() {
        let backend = backend();
        backend
            .set_item("k", Bytes::from_static(b"v"), ItemOptions::new())
            .expect("set");

        let entry = backend.get_item("k").expect("get").expect("present");
        assert_eq!(&entry.value[..], b"v");
        assert!(backend.contains_item("k").expect("contains"));

        assert!(backend.remove_item("k").expect("remove"));
        assert!(!backend.remove_item("k").expect("second remove"));
        assert!(backend.get_item("k").expect("get").is_none());
    }

    #[test]
    fn remove_emits_only_when_an_entry_existed() {
        let backend = backend();
        let mut rx = backend.subscribe();
        backend.remove_item("missing").expect("remove");
        assert!(drain(&mut rx).is_empty());

        backend
            .set_item("k", Bytes::new(), ItemOptions::new())
            .expect("set");
        backend.remove_item("k").expect("remove");
        assert_eq!(
            drain(&mut rx),
            vec![CacheEvent::ItemRemoved {
                key: "k".to_string(),
                reason: RemovalReason::Removed,
                source: backend.id(),
            }]
        );
    }

    #[test]
    fn overwrite_swaps_dependency_edges() {
        let backend = backend();
        let mut rx = backend.subscribe();
        backend
            .set_item("k", Bytes::from_static(b"1"), ItemOptions::new().depends_on(["a", "b"]))
            .expect("set");
        backend
            .set_item("k", Bytes::from_static(b"2"), ItemOptions::new().depends_on(["b", "c"]))
            .expect("overwrite");

        assert!(!backend.contains_dependency("a").expect("a"));
        assert!(backend.contains_dependency("b").expect("b"));
        assert!(backend.contains_dependency("c").expect("c"));
        assert!(drain(&mut rx).is_empty(), "replace is not a removal");
        backend.check_consistency().expect("consistent");
    }

    #[test]
    fn invalidate_unknown_token_is_a_no_op() {
        let backend = backend();
        let mut rx = backend.subscribe();
        assert!(backend.invalidate_dependency("nothing").expect("invalidate").is_empty());
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn invalidation_publishes_token_then_items() {
        let backend = backend();
        backend
            .set_item("i1", Bytes::new(), ItemOptions::new().depends_on(["d1"]))
            .expect("set");
        let mut rx = backend.subscribe();

        let removed = backend.invalidate_dependency("d1").expect("invalidate");

        assert_eq!(removed, vec!["i1".to_string()]);
        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], CacheEvent::DependencyInvalidated { token, .. } if token == "d1"));
        assert!(matches!(
            &events[1],
            CacheEvent::ItemRemoved { key, reason: RemovalReason::Invalidated, .. } if key == "i1"
        ));
    }

    #[test]
    fn capacity_eviction_cleans_edges_and_reports_evicted() {
        let backend = CachingBackend::memory(&CacheConfig {
            capacity: 1,
            shards: 1,
            ..Default::default()
        });
        let mut rx = backend.subscribe();
        backend
            .set_item("old", Bytes::new(), ItemOptions::new().depends_on(["t-old"]))
            .expect("set");
        backend
            .set_item("new", Bytes::new(), ItemOptions::new().depends_on(["t-new"]))
            .expect("set");

        assert!(!backend.contains_dependency("t-old").expect("t-old"));
        assert!(backend.contains_dependency("t-new").expect("t-new"));
        assert!(matches!(
            drain(&mut rx).as_slice(),
            [CacheEvent::ItemRemoved { key, reason: RemovalReason::Evicted, .. }] if key == "old"
        ));
        backend.check_consistency().expect("consistent");
    }

    #[test]
    fn expiry_reports_expired_and_cleans_edges() {
        let backend = backend();
        let mut rx = backend.subscribe();
        backend
            .set_item(
                "k",
                Bytes::new(),
                ItemOptions::new()
                    .depends_on(["t"])
                    .absolute_expiration(Duration::from_millis(5)),
            )
            .expect("set");

        std::thread::sleep(Duration::from_millis(20));

        assert_eq!(backend.purge_expired().expect("purge"), 1);
        assert!(!backend.contains_dependency("t").expect("t"));
        assert!(matches!(
            drain(&mut rx).as_slice(),
            [CacheEvent::ItemRemoved { reason: RemovalReason::Expired, .. }]
        ));
    }

    #[test]
    fn clear_removes_entries_and_edges() {
        let backend = backend();
        for i in 0..5 {
            backend
                .set_item(&format!("k{i}"), Bytes::new(), ItemOptions::new().depends_on(["t"]))
                .expect("set");
        }
        backend.clear().expect("clear");

        assert!(backend.is_empty());
        assert_eq!(backend.dependency_count(), 0);
    }

    #[test]
    fn typed_values_round_trip_through_the_codec() {
        let backend = backend();
        backend
            .set_value("list", &vec![1_u32, 2, 3], ItemOptions::new())
            .expect("set");
        let value: Option<Vec<u32>> = backend.get_value("list").expect("get");
        assert_eq!(value, Some(vec![1, 2, 3]));
        assert_eq!(backend.get_value::<Vec<u32>>("absent").expect("get"), None);
    }

    #[test]
    fn built_keys_respect_the_folding_limit() {
        let backend = CachingBackend::memory(&CacheConfig {
            max_key_len: 100,
            ..Default::default()
        });
        let long = "x".repeat(500);
        let key = backend.build_key("Repo.load", &[&long.as_str()]);
        assert!(key.len() <= 100);
        assert!(key.starts_with("Repo.load("));
    }
}
