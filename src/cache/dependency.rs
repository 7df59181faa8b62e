//! Backward dependency index.
//!
//! Maps each dependency token to the keys whose stored entries declared it.
//! The forward direction is not duplicated here: every stored entry already
//! carries its own dependency set.
//!
//! Edges are tagged with the generation of the entry that recorded them. An
//! overwrite adds the new entry's edges and later drops the old entry's
//! edges; because each side only touches its own generation, the order in
//! which those two steps land never strips the live entry of an edge.

use std::collections::HashMap;
use std::num::NonZeroUsize;

use dashmap::DashMap;

use crate::error::CacheResult;

/// Generations of one key that currently reference a token.
type KeyGenerations = HashMap<String, Vec<u64>>;

/// One edge of the backward index, as returned by [`DependencyIndex::edges`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyEdge {
    pub token: String,
    pub key: String,
    pub generations: Vec<u64>,
}

/// Token → keys index.
///
/// Locking is per map shard, not per token: two tokens contend only when
/// they hash to the same shard, and only for the duration of one set update.
/// A token's key set exists only while it is non-empty.
#[derive(Debug, Default)]
pub struct DependencyIndex {
    backward: DashMap<String, KeyGenerations>,
}

impl DependencyIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index with at least `shards` map shards, rounded up to a power of two.
    pub fn with_shards(shards: NonZeroUsize) -> Self {
        Self {
            backward: DashMap::with_shard_amount(shards.get().next_power_of_two().max(2)),
        }
    }

    /// Record that generation `generation` of `key` depends on every token.
    pub fn record<'a, I>(&self, key: &str, generation: u64, tokens: I)
    where
        I: IntoIterator<Item = &'a str>,
    {
        for token in tokens {
            let mut keys = self.backward.entry(token.to_string()).or_default();
            let generations = keys.entry(key.to_string()).or_default();
            if !generations.contains(&generation) {
                generations.push(generation);
            }
        }
    }

    /// Drop the edges recorded by generation `generation` of `key`, deleting
    /// any key set that becomes empty.
    pub fn remove<'a, I>(&self, key: &str, generation: u64, tokens: I)
    where
        I: IntoIterator<Item = &'a str>,
    {
        for token in tokens {
            self.backward.remove_if_mut(token, |_, keys| {
                if let Some(generations) = keys.get_mut(key) {
                    generations.retain(|g| *g != generation);
                    if generations.is_empty() {
                        keys.remove(key);
                    }
                }
                keys.is_empty()
            });
        }
    }

    /// Snapshot of the keys currently depending on `token`, sorted.
    pub fn keys_for(&self, token: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .backward
            .get(token)
            .map(|keys| keys.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort_unstable();
        keys
    }

    /// Snapshot the keys for `token`, then hand each one to `remover`.
    ///
    /// Removing an entry drops its edges, including the ones for `token`, so
    /// the snapshot must be taken before the first removal. Returns the keys
    /// for which `remover` reported a removal.
    pub fn invalidate<F>(&self, token: &str, mut remover: F) -> CacheResult<Vec<String>>
    where
        F: FnMut(&str) -> CacheResult<bool>,
    {
        let snapshot = self.keys_for(token);
        let mut removed = Vec::with_capacity(snapshot.len());
        for key in snapshot {
            if remover(&key)? {
                removed.push(key);
            }
        }
        Ok(removed)
    }

    pub fn contains(&self, token: &str) -> bool {
        self.backward.contains_key(token)
    }

    pub fn token_count(&self) -> usize {
        self.backward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backward.is_empty()
    }

    /// Copy of every edge, for consistency checks at quiescent points.
    pub fn edges(&self) -> Vec<DependencyEdge> {
        let mut edges = Vec::new();
        for shard_entry in self.backward.iter() {
            for (key, generations) in shard_entry.value() {
                edges.push(DependencyEdge {
                    token: shard_entry.key().clone(),
                    key: key.clone(),
                    generations: generations.clone(),
                });
            }
        }
        edges
    }

    /// Tokens whose key set is present but empty. Always empty unless an
    /// edge cleanup was skipped.
    pub fn dangling_tokens(&self) -> Vec<String> {
        self.backward
            .iter()
            .filter(|entry| entry.value().is_empty() || entry.value().values().any(Vec::is_empty))
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn clear(&self) {
        self.backward.clear();
    }
}
