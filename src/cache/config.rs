//! Cache engine configuration.
//!
//! Sizes the in-process store, the event channel and key folding. Loaded
//! from the `[cache]` section of `cachegraph.toml`.

use std::num::NonZeroUsize;

use serde::Deserialize;

const DEFAULT_CAPACITY: usize = 10_000;
const DEFAULT_SHARDS: usize = 16;
const DEFAULT_EVENT_CAPACITY: usize = 1024;
const DEFAULT_MAX_KEY_LEN: usize = 250;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum evictable entries across all shards. Pinned entries do not count.
    pub capacity: usize,
    /// Number of independently locked store shards.
    pub shards: usize,
    /// Events buffered per subscriber before it starts lagging.
    pub event_capacity: usize,
    /// Keys longer than this are folded to a digest. Zero disables folding.
    pub max_key_len: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            shards: DEFAULT_SHARDS,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            max_key_len: DEFAULT_MAX_KEY_LEN,
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            capacity: settings.capacity.get(),
            shards: settings.shards.get(),
            event_capacity: settings.event_capacity.get(),
            max_key_len: settings.max_key_len,
        }
    }
}

impl CacheConfig {
    /// Returns the capacity as NonZeroUsize, clamping to 1 if zero.
    pub fn capacity_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.capacity).unwrap_or(NonZeroUsize::MIN)
    }

    /// Returns the shard count as NonZeroUsize, clamping to 1 if zero.
    pub fn shards_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.shards).unwrap_or(NonZeroUsize::MIN)
    }

    pub fn event_capacity_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.event_capacity).unwrap_or(NonZeroUsize::MIN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = CacheConfig::default();
        assert_eq!(config.capacity, 10_000);
        assert_eq!(config.shards, 16);
        assert_eq!(config.event_capacity, 1024);
        assert_eq!(config.max_key_len, 250);
    }

    #[test]
    fn non_zero_clamps_to_min() {
        let config = CacheConfig {
            capacity: 0,
            shards: 0,
            event_capacity: 0,
            ..Default::default()
        };
        assert_eq!(config.capacity_non_zero().get(), 1);
        assert_eq!(config.shards_non_zero().get(), 1);
        assert_eq!(config.event_capacity_non_zero().get(), 1);
    }

    #[test]
    fn deserializes_partial_tables() {
        let config: CacheConfig =
            serde_json::from_str(r#"{ "capacity": 32 }"#).expect("partial config");
        assert_eq!(config.capacity, 32);
        assert_eq!(config.shards, DEFAULT_SHARDS);
    }
}
