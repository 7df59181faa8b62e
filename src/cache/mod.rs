//! Cachegraph cache engine
//!
//! - **Backend**: stores entries in a pluggable [`CacheStore`] and tracks
//!   which entries depend on which invalidation tokens
//! - **Named locks**: reference-counted per-key locks that let concurrent
//!   callers agree on who recomputes a value
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! capacity = 10000
//! shards = 16
//! event_capacity = 1024
//! max_key_len = 250
//! ```
//!
//! ## Keys
//!
//! ```
//! use cachegraph::cache::KeyBuilder;
//!
//! let key = KeyBuilder::new("Repo.load").arg(&7_u64).arg("alpha").finish();
//! assert_eq!(key, r#"Repo.load(u64=7,str="alpha")"#);
//! ```

mod backend;
mod codec;
mod config;
mod dependency;
mod entry;
mod events;
mod keys;
mod lock;
mod named_lock;
mod store;

pub use backend::{CachingBackend, ItemOptions};
pub use codec::{JsonCodec, ValueCodec};
pub use config::CacheConfig;
pub use dependency::{DependencyEdge, DependencyIndex};
pub use entry::{CacheEntry, CachePriority, ExpirationPolicy, StoredEntry};
pub use events::{BackendId, CacheEvent, EventHub, RemovalReason, StoreRemovalCause};
pub use keys::{
    KeyBuilder, KeyCodec, KeyComponent, KeyTag, MIN_FOLDED_KEY_LEN, build_key, hash_value,
};
pub use named_lock::{LockHandle, NamedLockRegistry};
pub use store::{Capabilities, CacheStore, EvictionCallback, MemoryStore};
