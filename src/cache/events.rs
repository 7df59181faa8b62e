//! Removal taxonomy and the per-backend event channel.

use std::fmt;

use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

const METRIC_ITEM_REMOVED: &str = "cachegraph_item_removed_total";
const METRIC_DEPENDENCY_INVALIDATED: &str = "cachegraph_dependency_invalidated_total";

/// Identifies the backend instance that emitted an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BackendId(Uuid);

impl BackendId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for BackendId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Why an entry left the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalReason {
    Removed,
    Expired,
    Evicted,
    Invalidated,
    Other,
}

impl RemovalReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RemovalReason::Removed => "removed",
            RemovalReason::Expired => "expired",
            RemovalReason::Evicted => "evicted",
            RemovalReason::Invalidated => "invalidated",
            RemovalReason::Other => "other",
        }
    }
}

impl fmt::Display for RemovalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Native removal causes a store may report through its eviction callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreRemovalCause {
    /// Removed on request.
    Removed,
    /// Superseded by a newer value for the same key.
    Replaced,
    /// Absolute or sliding lifetime elapsed.
    Expired,
    /// Dropped to stay within capacity.
    Capacity,
    /// Dropped by a bulk clear.
    Cleared,
}

impl From<StoreRemovalCause> for RemovalReason {
    fn from(cause: StoreRemovalCause) -> Self {
        match cause {
            StoreRemovalCause::Removed | StoreRemovalCause::Cleared => RemovalReason::Removed,
            StoreRemovalCause::Expired => RemovalReason::Expired,
            StoreRemovalCause::Capacity => RemovalReason::Evicted,
            StoreRemovalCause::Replaced => RemovalReason::Other,
        }
    }
}

/// Side effects observable by subscribers of a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    ItemRemoved {
        key: String,
        reason: RemovalReason,
        source: BackendId,
    },
    DependencyInvalidated {
        token: String,
        source: BackendId,
    },
}

impl CacheEvent {
    pub fn source(&self) -> BackendId {
        match self {
            CacheEvent::ItemRemoved { source, .. } => *source,
            CacheEvent::DependencyInvalidated { source, .. } => *source,
        }
    }
}

/// Fan-out of [`CacheEvent`]s to every subscriber of one backend.
///
/// Publishing never blocks. Subscribers that fall behind by more than the
/// channel capacity observe `RecvError::Lagged`.
#[derive(Debug)]
pub struct EventHub {
    source: BackendId,
    sender: broadcast::Sender<CacheEvent>,
}

impl EventHub {
    pub fn new(source: BackendId, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { source, sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.sender.subscribe()
    }

    pub fn item_removed(&self, key: &str, reason: RemovalReason) {
        counter!(METRIC_ITEM_REMOVED, "reason" => reason.as_str()).increment(1);
        debug!(backend_id = %self.source, key, %reason, "Cache item removed");
        self.publish(CacheEvent::ItemRemoved {
            key: key.to_string(),
            reason,
            source: self.source,
        });
    }

    pub fn dependency_invalidated(&self, token: &str) {
        counter!(METRIC_DEPENDENCY_INVALIDATED).increment(1);
        debug!(backend_id = %self.source, token, "Cache dependency invalidated");
        self.publish(CacheEvent::DependencyInvalidated {
            token: token.to_string(),
            source: self.source,
        });
    }

    /// Dropped when no receiver is subscribed.
    fn publish(&self, event: CacheEvent) {
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_store_cause_maps_to_a_reason() {
        let cases = [
            (StoreRemovalCause::Removed, RemovalReason::Removed),
            (StoreRemovalCause::Cleared, RemovalReason::Removed),
            (StoreRemovalCause::Expired, RemovalReason::Expired),
            (StoreRemovalCause::Capacity, RemovalReason::Evicted),
            (StoreRemovalCause::Replaced, RemovalReason::Other),
        ];
        for (cause, expected) in cases {
            assert_eq!(RemovalReason::from(cause), expected, "{cause:?}");
        }
    }

    #[test]
    fn hub_delivers_events_in_order() {
        let source = BackendId::new();
        let hub = EventHub::new(source, 8);
        let mut rx = hub.subscribe();

        hub.item_removed("k1", RemovalReason::Invalidated);
        hub.dependency_invalidated("d1");

        assert_eq!(
            rx.try_recv().expect("first event"),
            CacheEvent::ItemRemoved {
                key: "k1".to_string(),
                reason: RemovalReason::Invalidated,
                source,
            }
        );
        let second = rx.try_recv().expect("second event");
        assert_eq!(second.source(), source);
        assert!(matches!(second, CacheEvent::DependencyInvalidated { ref token, .. } if token == "d1"));
    }

    #[test]
    fn publishing_without_subscribers_is_silent() {
        let hub = EventHub::new(BackendId::new(), 1);
        hub.item_removed("k", RemovalReason::Removed);
        hub.dependency_invalidated("t");
    }

    #[test]
    fn backend_ids_are_unique() {
        assert_ne!(BackendId::new(), BackendId::new());
    }

    #[test]
    fn reason_display_matches_metric_label() {
        assert_eq!(RemovalReason::Evicted.to_string(), "evicted");
        assert_eq!(RemovalReason::Invalidated.as_str(), "invalidated");
    }
}
