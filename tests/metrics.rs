use std::collections::HashSet;
use std::time::Duration;

use bytes::Bytes;
use cachegraph::cache::{CacheConfig, CachingBackend, ItemOptions, NamedLockRegistry};
use cachegraph::infra::telemetry;
use metrics_util::debugging::DebuggingRecorder;
use serial_test::serial;

#[test]
#[serial]
fn engine_paths_emit_expected_metric_keys() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder
        .install()
        .expect("debug metrics recorder should install in this test process");
    telemetry::describe_metrics();

    // Store hit/miss/evict
    let backend = CachingBackend::memory(&CacheConfig {
        capacity: 1,
        shards: 1,
        ..Default::default()
    });
    backend
        .set_item("a", Bytes::from_static(b"1"), ItemOptions::new().depends_on(["t"]))
        .expect("set a");
    assert!(backend.get_item("a").expect("get a").is_some());
    assert!(backend.get_item("missing").expect("get missing").is_none());
    backend
        .set_item("b", Bytes::from_static(b"2"), ItemOptions::new().depends_on(["t"]))
        .expect("set b evicts a");

    // Invalidation counters and latency
    assert_eq!(
        backend.invalidate_dependency("t").expect("invalidate"),
        vec!["b".to_string()]
    );

    // Lock gauge
    let locks = NamedLockRegistry::new();
    let handle = locks.get_lock("b");
    handle.dispose().expect("dispose");

    // Expiry path
    backend
        .set_item(
            "c",
            Bytes::new(),
            ItemOptions::new().absolute_expiration(Duration::from_millis(1)),
        )
        .expect("set c");
    std::thread::sleep(Duration::from_millis(10));
    assert_eq!(backend.purge_expired().expect("purge"), 1);

    let names: HashSet<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, _)| composite_key.key().name().to_string())
        .collect();

    let expected = [
        "cachegraph_store_hit_total",
        "cachegraph_store_miss_total",
        "cachegraph_store_evict_total",
        "cachegraph_item_removed_total",
        "cachegraph_dependency_invalidated_total",
        "cachegraph_invalidate_ms",
        "cachegraph_named_locks",
    ];

    for metric in expected {
        assert!(names.contains(metric), "missing metric: {metric}");
    }
}
