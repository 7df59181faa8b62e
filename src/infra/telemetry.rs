use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_target(true)
            .with_thread_names(true)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

/// Register descriptions for every metric the engine emits. Safe to call
/// more than once.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "cachegraph_item_removed_total",
            Unit::Count,
            "Entries that left the cache, labelled by removal reason."
        );
        describe_counter!(
            "cachegraph_dependency_invalidated_total",
            Unit::Count,
            "Dependency tokens invalidated."
        );
        describe_counter!(
            "cachegraph_store_hit_total",
            Unit::Count,
            "Store reads that found a live entry."
        );
        describe_counter!(
            "cachegraph_store_miss_total",
            Unit::Count,
            "Store reads that found nothing or an expired entry."
        );
        describe_counter!(
            "cachegraph_store_evict_total",
            Unit::Count,
            "Entries the store dropped on its own, labelled by cause."
        );
        describe_histogram!(
            "cachegraph_invalidate_ms",
            Unit::Milliseconds,
            "Dependency invalidation latency in milliseconds."
        );
        describe_gauge!(
            "cachegraph_named_locks",
            Unit::Count,
            "Named lock records currently registered."
        );
    });
}
