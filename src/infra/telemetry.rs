use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::cache::{
    METRIC_CACHE_HIT, METRIC_CACHE_MISS, METRIC_COMPILE, METRIC_COMPILE_FAILURE, METRIC_COMPILE_MS,
    METRIC_INVALIDATION,
};
use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
///
/// Events go to stderr so command output such as `transpile` stays clean on
/// stdout.
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
            .with_writer(std::io::stderr)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_target(true)
            .with_writer(std::io::stderr)
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

/// Register descriptions for every metric the cache emits. Idempotent.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            METRIC_CACHE_HIT,
            Unit::Count,
            "Lookups answered by an already built artifact."
        );
        describe_counter!(
            METRIC_CACHE_MISS,
            Unit::Count,
            "Lookups that started a new build."
        );
        describe_counter!(
            METRIC_COMPILE,
            Unit::Count,
            "Builds finished, successful or not."
        );
        describe_counter!(
            METRIC_COMPILE_FAILURE,
            Unit::Count,
            "Builds that ended in an error, labelled by error kind."
        );
        describe_counter!(
            METRIC_INVALIDATION,
            Unit::Count,
            "Entries invalidated, removed or reset, labelled by reason."
        );
        describe_histogram!(
            METRIC_COMPILE_MS,
            Unit::Milliseconds,
            "Build latency in milliseconds, including source reads."
        );
    });
}
