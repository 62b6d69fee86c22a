use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::error::EngineError;

static METRIC_DESCRIPTIONS: Once = Once::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Compact,
}

/// Install a global tracing subscriber. Hosts embedding the engine in a
/// larger process should install their own subscriber instead and skip
/// this.
pub fn init(default_directive: &str, format: LogFormat) -> Result<(), EngineError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(default_directive.parse().map_err(|err| {
            EngineError::configuration(format!("invalid log directive: {err}"))
        })?)
        .from_env_lossy();

    let fmt_layer = match format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            EngineError::configuration(format!("failed to install tracing subscriber: {err}"))
        })
}

pub(crate) fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_histogram!(
            "scaffale_build_duration_ms",
            Unit::Milliseconds,
            "Wall time of one cache slot rebuild."
        );
        describe_counter!(
            "scaffale_build_products_total",
            Unit::Count,
            "Product rows written during rebuilds."
        );
        describe_counter!(
            "scaffale_build_products_skipped_total",
            Unit::Count,
            "Products skipped during rebuilds for having no resolved price."
        );
        describe_counter!(
            "scaffale_build_relations_total",
            Unit::Count,
            "Relation rows written during rebuilds."
        );
        describe_counter!(
            "scaffale_build_relations_skipped_total",
            Unit::Count,
            "Relation rows skipped during rebuilds for integrity errors."
        );
        describe_counter!(
            "scaffale_build_failed_total",
            Unit::Count,
            "Rebuilds that failed and reset their target slot."
        );
        describe_histogram!(
            "scaffale_query_duration_ms",
            Unit::Milliseconds,
            "Wall time of one cache query."
        );
        describe_counter!(
            "scaffale_query_rows_scanned_total",
            Unit::Count,
            "Candidate rows streamed out of the flat table by queries."
        );
        describe_counter!(
            "scaffale_query_unavailable_total",
            Unit::Count,
            "Queries answered with `unavailable` because no slot was ready."
        );
    });
}
