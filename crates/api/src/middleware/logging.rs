//! Logging initialization.

use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
    EnvFilter,
};

use crate::config::LoggingConfig;

/// Per-request and per-query noise that drowns out worker lifecycle events.
const QUIET_TARGETS: &[&str] = &["sqlx::query=warn", "hyper=warn", "h2=warn"];

/// Install the global subscriber. `RUST_LOG` overrides `logging.level`.
pub fn init_logging(config: &LoggingConfig) -> Result<(), TryInitError> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directive(&config.level)));

    let subscriber = tracing_subscriber::registry().with(env_filter);

    if config.format == "json" {
        // Worker spans carry task_id/owner_id, so closing them logs the
        // elapsed time of every export.
        let json_layer = fmt::layer()
            .json()
            .with_span_events(FmtSpan::CLOSE)
            .with_current_span(true)
            .with_span_list(false)
            .with_target(true);
        subscriber.with(json_layer).try_init()
    } else {
        let text_layer = fmt::layer()
            .compact()
            .with_span_events(FmtSpan::NONE)
            .with_target(false);
        subscriber.with(text_layer).try_init()
    }
}

fn filter_directive(level: &str) -> String {
    let mut directive = level.to_string();
    for target in QUIET_TARGETS {
        directive.push(',');
        directive.push_str(target);
    }
    directive
}
