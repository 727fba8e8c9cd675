// Tracing subscriber setup
//
// Configure via environment variables:
// - RUST_LOG or LOG_LEVEL: filter directives
// - LOG_FORMAT: "compact" for single-line output

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const DEFAULT_LOG_FILTER: &str =
    "vigil_server=debug,vigil_pipeline=info,vigil_core=info,tower_http=info";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    pub log_filter: Option<String>,
    pub compact: bool,
}

impl TelemetryConfig {
    pub fn from_env() -> Self {
        Self {
            log_filter: std::env::var("RUST_LOG")
                .or_else(|_| std::env::var("LOG_LEVEL"))
                .ok()
                .filter(|s| !s.is_empty()),
            compact: std::env::var("LOG_FORMAT")
                .map(|v| v.eq_ignore_ascii_case("compact"))
                .unwrap_or(false),
        }
    }

    fn filter(&self) -> EnvFilter {
        let directives = self.log_filter.as_deref().unwrap_or(DEFAULT_LOG_FILTER);
        EnvFilter::try_new(directives).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
    }
}

/// Install the global subscriber. Call once at startup.
pub fn init_telemetry(config: &TelemetryConfig) {
    let registry = tracing_subscriber::registry().with(config.filter());
    if config.compact {
        registry
            .with(tracing_subscriber::fmt::layer().compact().with_target(false))
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
