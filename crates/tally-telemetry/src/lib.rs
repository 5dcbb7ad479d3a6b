use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by the RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "tally_engine" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
        }
    }
}

impl TelemetryConfig {
    /// Assemble the EnvFilter directive string: default level first, then
    /// per-module overrides.
    fn filter_directives(&self) -> String {
        let mut directives = self.log_level.to_string().to_lowercase();
        for (module, level) in &self.module_levels {
            directives.push_str(&format!(",{module}={}", level.to_string().to_lowercase()));
        }
        directives
    }

    fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(self.filter_directives()))
    }
}

/// Install the global subscriber. Call once at startup.
pub fn init_telemetry(config: &TelemetryConfig) {
    tracing_subscriber::registry()
        .with(config.env_filter())
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Like [`init_telemetry`] but tolerates an already-installed subscriber,
/// for tests and embedders that set up their own.
pub fn try_init_telemetry(config: &TelemetryConfig) -> bool {
    tracing_subscriber::registry()
        .with(config.env_filter())
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .is_ok()
}
