use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "iris_broker" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// Emit one JSON object per event instead of human-readable lines.
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("invalid log filter: {0}")]
    InvalidFilter(String),

    #[error("a global subscriber is already installed: {0}")]
    AlreadyInitialized(String),
}

/// Build the filter: RUST_LOG when set, else the configured level, plus
/// per-module overrides.
pub fn env_filter(config: &TelemetryConfig) -> Result<EnvFilter, TelemetryError> {
    let base = std::env::var(EnvFilter::DEFAULT_ENV)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| level_directive(config.log_level));
    let directives = with_module_levels(&base, &config.module_levels);
    EnvFilter::try_new(&directives).map_err(|e| TelemetryError::InvalidFilter(e.to_string()))
}

/// Initialize the global tracing subscriber. Call once at startup.
///
/// Both layers write to stderr so log lines stay off the interactive prompt.
pub fn init_telemetry(config: TelemetryConfig) -> Result<(), TelemetryError> {
    let filter = env_filter(&config)?;

    let json_layer = config.json.then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .with_writer(std::io::stderr)
    });
    let text_layer = (!config.json).then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_writer(std::io::stderr)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .try_init()
        .map_err(|e| TelemetryError::AlreadyInitialized(e.to_string()))
}

fn level_directive(level: Level) -> String {
    level.to_string().to_lowercase()
}

/// Append `module=level` directives to a base filter string.
pub fn with_module_levels(base: &str, module_levels: &[(String, Level)]) -> String {
    let mut directives = base.to_string();
    for (module, level) in module_levels {
        directives.push_str(&format!(",{}={}", module, level_directive(*level)));
    }
    directives
}

/// Parse a level name as accepted on the command line (`warn`, `WARNING`, ...).
pub fn parse_level(raw: &str) -> Option<Level> {
    match raw.trim().to_lowercase().as_str() {
        "trace" => Some(Level::TRACE),
        "debug" => Some(Level::DEBUG),
        "info" => Some(Level::INFO),
        "warn" | "warning" => Some(Level::WARN),
        "error" => Some(Level::ERROR),
        _ => None,
    }
}
