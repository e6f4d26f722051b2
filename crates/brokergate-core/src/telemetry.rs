// Logging setup
//
// Decision: tracing + EnvFilter, filter from RUST_LOG or LOG_LEVEL, default "info"
// Decision: Always write to stderr; worker processes use stdout for frames

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Logged once at startup
    pub service_name: String,
    /// EnvFilter directive; `None` means "info"
    pub log_filter: Option<String>,
    /// Include module targets in log lines
    pub with_target: bool,
    /// ANSI colors; off for worker processes whose stderr is usually captured
    pub ansi: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "brokergate".to_string(),
            log_filter: None,
            with_target: true,
            ansi: true,
        }
    }
}

impl TelemetryConfig {
    /// Reads:
    /// - `RUST_LOG` or `LOG_LEVEL`: filter directive
    /// - `BROKERGATE_LOG_ANSI`: "false" disables colors
    pub fn from_env(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            log_filter: std::env::var("RUST_LOG")
                .ok()
                .or_else(|| std::env::var("LOG_LEVEL").ok()),
            with_target: true,
            ansi: std::env::var("BROKERGATE_LOG_ANSI")
                .map(|v| v.to_lowercase() != "false")
                .unwrap_or(true),
        }
    }

    pub fn with_ansi(mut self, ansi: bool) -> Self {
        self.ansi = ansi;
        self
    }

    fn filter(&self) -> EnvFilter {
        self.log_filter
            .as_ref()
            .and_then(|f| EnvFilter::try_new(f).ok())
            .unwrap_or_else(|| EnvFilter::new("info"))
    }
}

// ============================================================================
// Initialization
// ============================================================================

/// Install the global subscriber
///
/// Returns false when a subscriber was already installed (tests, embedding hosts).
pub fn init_telemetry(config: &TelemetryConfig) -> bool {
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(config.with_target)
        .with_ansi(config.ansi)
        .with_filter(config.filter());

    let installed = tracing_subscriber::registry()
        .with(console_layer)
        .try_init()
        .is_ok();

    if installed {
        tracing::debug!(service = %config.service_name, "Logging initialized");
    }
    installed
}
