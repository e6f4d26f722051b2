use anyhow::{Context, Result};
use brokergate_core::telemetry::{init_telemetry, TelemetryConfig};
use brokergate_worker::{serve_stdio, SessionEnd, StandardHandlers};
use std::sync::Arc;

/// Exit code when a handler ends the session abnormally (EX_SOFTWARE)
const EXIT_FATAL: i32 = 70;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    // stdout carries frames; logs go to stderr without colors
    init_telemetry(&TelemetryConfig::from_env("brokergate-worker").with_ansi(false));

    let handlers = StandardHandlers::from_env();
    tracing::info!(
        pid = std::process::id(),
        diagnostics = handlers.diagnostics,
        "brokergate-worker starting"
    );

    let end = serve_stdio(Arc::new(handlers))
        .await
        .context("worker session failed")?;

    match end {
        SessionEnd::Fatal(reason) => {
            tracing::error!(reason = %reason, "Worker session aborted");
            std::process::exit(EXIT_FATAL);
        }
        other => {
            tracing::info!(end = ?other, "Worker shutdown complete");
            Ok(())
        }
    }
}
