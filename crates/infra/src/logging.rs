//! Tracing subscriber setup
//!
//! `RUST_LOG` wins over the configured level so operators can raise
//! verbosity for one module without touching the config file.

use sheetgate_domain::{GatewayError, LogFormat, LoggingSettings, Result};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Install the global subscriber
///
/// Returns `Ok(false)` if a subscriber was already installed (tests, or an
/// embedding host that configured its own).
///
/// # Errors
/// Returns `GatewayError::Config` when `settings.level` is not a valid
/// filter directive.
pub fn init(settings: &LoggingSettings) -> Result<bool> {
    let filter = build_filter(settings)?;
    let registry = tracing_subscriber::registry().with(filter);

    let installed = match settings.format {
        LogFormat::Pretty => registry
            .with(fmt::layer().with_target(true).with_span_events(FmtSpan::NONE).compact())
            .try_init()
            .is_ok(),
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_span_events(FmtSpan::CLOSE)
                    .with_ansi(false)
                    .json()
                    .with_current_span(true),
            )
            .try_init()
            .is_ok(),
    };

    if !installed {
        tracing::debug!("global tracing subscriber already set; keeping it");
    }
    Ok(installed)
}

fn build_filter(settings: &LoggingSettings) -> Result<EnvFilter> {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.level))
        .map_err(|e| GatewayError::config(format!("Invalid log level '{}': {e}", settings.level)))
}
