//! Tracing subscriber setup for hosts that embed the core

use crate::error::{AccessGuardError, AccessGuardResult};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Filter used when `RUST_LOG` is unset, e.g. `info` or `sitegate=debug`
    pub default_filter: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
    /// Include the event target
    pub with_target: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            default_filter: "info".to_string(),
            json: false,
            with_target: true,
        }
    }
}

impl TelemetryConfig {
    /// Check that `default_filter` parses.
    pub fn validate(&self) -> AccessGuardResult<()> {
        EnvFilter::try_new(&self.default_filter)
            .map(|_| ())
            .map_err(|e| AccessGuardError::ConfigurationError {
                message: format!("telemetry.default_filter: {e}"),
            })
    }
}

/// Install the global subscriber. Later calls are no-ops and return `false`.
pub fn init(config: &TelemetryConfig) -> AccessGuardResult<bool> {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return Ok(false);
    }

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.default_filter))
        .map_err(|e| AccessGuardError::ConfigurationError {
            message: format!("telemetry.default_filter: {e}"),
        })?;

    let registry = tracing_subscriber::registry().with(filter);
    let installed = if config.json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(config.with_target),
            )
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(config.with_target))
            .try_init()
    };

    // Another subscriber may already be installed by the host.
    Ok(installed.is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        let config = TelemetryConfig::default();
        let _ = init(&config);
        assert!(!init(&config).unwrap());
    }

    #[test]
    fn test_invalid_filter_rejected() {
        let config = TelemetryConfig {
            default_filter: "sitegate=[".to_string(),
            ..TelemetryConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
