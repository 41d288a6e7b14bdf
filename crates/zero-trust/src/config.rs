//! Service configuration
//!
//! One TOML document with a section per service. Every field has a default, so an
//! empty file is a valid configuration.

use crate::behavior_analysis::BehaviorConfig;
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::error::{AccessGuardError, AccessGuardResult};
use crate::lockout::LockoutConfig;
use crate::telemetry::TelemetryConfig;
use crate::trust_store::TrustConfig;
use crate::validator::ValidatorConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Configuration for every service in the core
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessGuardConfig {
    /// Per-dependency circuit breaking
    pub circuit_breaker: CircuitBreakerConfig,
    /// Login brute-force protection
    pub lockout: LockoutConfig,
    /// Device trust and profile seeding
    pub trust: TrustConfig,
    /// Behavioral scoring
    pub behavior: BehaviorConfig,
    /// Request validation
    pub validator: ValidatorConfig,
    /// Logging
    pub telemetry: TelemetryConfig,
}

impl AccessGuardConfig {
    /// Load and validate configuration from a TOML file.
    pub fn load_from(path: impl AsRef<Path>) -> AccessGuardResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content).map_err(|e| match e {
            AccessGuardError::ConfigurationError { message } => {
                AccessGuardError::ConfigurationError {
                    message: format!("{}: {message}", path.display()),
                }
            }
            other => other,
        })?;
        tracing::info!(path = %path.display(), "access guard configuration loaded");
        Ok(config)
    }

    /// Parse and validate configuration from TOML text.
    pub fn from_toml_str(content: &str) -> AccessGuardResult<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize back to TOML.
    pub fn to_toml_string(&self) -> AccessGuardResult<String> {
        toml::to_string_pretty(self).map_err(|e| AccessGuardError::ConfigurationError {
            message: e.to_string(),
        })
    }

    /// Validate every section.
    pub fn validate(&self) -> AccessGuardResult<()> {
        self.circuit_breaker.validate()?;
        self.lockout.validate()?;
        self.trust.validate()?;
        self.behavior.validate()?;
        self.validator.validate()?;
        self.telemetry.validate()
    }
}
