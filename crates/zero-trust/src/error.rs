//! Zero-trust core error types

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Internal fault raised by a zero-trust service.
///
/// Policy outcomes (a denied request, a locked account) are not errors; they are
/// reported through [`DenialCode`]. This enum covers the cases where a service could
/// not evaluate at all, which callers must treat as a deny.
#[derive(Debug, Error)]
pub enum AccessGuardError {
    /// State store read or write failed
    #[error("State store failure in {store}: {reason}")]
    StoreFailure { store: String, reason: String },

    /// Behavioral profile could not be read or is corrupted
    #[error("Behavioral profile unreadable for {user_id}: {reason}")]
    ProfileUnreadable { user_id: String, reason: String },

    /// Policy failed its sanity checks
    #[error("Invalid policy: {reason}")]
    InvalidPolicy { reason: String },

    /// Caller-supplied record failed validation
    #[error("Invalid {field}: {reason}")]
    InvalidInput { field: String, reason: String },

    /// Time window could not be parsed or is malformed
    #[error("Invalid time window: {reason}")]
    InvalidTimeWindow { reason: String },

    /// External dependency returned an unusable answer
    #[error("Dependency {dependency} failed: {reason}")]
    DependencyFailed { dependency: String, reason: String },

    /// Configuration error
    #[error("Configuration error: {message}")]
    ConfigurationError { message: String },

    /// Network error
    #[error("Network error: {source}")]
    NetworkError {
        #[from]
        source: reqwest::Error,
    },

    /// JSON serialization/deserialization error
    #[error("JSON error: {source}")]
    JsonError {
        #[from]
        source: serde_json::Error,
    },

    /// TOML configuration parse error
    #[error("TOML error: {source}")]
    TomlError {
        #[from]
        source: toml::de::Error,
    },

    /// I/O error
    #[error("I/O error: {source}")]
    IoError {
        #[from]
        source: std::io::Error,
    },
}

/// Zero-trust result type
pub type AccessGuardResult<T> = Result<T, AccessGuardError>;

/// Reason attached to every deny decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DenialCode {
    /// Device missing, untrusted, low-scored or stale
    DeviceNotTrusted,
    /// Country outside the allow-list
    LocationDenied,
    /// Outside every allowed time window
    TimeWindowDenied,
    /// Behavioral risk high or critical
    SuspiciousActivity,
    /// Concurrent session cap reached
    SessionLimitExceeded,
    /// MFA not verified for the session
    MfaRequired,
    /// Identity locked after too many failures
    AccountLocked,
    /// Backoff still owed before the next attempt
    AccountThrottled,
    /// Dependency circuit open
    CircuitOpen,
    /// Catch-all for faults during evaluation
    InternalValidationError,
}

impl DenialCode {
    /// Whether the same request may succeed later without an out-of-band change.
    pub fn is_retryable(self) -> bool {
        !matches!(self, Self::DeviceNotTrusted | Self::LocationDenied)
    }

    /// Stable wire name used in audit events.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DeviceNotTrusted => "DEVICE_NOT_TRUSTED",
            Self::LocationDenied => "LOCATION_DENIED",
            Self::TimeWindowDenied => "TIME_WINDOW_DENIED",
            Self::SuspiciousActivity => "SUSPICIOUS_ACTIVITY",
            Self::SessionLimitExceeded => "SESSION_LIMIT_EXCEEDED",
            Self::MfaRequired => "MFA_REQUIRED",
            Self::AccountLocked => "ACCOUNT_LOCKED",
            Self::AccountThrottled => "ACCOUNT_THROTTLED",
            Self::CircuitOpen => "CIRCUIT_OPEN",
            Self::InternalValidationError => "INTERNAL_VALIDATION_ERROR",
        }
    }
}

impl fmt::Display for DenialCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
