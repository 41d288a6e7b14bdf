//! Request context, access policy and decision types

use crate::error::{AccessGuardError, AccessGuardResult, DenialCode};
use chrono::{DateTime, Duration, NaiveTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Resolved geographic origin of a request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    /// ISO country code
    pub country: String,
    /// Region or province
    pub region: Option<String>,
    /// City
    pub city: Option<String>,
}

impl Location {
    /// Location known only down to the country.
    pub fn country(code: impl Into<String>) -> Self {
        Self {
            country: code.into(),
            region: None,
            city: None,
        }
    }
}

/// Everything known about the caller at request time. Built by the caller, never
/// mutated by the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZeroTrustContext {
    /// User ID
    pub user_id: String,
    /// Device ID, when the client presented one
    pub device_id: Option<String>,
    /// Network origin (IP string)
    pub ip_address: String,
    /// Client signature (user agent)
    pub user_agent: String,
    /// Resolved location
    pub location: Option<Location>,
    /// Session ID
    pub session_id: String,
    /// Request timestamp
    pub timestamp: DateTime<Utc>,
}

/// Access request evaluated by the validator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessRequest {
    /// Requesting user; must match `context.user_id`
    pub user_id: String,
    /// Resource being accessed
    pub resource_id: String,
    /// Action on the resource
    pub action: String,
    /// Caller context
    pub context: ZeroTrustContext,
}

/// Inclusive weekly time window in HH:MM on the policy clock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    /// Day of week, 0 = Sunday through 6 = Saturday
    pub day_of_week: u8,
    /// First allowed minute
    #[serde(with = "hhmm")]
    pub start: NaiveTime,
    /// Last allowed minute, inclusive
    #[serde(with = "hhmm")]
    pub end: NaiveTime,
}

impl TimeWindow {
    /// Build a window from `HH:MM` strings.
    pub fn new(day_of_week: u8, start: &str, end: &str) -> AccessGuardResult<Self> {
        let window = Self {
            day_of_week,
            start: hhmm::parse(start)?,
            end: hhmm::parse(end)?,
        };
        window.validate()?;
        Ok(window)
    }

    /// Reject out-of-range days and inverted ranges.
    pub fn validate(&self) -> AccessGuardResult<()> {
        if self.day_of_week > 6 {
            return Err(AccessGuardError::InvalidTimeWindow {
                reason: format!("day_of_week {} is outside 0-6", self.day_of_week),
            });
        }
        if self.start > self.end {
            return Err(AccessGuardError::InvalidTimeWindow {
                reason: format!(
                    "start {} is after end {}",
                    self.start.format(hhmm::FORMAT),
                    self.end.format(hhmm::FORMAT)
                ),
            });
        }
        Ok(())
    }

    /// Whether `day`/`time` falls inside the window, compared at minute precision.
    pub fn contains(&self, day_of_week: u8, time: NaiveTime) -> bool {
        if day_of_week != self.day_of_week || self.start > self.end {
            return false;
        }
        let minute = time.hour() * 60 + time.minute();
        let start = self.start.hour() * 60 + self.start.minute();
        let end = self.end.hour() * 60 + self.end.minute();
        (start..=end).contains(&minute)
    }
}

/// Per-resource access policy. Immutable once handed to the validator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ZeroTrustPolicy {
    /// Require a verified second factor
    pub require_mfa: bool,
    /// Require a trusted device when one is presented
    pub require_device_trust: bool,
    /// Allowed country codes; empty means unrestricted
    pub allowed_locations: BTreeSet<String>,
    /// Allowed windows; empty means unrestricted
    pub allowed_time_windows: Vec<TimeWindow>,
    /// Carried for callers; not evaluated by the core
    pub require_just_in_time_access: bool,
    /// Live sessions allowed per user
    pub max_concurrent_sessions: usize,
    /// Idle time after which a session no longer counts
    pub session_timeout_minutes: i64,
}

impl Default for ZeroTrustPolicy {
    fn default() -> Self {
        Self {
            require_mfa: false,
            require_device_trust: false,
            allowed_locations: BTreeSet::new(),
            allowed_time_windows: vec![],
            require_just_in_time_access: false,
            max_concurrent_sessions: 3,
            session_timeout_minutes: 30,
        }
    }
}

impl ZeroTrustPolicy {
    /// Sanity checks that must hold before any step is evaluated.
    pub fn validate(&self) -> AccessGuardResult<()> {
        if self.max_concurrent_sessions < 1 {
            return Err(AccessGuardError::InvalidPolicy {
                reason: "max_concurrent_sessions must be at least 1".to_string(),
            });
        }
        if self.session_timeout_minutes <= 0 {
            return Err(AccessGuardError::InvalidPolicy {
                reason: "session_timeout_minutes must be positive".to_string(),
            });
        }
        if Duration::try_minutes(self.session_timeout_minutes).is_none() {
            return Err(AccessGuardError::InvalidPolicy {
                reason: format!(
                    "session_timeout_minutes {} is out of range",
                    self.session_timeout_minutes
                ),
            });
        }
        for window in &self.allowed_time_windows {
            window.validate()?;
        }
        Ok(())
    }

    /// Whether `country` is permitted. An empty allow-list permits everything.
    pub fn allows_country(&self, country: &str) -> bool {
        self.allowed_locations.is_empty()
            || self
                .allowed_locations
                .iter()
                .any(|allowed| allowed.eq_ignore_ascii_case(country.trim()))
    }
}

/// Pipeline stages, in evaluation order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyStep {
    /// Policy and request consistency
    PolicySanity,
    /// Device trust
    DeviceTrust,
    /// Country allow-list
    Location,
    /// Weekly time windows
    TimeWindow,
    /// Behavioral risk
    Behavior,
    /// Concurrent session cap
    Session,
    /// Second factor
    Mfa,
}

/// Result of one evaluated stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepOutcome {
    /// Stage evaluated
    pub step: PolicyStep,
    /// Whether it passed
    pub passed: bool,
    /// Human-readable outcome
    pub detail: String,
}

/// Allow/deny verdict
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    /// Correlates with the audit event
    pub decision_id: Uuid,
    /// Whether access is granted
    pub allow: bool,
    /// Why access was denied
    pub reason: Option<DenialCode>,
    /// Stages evaluated before the verdict, in order
    pub steps: Vec<StepOutcome>,
}

impl Decision {
    pub(crate) fn allow(steps: Vec<StepOutcome>) -> Self {
        Self {
            decision_id: Uuid::new_v4(),
            allow: true,
            reason: None,
            steps,
        }
    }

    pub(crate) fn deny(reason: DenialCode, steps: Vec<StepOutcome>) -> Self {
        Self {
            decision_id: Uuid::new_v4(),
            allow: false,
            reason: Some(reason),
            steps,
        }
    }

    /// Denial reason, if denied.
    pub fn denial(&self) -> Option<DenialCode> {
        self.reason
    }
}

mod hhmm {
    use crate::error::{AccessGuardError, AccessGuardResult};
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub const FORMAT: &str = "%H:%M";

    pub fn parse(value: &str) -> AccessGuardResult<NaiveTime> {
        NaiveTime::parse_from_str(value.trim(), FORMAT).map_err(|e| {
            AccessGuardError::InvalidTimeWindow {
                reason: format!("{value:?} is not HH:MM: {e}"),
            }
        })
    }

    pub fn serialize<S: Serializer>(time: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&time.format(FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).map_err(serde::de::Error::custom)
    }
}
