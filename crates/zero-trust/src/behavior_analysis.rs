//! Behavioral risk scoring against a user's baseline
//!
//! A live request is compared with the user's [`BehavioralProfile`] along three axes:
//! - Location familiarity
//! - Client (user-agent) familiarity
//! - Action rate against the learned hourly baseline
//!
//! Each anomaly contributes one signal and the signal count maps to a [`RiskLevel`].
//! Scoring never fails: a profile that cannot be read scores `Critical`.

use crate::error::{AccessGuardError, AccessGuardResult};
use crate::policy::Location;
use crate::trust_store::BehavioralProfile;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Behavior analysis configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BehaviorConfig {
    /// Trailing-hour rate above `baseline * rate_multiplier` is anomalous
    pub rate_multiplier: f64,
    /// Rates at or below this many actions per hour are never anomalous
    pub min_rate_floor: f64,
}

impl Default for BehaviorConfig {
    fn default() -> Self {
        Self {
            rate_multiplier: 3.0,
            min_rate_floor: 20.0,
        }
    }
}

impl BehaviorConfig {
    /// Reject a multiplier below 1.0 or a negative floor.
    pub fn validate(&self) -> AccessGuardResult<()> {
        if !self.rate_multiplier.is_finite() || self.rate_multiplier < 1.0 {
            return Err(AccessGuardError::ConfigurationError {
                message: "behavior.rate_multiplier must be at least 1.0".to_string(),
            });
        }
        if !self.min_rate_floor.is_finite() || self.min_rate_floor < 0.0 {
            return Err(AccessGuardError::ConfigurationError {
                message: "behavior.min_rate_floor must be non-negative".to_string(),
            });
        }
        Ok(())
    }
}

/// Live activity being scored
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Activity {
    /// Source IP
    pub ip: String,
    /// Client signature
    pub user_agent: String,
    /// When the activity happened
    pub timestamp: DateTime<Utc>,
    /// Resolved location, if any
    pub location: Option<Location>,
    /// Resource touched, recorded into access patterns
    pub resource: Option<String>,
    /// Action performed on `resource`
    pub action: Option<String>,
}

/// Risk classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    /// No anomaly
    Low,
    /// One anomaly; allowed
    Medium,
    /// Two anomalies; blocks
    High,
    /// Three or more anomalies, or no usable profile
    Critical,
}

impl RiskLevel {
    fn from_signal_count(count: usize) -> Self {
        match count {
            0 => Self::Low,
            1 => Self::Medium,
            2 => Self::High,
            _ => Self::Critical,
        }
    }

    /// `High` and `Critical` block access.
    pub fn is_blocking(self) -> bool {
        self >= Self::High
    }
}

/// Individual anomaly found while scoring
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RiskSignal {
    /// Country not in the user's known set
    UnfamiliarLocation { country: String },
    /// Client signature matched no known fragment
    UnfamiliarUserAgent { user_agent: String },
    /// Trailing-hour rate above the allowed bound
    RateAnomaly { observed: usize, allowed: f64 },
    /// Profile could not be read
    ProfileUnreadable { reason: String },
}

/// Scoring outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    /// Level derived from the signal count
    pub level: RiskLevel,
    /// Anomalies found, in check order
    pub signals: Vec<RiskSignal>,
}

/// Behavioral analyzer
#[derive(Debug, Clone, Default)]
pub struct BehavioralAnalyzer {
    config: BehaviorConfig,
}

impl BehavioralAnalyzer {
    /// Create new analyzer
    pub fn new(config: BehaviorConfig) -> Self {
        Self { config }
    }

    /// Risk level of `activity` against `profile`.
    pub fn score(&self, profile: &BehavioralProfile, activity: &Activity) -> RiskLevel {
        self.assess(profile, activity).level
    }

    /// Score a profile lookup; a failed lookup is `Critical`.
    pub fn assess_lookup(
        &self,
        profile: AccessGuardResult<BehavioralProfile>,
        activity: &Activity,
    ) -> RiskAssessment {
        match profile {
            Ok(profile) => self.assess(&profile, activity),
            Err(e) => Self::unreadable(e.to_string()),
        }
    }

    /// Risk level plus the signals behind it.
    pub fn assess(&self, profile: &BehavioralProfile, activity: &Activity) -> RiskAssessment {
        if let Err(e) = profile.check_integrity() {
            return Self::unreadable(e.to_string());
        }

        let mut signals = vec![];

        if let Some(location) = &activity.location {
            let country = location.country.trim();
            if !country.is_empty() && !profile.common_locations.contains(country) {
                signals.push(RiskSignal::UnfamiliarLocation {
                    country: country.to_ascii_uppercase(),
                });
            }
        }

        if !profile.typical_user_agents.any_within(&activity.user_agent) {
            signals.push(RiskSignal::UnfamiliarUserAgent {
                user_agent: activity.user_agent.clone(),
            });
        }

        // The activity being scored has not been recorded yet.
        let observed = profile.actions_in_trailing_hour(activity.timestamp) + 1;
        let allowed = (profile.average_actions_per_hour * self.config.rate_multiplier)
            .max(self.config.min_rate_floor);
        if observed as f64 > allowed {
            signals.push(RiskSignal::RateAnomaly { observed, allowed });
        }

        RiskAssessment {
            level: RiskLevel::from_signal_count(signals.len()),
            signals,
        }
    }

    fn unreadable(reason: String) -> RiskAssessment {
        tracing::warn!(%reason, "behavioral profile unreadable, scoring critical");
        RiskAssessment {
            level: RiskLevel::Critical,
            signals: vec![RiskSignal::ProfileUnreadable { reason }],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trust_store::TrustConfig;
    use chrono::Duration;

    fn profile() -> BehavioralProfile {
        BehavioralProfile::seeded("alice", &TrustConfig::default(), Utc::now())
    }

    fn activity(agent: &str, country: Option<&str>) -> Activity {
        Activity {
            ip: "203.0.113.7".to_string(),
            user_agent: agent.to_string(),
            timestamp: Utc::now(),
            location: country.map(Location::country),
            resource: None,
            action: None,
        }
    }

    fn busy(mut profile: BehavioralProfile, actions: usize) -> BehavioralProfile {
        let now = Utc::now();
        for i in 0..actions {
            profile
                .recent_actions
                .push_back(now - Duration::seconds(i as i64 + 1));
        }
        profile
    }

    const BROWSER: &str = "Mozilla/5.0 (Windows NT 10.0) Chrome/120.0";

    #[test]
    fn test_familiar_activity_is_low() {
        let analyzer = BehavioralAnalyzer::default();
        assert_eq!(
            analyzer.score(&profile(), &activity(BROWSER, Some("ID"))),
            RiskLevel::Low
        );
    }

    #[test]
    fn test_missing_location_is_not_anomalous() {
        let analyzer = BehavioralAnalyzer::default();
        let assessment = analyzer.assess(&profile(), &activity(BROWSER, None));
        assert_eq!(assessment.level, RiskLevel::Low);
        assert!(assessment.signals.is_empty());
    }

    #[test]
    fn test_single_anomaly_is_at_most_medium() {
        let analyzer = BehavioralAnalyzer::default();
        assert_eq!(
            analyzer.score(&profile(), &activity(BROWSER, Some("BR"))),
            RiskLevel::Medium
        );
        assert_eq!(
            analyzer.score(&profile(), &activity("python-requests/2.31", Some("SG"))),
            RiskLevel::Medium
        );
        assert_eq!(
            analyzer.score(&busy(profile(), 40), &activity(BROWSER, Some("MY"))),
            RiskLevel::Medium
        );
    }

    #[test]
    fn test_multiple_anomalies_escalate() {
        let analyzer = BehavioralAnalyzer::default();
        assert_eq!(
            analyzer.score(&profile(), &activity("sqlmap/1.7", Some("RU"))),
            RiskLevel::High
        );
        let assessment = analyzer.assess(&busy(profile(), 40), &activity("sqlmap/1.7", Some("RU")));
        assert_eq!(assessment.level, RiskLevel::Critical);
        assert_eq!(assessment.signals.len(), 3);
    }

    #[test]
    fn test_rate_bound_uses_floor_and_multiplier() {
        let analyzer = BehavioralAnalyzer::default();
        // Baseline 10/h * 3 = 30 allowed; 29 recorded + this one stays within.
        assert_eq!(
            analyzer.score(&busy(profile(), 29), &activity(BROWSER, None)),
            RiskLevel::Low
        );
        assert_eq!(
            analyzer.score(&busy(profile(), 30), &activity(BROWSER, None)),
            RiskLevel::Medium
        );

        let mut quiet = profile();
        quiet.average_actions_per_hour = 1.0;
        // Floor of 20 applies when the baseline is tiny.
        assert_eq!(
            analyzer.score(&busy(quiet, 15), &activity(BROWSER, None)),
            RiskLevel::Low
        );
    }

    #[test]
    fn test_unreadable_profile_is_critical() {
        let analyzer = BehavioralAnalyzer::default();
        let failed = Err(AccessGuardError::StoreFailure {
            store: "behavioral_profiles".to_string(),
            reason: "backend offline".to_string(),
        });
        let assessment = analyzer.assess_lookup(failed, &activity(BROWSER, None));
        assert_eq!(assessment.level, RiskLevel::Critical);

        let mut corrupted = profile();
        corrupted.average_actions_per_hour = f64::INFINITY;
        assert_eq!(
            analyzer.score(&corrupted, &activity(BROWSER, None)),
            RiskLevel::Critical
        );
    }

    #[test]
    fn test_blocking_levels() {
        assert!(!RiskLevel::Low.is_blocking());
        assert!(!RiskLevel::Medium.is_blocking());
        assert!(RiskLevel::High.is_blocking());
        assert!(RiskLevel::Critical.is_blocking());
    }
}
