//! Device trust records and per-user behavioral baselines
//!
//! Devices are trusted only through an explicit [`TrustStore::register_device_trust`]
//! call. Behavioral profiles are created lazily on first sighting of a user and grow
//! incrementally, with every learned set bounded so one user cannot pin unbounded
//! memory.

use crate::behavior_analysis::{Activity, BehavioralAnalyzer, RiskAssessment};
use crate::clock::Clock;
use crate::error::{AccessGuardError, AccessGuardResult};
use crate::store::{mutate, InMemoryStore, StateStore};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;

/// Minimum trust score for a device to count as trusted.
pub const MIN_TRUST_SCORE: u8 = 70;

/// Maximum age of a device verification.
pub const MAX_VERIFICATION_AGE_HOURS: i64 = 24;

/// Tolerated clock skew for verification timestamps in the future.
const VERIFICATION_SKEW_MINUTES: i64 = 5;

/// Trust store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustConfig {
    /// Baseline rate for a new profile
    pub seed_actions_per_hour: f64,
    /// Locations every new profile starts with
    pub seed_locations: Vec<String>,
    /// User-agent fragments every new profile starts with
    pub seed_user_agents: Vec<String>,
    /// Cap on learned locations per user
    pub max_common_locations: usize,
    /// Cap on learned user-agent fragments per user
    pub max_typical_user_agents: usize,
    /// Cap on retained activity timestamps per user
    pub max_recent_actions: usize,
    /// Cap on retained access patterns per user
    pub max_access_patterns: usize,
    /// Weight of the newest observation in the rate baseline (0.0 - 1.0)
    pub baseline_learning_rate: f64,
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            seed_actions_per_hour: 10.0,
            seed_locations: vec!["ID".to_string(), "SG".to_string(), "MY".to_string()],
            seed_user_agents: vec![
                "Mozilla".to_string(),
                "Chrome".to_string(),
                "Safari".to_string(),
                "Firefox".to_string(),
            ],
            max_common_locations: 16,
            max_typical_user_agents: 16,
            max_recent_actions: 1000,
            max_access_patterns: 50,
            baseline_learning_rate: 0.1,
        }
    }
}

impl TrustConfig {
    /// Reject settings that would make profiles meaningless.
    pub fn validate(&self) -> AccessGuardResult<()> {
        if !self.seed_actions_per_hour.is_finite() || self.seed_actions_per_hour <= 0.0 {
            return Err(AccessGuardError::ConfigurationError {
                message: "trust.seed_actions_per_hour must be positive".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.baseline_learning_rate) {
            return Err(AccessGuardError::ConfigurationError {
                message: "trust.baseline_learning_rate must be within 0.0-1.0".to_string(),
            });
        }
        if self.max_common_locations == 0
            || self.max_typical_user_agents == 0
            || self.max_recent_actions == 0
        {
            return Err(AccessGuardError::ConfigurationError {
                message: "trust profile caps must be non-zero".to_string(),
            });
        }
        Ok(())
    }
}

/// Device trust record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceTrustInfo {
    /// Device ID
    pub device_id: String,
    /// Explicitly marked trusted
    pub is_trusted: bool,
    /// Trust score (0 - 100)
    pub trust_score: u8,
    /// Last verification
    pub last_verified: DateTime<Utc>,
    /// Device class, e.g. `laptop`
    pub device_type: String,
    /// Operating system
    pub os: String,
    /// Browser
    pub browser: String,
}

impl DeviceTrustInfo {
    /// `is_trusted && trust_score >= 70 && now - last_verified <= 24h`
    pub fn is_currently_trusted(&self, now: DateTime<Utc>) -> bool {
        let age = now - self.last_verified;
        self.is_trusted
            && self.trust_score >= MIN_TRUST_SCORE
            && age <= Duration::hours(MAX_VERIFICATION_AGE_HOURS)
            && age >= -Duration::minutes(VERIFICATION_SKEW_MINUTES)
    }
}

/// Insertion-ordered set that evicts its least recently seen member when full.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundedSet {
    capacity: usize,
    items: VecDeque<String>,
}

impl BoundedSet {
    /// Empty set holding at most `capacity` items.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            items: VecDeque::new(),
        }
    }

    /// Set seeded from `items`, keeping the last `capacity` of them.
    pub fn seeded<I, S>(capacity: usize, items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut set = Self::new(capacity);
        for item in items {
            set.touch(item);
        }
        set
    }

    /// Insert or refresh `item`. Returns the evicted item, if any.
    pub fn touch(&mut self, item: impl Into<String>) -> Option<String> {
        let item = item.into();
        if let Some(pos) = self.position(&item) {
            if let Some(existing) = self.items.remove(pos) {
                self.items.push_back(existing);
            }
            return None;
        }
        self.items.push_back(item);
        if self.items.len() > self.capacity {
            self.items.pop_front()
        } else {
            None
        }
    }

    /// Case-insensitive membership.
    pub fn contains(&self, item: &str) -> bool {
        self.position(item).is_some()
    }

    /// Whether any member is a case-insensitive substring of `haystack`.
    pub fn any_within(&self, haystack: &str) -> bool {
        let haystack = haystack.to_ascii_lowercase();
        self.items
            .iter()
            .any(|item| !item.is_empty() && haystack.contains(&item.to_ascii_lowercase()))
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Maximum number of members.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Members, least recently seen first.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.items.iter().map(String::as_str)
    }

    fn position(&self, item: &str) -> Option<usize> {
        self.items.iter().position(|i| i.eq_ignore_ascii_case(item))
    }
}

/// One observed (resource, action) pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessPattern {
    /// Resource touched
    pub resource: String,
    /// Action performed
    pub action: String,
    /// When it happened
    pub timestamp: DateTime<Utc>,
}

/// Behavioral baseline for a user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BehavioralProfile {
    /// User ID
    pub user_id: String,
    /// Baseline rate
    pub average_actions_per_hour: f64,
    /// Known country codes
    pub common_locations: BoundedSet,
    /// Known user-agent fragments
    pub typical_user_agents: BoundedSet,
    /// Recent (resource, action) pairs; not used for scoring
    pub access_patterns: VecDeque<AccessPattern>,
    /// Timestamps of recent activity, newest last
    pub recent_actions: VecDeque<DateTime<Utc>>,
    /// Last update time
    pub last_updated: DateTime<Utc>,
}

impl BehavioralProfile {
    /// Fresh profile with the configured seeds.
    pub fn seeded(user_id: &str, config: &TrustConfig, now: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.to_string(),
            average_actions_per_hour: config.seed_actions_per_hour,
            common_locations: BoundedSet::seeded(
                config.max_common_locations,
                config.seed_locations.iter().map(|c| c.to_ascii_uppercase()),
            ),
            typical_user_agents: BoundedSet::seeded(
                config.max_typical_user_agents,
                config.seed_user_agents.iter().cloned(),
            ),
            access_patterns: VecDeque::new(),
            recent_actions: VecDeque::new(),
            last_updated: now,
        }
    }

    /// Number of recorded actions in the hour ending at `at`.
    pub fn actions_in_trailing_hour(&self, at: DateTime<Utc>) -> usize {
        let since = at - Duration::hours(1);
        self.recent_actions
            .iter()
            .rev()
            .take_while(|t| **t > since)
            .filter(|t| **t <= at)
            .count()
    }

    /// Checks that scoring can trust the numbers in this profile.
    pub fn check_integrity(&self) -> AccessGuardResult<()> {
        if !self.average_actions_per_hour.is_finite() || self.average_actions_per_hour < 0.0 {
            return Err(AccessGuardError::ProfileUnreadable {
                user_id: self.user_id.clone(),
                reason: format!(
                    "average_actions_per_hour is {}",
                    self.average_actions_per_hour
                ),
            });
        }
        Ok(())
    }

    /// Fold one observed activity into the baseline.
    pub fn observe(&mut self, activity: &Activity, config: &TrustConfig) {
        self.recent_actions.push_back(activity.timestamp);
        while self.recent_actions.len() > config.max_recent_actions {
            self.recent_actions.pop_front();
        }

        let trailing = self.actions_in_trailing_hour(activity.timestamp) as f64;
        self.average_actions_per_hour +=
            config.baseline_learning_rate * (trailing - self.average_actions_per_hour);

        if let Some(location) = &activity.location {
            let country = location.country.trim().to_ascii_uppercase();
            if !country.is_empty() {
                self.common_locations.touch(country);
            }
        }

        if let Some(fragment) = user_agent_product(&activity.user_agent) {
            if !self.typical_user_agents.any_within(&activity.user_agent) {
                self.typical_user_agents.touch(fragment);
            }
        }

        if let (Some(resource), Some(action)) = (&activity.resource, &activity.action) {
            self.access_patterns.push_back(AccessPattern {
                resource: resource.clone(),
                action: action.clone(),
                timestamp: activity.timestamp,
            });
            while self.access_patterns.len() > config.max_access_patterns {
                self.access_patterns.pop_front();
            }
        }

        self.last_updated = activity.timestamp;
    }
}

/// Leading product token of a user agent (`curl/8.4.0` -> `curl`).
fn user_agent_product(user_agent: &str) -> Option<String> {
    let token = user_agent
        .trim()
        .split(|c: char| c == '/' || c.is_whitespace())
        .next()?
        .trim();
    if token.is_empty() {
        None
    } else {
        Some(token.chars().take(64).collect())
    }
}

/// Device trust and behavioral profile store
pub struct TrustStore {
    config: TrustConfig,
    devices: Arc<dyn StateStore<DeviceTrustInfo>>,
    profiles: Arc<dyn StateStore<BehavioralProfile>>,
    clock: Arc<dyn Clock>,
}

impl TrustStore {
    /// Create a store backed by process-local maps.
    pub fn new(config: TrustConfig, clock: Arc<dyn Clock>) -> Self {
        Self::with_stores(
            config,
            InMemoryStore::shared("device_trust"),
            InMemoryStore::shared("behavioral_profiles"),
            clock,
        )
    }

    /// Create a store over injected backends.
    pub fn with_stores(
        config: TrustConfig,
        devices: Arc<dyn StateStore<DeviceTrustInfo>>,
        profiles: Arc<dyn StateStore<BehavioralProfile>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            devices,
            profiles,
            clock,
        }
    }

    /// Length-prefixed so no pair of IDs can collide, whatever characters they hold.
    fn device_key(user_id: &str, device_id: &str) -> String {
        format!("{}:{user_id}:{device_id}", user_id.len())
    }

    /// Record or replace the trust record for one of `user_id`'s devices.
    pub fn register_device_trust(
        &self,
        user_id: &str,
        device: DeviceTrustInfo,
    ) -> AccessGuardResult<DeviceTrustInfo> {
        if device.device_id.trim().is_empty() {
            return Err(AccessGuardError::InvalidInput {
                field: "device_id".to_string(),
                reason: "must not be empty".to_string(),
            });
        }
        if device.trust_score > 100 {
            return Err(AccessGuardError::InvalidInput {
                field: "trust_score".to_string(),
                reason: format!("{} is outside 0-100", device.trust_score),
            });
        }

        self.devices
            .put(&Self::device_key(user_id, &device.device_id), device.clone())?;

        tracing::info!(
            user_id,
            device_id = %device.device_id,
            trusted = device.is_trusted,
            trust_score = device.trust_score,
            "device trust registered"
        );
        Ok(device)
    }

    /// Trust record for a device, if one was registered.
    pub fn device_trust(
        &self,
        user_id: &str,
        device_id: &str,
    ) -> AccessGuardResult<Option<DeviceTrustInfo>> {
        self.devices.get(&Self::device_key(user_id, device_id))
    }

    /// Whether the device is trusted right now. Unknown devices are not.
    pub fn is_device_trusted(&self, user_id: &str, device_id: &str) -> AccessGuardResult<bool> {
        let now = self.clock.now();
        Ok(self
            .device_trust(user_id, device_id)?
            .map(|device| device.is_currently_trusted(now))
            .unwrap_or(false))
    }

    /// Forget a device.
    pub fn revoke_device(&self, user_id: &str, device_id: &str) -> AccessGuardResult<bool> {
        let removed = self
            .devices
            .remove(&Self::device_key(user_id, device_id))?
            .is_some();
        if removed {
            tracing::info!(user_id, device_id, "device trust revoked");
        }
        Ok(removed)
    }

    /// The user's profile, created with seed values on first sighting.
    pub fn profile(&self, user_id: &str) -> AccessGuardResult<BehavioralProfile> {
        let now = self.clock.now();
        let config = &self.config;
        let profile = self.profiles.update(
            user_id,
            &|| BehavioralProfile::seeded(user_id, config, now),
            &mut |_| {},
        )?;
        profile.check_integrity()?;
        Ok(profile)
    }

    /// Fold an observed activity into the user's profile.
    pub fn observe_activity(
        &self,
        user_id: &str,
        activity: &Activity,
    ) -> AccessGuardResult<BehavioralProfile> {
        let now = self.clock.now();
        let config = &self.config;
        let profile = mutate(
            self.profiles.as_ref(),
            user_id,
            || BehavioralProfile::seeded(user_id, config, now),
            |profile| {
                profile.observe(activity, config);
                profile.clone()
            },
        )?;
        tracing::debug!(
            user_id,
            average_actions_per_hour = profile.average_actions_per_hour,
            locations = profile.common_locations.len(),
            user_agents = profile.typical_user_agents.len(),
            "behavioral profile updated"
        );
        Ok(profile)
    }

    /// Score `activity` against the user's profile and fold it in unless the score
    /// blocks, as one update under the profile's key lock.
    pub fn assess_and_observe(
        &self,
        user_id: &str,
        activity: &Activity,
        analyzer: &BehavioralAnalyzer,
    ) -> AccessGuardResult<RiskAssessment> {
        let now = self.clock.now();
        let config = &self.config;
        let assessment = mutate(
            self.profiles.as_ref(),
            user_id,
            || BehavioralProfile::seeded(user_id, config, now),
            |profile| {
                let assessment = analyzer.assess(profile, activity);
                if !assessment.level.is_blocking() {
                    profile.observe(activity, config);
                }
                assessment
            },
        )?;
        tracing::debug!(
            user_id,
            level = ?assessment.level,
            signals = assessment.signals.len(),
            learned = !assessment.level.is_blocking(),
            "activity assessed"
        );
        Ok(assessment)
    }

    /// Configuration in use.
    pub fn config(&self) -> &TrustConfig {
        &self.config
    }
}
