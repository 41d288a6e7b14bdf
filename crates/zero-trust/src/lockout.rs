//! Adaptive brute-force protection for login
//!
//! Failed attempts per identity walk through four levels:
//! - Normal: below `warning_threshold`
//! - Warning: still allowed, remaining attempts surfaced
//! - Throttled: from `delay_threshold_attempts`, each attempt waits
//!   `min(max_delay, base_delay * 2^(failed - delay_threshold))` seconds
//! - Locked: from `max_login_attempts`, denied until `locked_until`
//!
//! Only a successful attempt resets the failure count; an expired lock or an admin
//! reset clears the lock and nothing else.
//!
//! Callers that run the credential check themselves go through [`LockoutGuard::admit`]:
//! the slot is reserved in the same atomic update that evaluates the status, so a
//! concurrent burst cannot run more checks than the thresholds allow.

use crate::audit::{AuditEvent, AuditOutcome, AuditSink};
use crate::clock::Clock;
use crate::error::{AccessGuardError, AccessGuardResult, DenialCode};
use crate::store::{mutate, InMemoryStore, StateStore};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;

/// Lockout configuration.
///
/// The defaults (10 attempts, 30 minute lock) are canonical; deployments that want
/// the stricter 5 attempts / 15 minutes profile set it here explicitly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockoutConfig {
    /// Failures that lock the account
    pub max_login_attempts: u32,
    /// Lock duration
    pub lockout_duration_minutes: i64,
    /// Failures that start surfacing warnings
    pub warning_threshold: u32,
    /// Failures that start exponential backoff
    pub delay_threshold_attempts: u32,
    /// First backoff step
    pub base_delay_seconds: u64,
    /// Backoff cap
    pub max_delay_seconds: u64,
    /// Attempts retained per identity
    pub attempt_history_size: usize,
}

impl Default for LockoutConfig {
    fn default() -> Self {
        Self {
            max_login_attempts: 10,
            lockout_duration_minutes: 30,
            warning_threshold: 3,
            delay_threshold_attempts: 5,
            base_delay_seconds: 2,
            max_delay_seconds: 60,
            attempt_history_size: 10,
        }
    }
}

impl LockoutConfig {
    /// Thresholds must be ordered warning <= delay <= lockout.
    pub fn validate(&self) -> AccessGuardResult<()> {
        let fail = |message: &str| {
            Err(AccessGuardError::ConfigurationError {
                message: format!("lockout: {message}"),
            })
        };
        if self.max_login_attempts == 0 {
            return fail("max_login_attempts must be at least 1");
        }
        if self.warning_threshold > self.delay_threshold_attempts
            || self.delay_threshold_attempts > self.max_login_attempts
        {
            return fail("thresholds must satisfy warning <= delay <= max_login_attempts");
        }
        if self.lockout_duration_minutes <= 0 || self.lockout_duration().is_none() {
            return fail("lockout_duration_minutes must be positive and representable");
        }
        if self.base_delay_seconds == 0 || self.max_delay_seconds < self.base_delay_seconds {
            return fail("delays must satisfy 0 < base_delay_seconds <= max_delay_seconds");
        }
        if i64::try_from(self.max_delay_seconds)
            .ok()
            .and_then(Duration::try_seconds)
            .is_none()
        {
            return fail("max_delay_seconds is out of range");
        }
        if self.attempt_history_size == 0 {
            return fail("attempt_history_size must be at least 1");
        }
        Ok(())
    }

    /// Lock duration, `None` when it does not fit a `Duration`.
    pub fn lockout_duration(&self) -> Option<Duration> {
        Duration::try_minutes(self.lockout_duration_minutes)
    }

    /// Backoff owed after `failed_attempts` failures, if any.
    pub fn backoff_delay(&self, failed_attempts: u32) -> Option<Duration> {
        if failed_attempts < self.delay_threshold_attempts {
            return None;
        }
        let exponent = failed_attempts - self.delay_threshold_attempts;
        let factor = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
        let seconds = self
            .base_delay_seconds
            .saturating_mul(factor)
            .min(self.max_delay_seconds);
        let seconds = i64::try_from(seconds).unwrap_or(i64::MAX);
        Duration::try_seconds(seconds).or(Some(Duration::MAX))
    }
}

/// Caller-supplied context for an attempt
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AttemptMeta {
    /// User the identity resolved to, when known
    pub user_id: Option<String>,
    /// Client IP
    pub ip_address: Option<String>,
    /// Why the attempt failed, e.g. `invalid_password`
    pub reason: Option<String>,
}

/// One recorded login attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoginAttempt {
    /// When the attempt was recorded
    pub timestamp: DateTime<Utc>,
    /// Whether the credential was accepted
    pub success: bool,
    /// User the identity resolved to
    pub user_id: Option<String>,
    /// Client IP
    pub ip_address: Option<String>,
    /// Failure reason
    pub reason: Option<String>,
}

/// Per-identity lockout record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountLockout {
    /// Normalized identity
    pub identity: String,
    /// Currently locked
    pub locked: bool,
    /// When the current lock started
    pub locked_at: Option<DateTime<Utc>>,
    /// When the current lock ends
    pub locked_until: Option<DateTime<Utc>>,
    /// Failures since the last success
    pub failed_attempts: u32,
    /// Last recorded attempt, success or failure
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Most recent attempts, oldest first
    pub recent_attempts: VecDeque<LoginAttempt>,
    /// Admitted credential checks whose outcome is not recorded yet
    #[serde(default)]
    pub in_flight: u32,
}

impl AccountLockout {
    fn new(identity: &str) -> Self {
        Self {
            identity: identity.to_string(),
            locked: false,
            locked_at: None,
            locked_until: None,
            failed_attempts: 0,
            last_attempt_at: None,
            recent_attempts: VecDeque::new(),
            in_flight: 0,
        }
    }

    fn clear_lock(&mut self) {
        self.locked = false;
        self.locked_at = None;
        self.locked_until = None;
    }

    /// Clear an expired lock. Returns whether it did.
    fn expire_lock(&mut self, now: DateTime<Utc>) -> bool {
        match self.locked_until {
            Some(until) if self.locked && now >= until => {
                self.clear_lock();
                true
            }
            _ => false,
        }
    }
}

/// Escalation level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockoutLevel {
    /// Below the warning threshold
    Normal,
    /// Remaining attempts surfaced
    Warning,
    /// Exponential backoff between attempts
    Throttled,
    /// Denied until the lock expires
    Locked,
}

/// What the caller may do next
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockoutStatus {
    /// Escalation level
    pub level: LockoutLevel,
    /// Whether a lock is in force
    pub locked: bool,
    /// End of the lock in force
    pub locked_until: Option<DateTime<Utc>>,
    /// Failures left before the account locks
    pub remaining_attempts: u32,
    /// Earliest time the next credential check may run, while a backoff is owed
    pub retry_after: Option<DateTime<Utc>>,
}

impl LockoutStatus {
    fn from_record(record: &AccountLockout, config: &LockoutConfig, now: DateTime<Utc>) -> Self {
        let failed = record.failed_attempts;
        let level = if record.locked {
            LockoutLevel::Locked
        } else if failed >= config.delay_threshold_attempts {
            LockoutLevel::Throttled
        } else if failed >= config.warning_threshold {
            LockoutLevel::Warning
        } else {
            LockoutLevel::Normal
        };

        let retry_after = if record.locked {
            record.locked_until
        } else {
            match (config.backoff_delay(failed), record.last_attempt_at) {
                (Some(delay), Some(last)) => last
                    .checked_add_signed(delay)
                    .or(Some(DateTime::<Utc>::MAX_UTC))
                    .filter(|until| now < *until),
                _ => None,
            }
        };

        Self {
            level,
            locked: record.locked,
            locked_until: record.locked_until,
            remaining_attempts: config.max_login_attempts.saturating_sub(failed),
            retry_after,
        }
    }

    /// Refusal while other checks for the identity would use up the next slot.
    fn contended(record: &AccountLockout, config: &LockoutConfig, now: DateTime<Utc>) -> Self {
        let pending = record.failed_attempts.saturating_add(record.in_flight);
        let wait = config
            .backoff_delay(pending)
            .unwrap_or_else(|| Duration::seconds(1));
        Self {
            level: LockoutLevel::Throttled,
            locked: false,
            locked_until: None,
            remaining_attempts: config.max_login_attempts.saturating_sub(record.failed_attempts),
            retry_after: now.checked_add_signed(wait).or(Some(now)),
        }
    }

    fn fresh(config: &LockoutConfig) -> Self {
        Self {
            level: LockoutLevel::Normal,
            locked: false,
            locked_until: None,
            remaining_attempts: config.max_login_attempts,
            retry_after: None,
        }
    }

    /// Whether the credential check may run now.
    pub fn is_allowed(&self) -> bool {
        self.denial().is_none()
    }

    /// Reason to refuse the attempt, if any.
    pub fn denial(&self) -> Option<DenialCode> {
        if self.locked {
            Some(DenialCode::AccountLocked)
        } else if self.retry_after.is_some() {
            Some(DenialCode::AccountThrottled)
        } else {
            None
        }
    }
}

enum LockTransition {
    Locked(DateTime<Utc>),
    Unlocked(&'static str),
}

/// Outcome of [`LockoutGuard::admit`]
pub enum Admission<'a> {
    /// The credential check may run; settle the permit with its outcome.
    Admitted(AttemptPermit<'a>),
    /// Refused before the credential check.
    Refused(LockoutStatus),
}

/// Reserved credential-check slot.
///
/// Dropping an unsettled permit releases the slot without counting an attempt.
pub struct AttemptPermit<'a> {
    guard: &'a LockoutGuard,
    key: String,
    status: LockoutStatus,
    settled: bool,
}

impl AttemptPermit<'_> {
    /// Status at admission time.
    pub fn status(&self) -> &LockoutStatus {
        &self.status
    }

    /// Record the check's outcome and release the slot.
    pub fn record(mut self, success: bool, meta: AttemptMeta) -> AccessGuardResult<LockoutStatus> {
        self.settled = true;
        self.guard.record_outcome(&self.key, success, meta, true)
    }
}

impl Drop for AttemptPermit<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if let Err(e) = self.guard.release(&self.key) {
            tracing::error!(identity = %self.key, error = %e, "failed to release login slot");
        }
    }
}

/// Login lockout guard
pub struct LockoutGuard {
    config: LockoutConfig,
    records: Arc<dyn StateStore<AccountLockout>>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
}

impl LockoutGuard {
    /// Create a guard backed by a process-local map.
    pub fn new(
        config: LockoutConfig,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
    ) -> AccessGuardResult<Self> {
        Self::with_store(config, InMemoryStore::shared("account_lockouts"), audit, clock)
    }

    /// Create a guard over an injected backend.
    pub fn with_store(
        config: LockoutConfig,
        records: Arc<dyn StateStore<AccountLockout>>,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
    ) -> AccessGuardResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            records,
            audit,
            clock,
        })
    }

    /// Identities are e-mail addresses; case and surrounding space do not matter.
    fn normalize(identity: &str) -> String {
        identity.trim().to_lowercase()
    }

    /// Current status. Clears an expired lock as a side effect.
    pub fn check_lockout(&self, identity: &str) -> AccessGuardResult<LockoutStatus> {
        let key = Self::normalize(identity);
        let now = self.clock.now();

        // Unknown identities get no record; only attempts create state.
        if self.records.get(&key)?.is_none() {
            return Ok(LockoutStatus::fresh(&self.config));
        }

        let config = &self.config;
        let (status, unlocked) = mutate(
            self.records.as_ref(),
            &key,
            || AccountLockout::new(&key),
            |record| {
                let unlocked = record.expire_lock(now);
                (LockoutStatus::from_record(record, config, now), unlocked)
            },
        )?;

        if unlocked {
            self.emit_transition(&key, LockTransition::Unlocked("expired"), now);
        }
        if let Some(denial) = status.denial() {
            tracing::info!(
                identity = %key,
                level = ?status.level,
                retry_after = ?status.retry_after,
                %denial,
                "login attempt gated"
            );
        }
        Ok(status)
    }

    /// Reserve a credential-check slot for `identity`.
    ///
    /// Refused while locked, while a backoff is owed, or once throttling has started
    /// and another check is still running. Below the throttle threshold several
    /// checks may run at once, but never enough to pass it unobserved.
    pub fn admit(&self, identity: &str) -> AccessGuardResult<Admission<'_>> {
        let key = Self::normalize(identity);
        let now = self.clock.now();
        let config = &self.config;

        let (status, admitted, unlocked) = mutate(
            self.records.as_ref(),
            &key,
            || AccountLockout::new(&key),
            |record| {
                let unlocked = record.expire_lock(now);
                let status = LockoutStatus::from_record(record, config, now);
                if !status.is_allowed() {
                    return (status, false, unlocked);
                }
                let pending = record.failed_attempts.saturating_add(record.in_flight);
                if record.in_flight > 0 && pending >= config.delay_threshold_attempts {
                    return (LockoutStatus::contended(record, config, now), false, unlocked);
                }
                record.in_flight = record.in_flight.saturating_add(1);
                (status, true, unlocked)
            },
        )?;

        if unlocked {
            self.emit_transition(&key, LockTransition::Unlocked("expired"), now);
        }
        if admitted {
            return Ok(Admission::Admitted(AttemptPermit {
                guard: self,
                key,
                status,
                settled: false,
            }));
        }
        tracing::info!(
            identity = %key,
            level = ?status.level,
            retry_after = ?status.retry_after,
            "login attempt gated"
        );
        Ok(Admission::Refused(status))
    }

    /// Record the outcome of a credential check run without [`admit`](Self::admit).
    pub fn record_attempt(
        &self,
        identity: &str,
        success: bool,
        meta: AttemptMeta,
    ) -> AccessGuardResult<LockoutStatus> {
        self.record_outcome(&Self::normalize(identity), success, meta, false)
    }

    fn release(&self, key: &str) -> AccessGuardResult<()> {
        mutate(
            self.records.as_ref(),
            key,
            || AccountLockout::new(key),
            |record| record.in_flight = record.in_flight.saturating_sub(1),
        )
    }

    fn record_outcome(
        &self,
        key: &str,
        success: bool,
        meta: AttemptMeta,
        admitted: bool,
    ) -> AccessGuardResult<LockoutStatus> {
        let now = self.clock.now();
        let config = &self.config;

        let (status, transition) = mutate(
            self.records.as_ref(),
            key,
            || AccountLockout::new(key),
            |record| {
                if admitted {
                    record.in_flight = record.in_flight.saturating_sub(1);
                }
                let expired = record.expire_lock(now);

                record.recent_attempts.push_back(LoginAttempt {
                    timestamp: now,
                    success,
                    user_id: meta.user_id.clone(),
                    ip_address: meta.ip_address.clone(),
                    reason: meta.reason.clone(),
                });
                while record.recent_attempts.len() > config.attempt_history_size {
                    record.recent_attempts.pop_front();
                }
                record.last_attempt_at = Some(now);

                let transition = if success {
                    let was_locked = record.locked;
                    record.failed_attempts = 0;
                    record.clear_lock();
                    if was_locked {
                        Some(LockTransition::Unlocked("success"))
                    } else if expired {
                        Some(LockTransition::Unlocked("expired"))
                    } else {
                        None
                    }
                } else {
                    record.failed_attempts = record.failed_attempts.saturating_add(1);
                    if !record.locked && record.failed_attempts >= config.max_login_attempts {
                        // validate() guarantees the duration fits; fall back to the
                        // latest representable instant rather than panic.
                        let until = config
                            .lockout_duration()
                            .and_then(|d| now.checked_add_signed(d))
                            .unwrap_or(DateTime::<Utc>::MAX_UTC);
                        record.locked = true;
                        record.locked_at = Some(now);
                        record.locked_until = Some(until);
                        Some(LockTransition::Locked(until))
                    } else if expired {
                        Some(LockTransition::Unlocked("expired"))
                    } else {
                        None
                    }
                };

                (LockoutStatus::from_record(record, config, now), transition)
            },
        )?;

        if success {
            tracing::info!(identity = %key, ip = ?meta.ip_address, "login succeeded, failures reset");
        } else {
            tracing::warn!(
                identity = %key,
                ip = ?meta.ip_address,
                reason = ?meta.reason,
                level = ?status.level,
                remaining_attempts = status.remaining_attempts,
                "login failed"
            );
        }
        if let Some(transition) = transition {
            self.emit_transition(key, transition, now);
        }
        Ok(status)
    }

    /// Administrative unlock. Clears the lock only; failures and history are kept,
    /// so the next failure past the threshold locks again.
    pub fn reset(&self, identity: &str) -> AccessGuardResult<bool> {
        let key = Self::normalize(identity);
        if self.records.get(&key)?.is_none() {
            return Ok(false);
        }
        let unlocked = mutate(
            self.records.as_ref(),
            &key,
            || AccountLockout::new(&key),
            |record| {
                let was_locked = record.locked;
                record.clear_lock();
                was_locked
            },
        )?;
        if unlocked {
            self.emit_transition(&key, LockTransition::Unlocked("admin_reset"), self.clock.now());
        }
        Ok(unlocked)
    }

    /// Full record for inspection.
    pub fn record(&self, identity: &str) -> AccessGuardResult<Option<AccountLockout>> {
        self.records.get(&Self::normalize(identity))
    }

    /// Configuration in use.
    pub fn config(&self) -> &LockoutConfig {
        &self.config
    }

    fn emit_transition(&self, identity: &str, transition: LockTransition, now: DateTime<Utc>) {
        let event = match transition {
            LockTransition::Locked(until) => {
                tracing::warn!(identity, locked_until = %until, "account locked");
                AuditEvent::new(now, identity, "lockout.locked", AuditOutcome::Transition)
                    .with_reason(DenialCode::AccountLocked.as_str())
                    .with_metadata(serde_json::json!({ "locked_until": until }))
            }
            LockTransition::Unlocked(why) => {
                tracing::info!(identity, reason = why, "account unlocked");
                AuditEvent::new(now, identity, "lockout.unlocked", AuditOutcome::Transition)
                    .with_reason(why)
            }
        };
        self.audit.emit(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::clock::ManualClock;

    struct Fixture {
        guard: LockoutGuard,
        clock: Arc<ManualClock>,
        audit: Arc<MemoryAuditSink>,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::default());
        let audit = Arc::new(MemoryAuditSink::default());
        let guard =
            LockoutGuard::new(LockoutConfig::default(), audit.clone(), clock.clone()).unwrap();
        Fixture {
            guard,
            clock,
            audit,
        }
    }

    fn fail(f: &Fixture, times: u32) -> LockoutStatus {
        let mut status = f.guard.check_lockout("pm@site.example").unwrap();
        for _ in 0..times {
            status = f
                .guard
                .record_attempt(
                    "pm@site.example",
                    false,
                    AttemptMeta {
                        reason: Some("invalid_password".to_string()),
                        ..AttemptMeta::default()
                    },
                )
                .unwrap();
        }
        status
    }

    #[test]
    fn test_backoff_table() {
        let config = LockoutConfig::default();
        let seconds = |n| config.backoff_delay(n).map(|d| d.num_seconds());
        assert_eq!(seconds(4), None);
        assert_eq!(seconds(5), Some(2));
        assert_eq!(seconds(6), Some(4));
        assert_eq!(seconds(7), Some(8));
        assert_eq!(seconds(8), Some(16));
        assert_eq!(seconds(9), Some(32));
        assert_eq!(seconds(10), Some(60));
        assert_eq!(seconds(11), Some(60));
        assert_eq!(seconds(200), Some(60));
    }

    #[test]
    fn test_unknown_identity_is_normal() {
        let f = fixture();
        let status = f.guard.check_lockout("nobody@site.example").unwrap();
        assert_eq!(status.level, LockoutLevel::Normal);
        assert_eq!(status.remaining_attempts, 10);
        assert!(status.is_allowed());
        assert!(f.guard.record("nobody@site.example").unwrap().is_none());
    }

    #[test]
    fn test_warning_level() {
        let f = fixture();
        let status = fail(&f, 3);
        assert_eq!(status.level, LockoutLevel::Warning);
        assert_eq!(status.remaining_attempts, 7);
        assert!(status.is_allowed());
    }

    #[test]
    fn test_throttle_requires_waiting() {
        let f = fixture();
        let status = fail(&f, 5);
        assert_eq!(status.level, LockoutLevel::Throttled);
        assert_eq!(status.denial(), Some(DenialCode::AccountThrottled));

        f.clock.advance(Duration::seconds(1));
        assert!(!f.guard.check_lockout("pm@site.example").unwrap().is_allowed());

        f.clock.advance(Duration::seconds(1));
        let status = f.guard.check_lockout("pm@site.example").unwrap();
        assert!(status.is_allowed());
        assert_eq!(status.level, LockoutLevel::Throttled);
    }

    #[test]
    fn test_lockout_and_expiry_keeps_failures() {
        let f = fixture();
        let status = fail(&f, 10);
        assert!(status.locked);
        assert_eq!(status.denial(), Some(DenialCode::AccountLocked));
        assert_eq!(f.audit.events_for("lockout.locked").len(), 1);

        f.clock.advance(Duration::minutes(29));
        assert!(f.guard.check_lockout("PM@site.example ").unwrap().locked);

        f.clock.advance(Duration::minutes(1));
        let status = f.guard.check_lockout("pm@site.example").unwrap();
        assert!(!status.locked);
        assert_eq!(status.locked_until, None);
        let record = f.guard.record("pm@site.example").unwrap().unwrap();
        assert_eq!(record.failed_attempts, 10);
        assert_eq!(f.audit.events_for("lockout.unlocked").len(), 1);

        // One more failure relocks immediately.
        let status = fail(&f, 1);
        assert!(status.locked);
    }

    #[test]
    fn test_failures_monotonic_until_success() {
        let f = fixture();
        let mut previous = 0;
        for _ in 0..12 {
            fail(&f, 1);
            let failed = f.guard.record("pm@site.example").unwrap().unwrap().failed_attempts;
            assert!(failed >= previous);
            previous = failed;
        }
        assert_eq!(previous, 12);

        let status = f
            .guard
            .record_attempt("pm@site.example", true, AttemptMeta::default())
            .unwrap();
        assert!(!status.locked);
        assert_eq!(status.level, LockoutLevel::Normal);
        let record = f.guard.record("pm@site.example").unwrap().unwrap();
        assert_eq!(record.failed_attempts, 0);
        assert_eq!(
            f.audit.events_for("lockout.unlocked")[0].reason.as_deref(),
            Some("success")
        );
    }

    #[test]
    fn test_attempt_history_is_bounded() {
        let f = fixture();
        fail(&f, 15);
        let record = f.guard.record("pm@site.example").unwrap().unwrap();
        assert_eq!(record.recent_attempts.len(), 10);
        assert!(record.recent_attempts.iter().all(|a| !a.success));
    }

    #[test]
    fn test_admin_reset_clears_lock_only() {
        let f = fixture();
        fail(&f, 10);
        assert!(f.guard.reset("pm@site.example").unwrap());
        assert!(!f.guard.check_lockout("pm@site.example").unwrap().locked);
        assert!(!f.guard.reset("pm@site.example").unwrap());

        let record = f.guard.record("pm@site.example").unwrap().unwrap();
        assert_eq!(record.failed_attempts, 10);
        assert_eq!(record.recent_attempts.len(), 10);
        let unlocked = f.audit.events_for("lockout.unlocked");
        assert_eq!(unlocked.len(), 1);
        assert_eq!(unlocked[0].reason.as_deref(), Some("admin_reset"));

        // The next failure is still past the threshold.
        f.clock.advance(Duration::seconds(60));
        assert!(fail(&f, 1).locked);
    }

    #[test]
    fn test_reset_keeps_failure_count() {
        let f = fixture();
        fail(&f, 7);
        f.guard.reset("pm@site.example").unwrap();
        fail(&f, 1);
        let record = f.guard.record("pm@site.example").unwrap().unwrap();
        assert_eq!(record.failed_attempts, 8);
    }

    fn admitted(admission: Admission<'_>) -> AttemptPermit<'_> {
        match admission {
            Admission::Admitted(permit) => permit,
            Admission::Refused(status) => panic!("refused: {status:?}"),
        }
    }

    #[test]
    fn test_admit_caps_checks_below_throttle() {
        let f = fixture();
        let permits: Vec<_> = (0..5)
            .map(|_| admitted(f.guard.admit("pm@site.example").unwrap()))
            .collect();

        match f.guard.admit("pm@site.example").unwrap() {
            Admission::Refused(status) => {
                assert_eq!(status.denial(), Some(DenialCode::AccountThrottled));
                assert!(status.retry_after.is_some());
            }
            Admission::Admitted(_) => panic!("sixth concurrent check admitted"),
        }

        // Unsettled permits release their slot without counting.
        drop(permits);
        let record = f.guard.record("pm@site.example").unwrap().unwrap();
        assert_eq!(record.in_flight, 0);
        assert_eq!(record.failed_attempts, 0);
        assert!(matches!(
            f.guard.admit("pm@site.example").unwrap(),
            Admission::Admitted(_)
        ));
    }

    #[test]
    fn test_admit_one_check_per_backoff_slot() {
        let f = fixture();
        fail(&f, 5);
        assert!(matches!(
            f.guard.admit("pm@site.example").unwrap(),
            Admission::Refused(_)
        ));

        f.clock.advance(Duration::seconds(2));
        let permit = admitted(f.guard.admit("pm@site.example").unwrap());
        assert!(matches!(
            f.guard.admit("pm@site.example").unwrap(),
            Admission::Refused(_)
        ));

        let status = permit.record(false, AttemptMeta::default()).unwrap();
        assert_eq!(status.denial(), Some(DenialCode::AccountThrottled));
        let record = f.guard.record("pm@site.example").unwrap().unwrap();
        assert_eq!(record.failed_attempts, 6);
        assert_eq!(record.in_flight, 0);
    }

    #[test]
    fn test_parallel_admissions_respect_thresholds() {
        let f = fixture();
        let checks = std::sync::atomic::AtomicUsize::new(0);
        std::thread::scope(|scope| {
            for _ in 0..24 {
                scope.spawn(|| {
                    if let Admission::Admitted(permit) = f.guard.admit("pm@site.example").unwrap() {
                        checks.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                        std::thread::sleep(std::time::Duration::from_millis(20));
                        permit.record(false, AttemptMeta::default()).unwrap();
                    }
                });
            }
        });

        let record = f.guard.record("pm@site.example").unwrap().unwrap();
        let checks = checks.load(std::sync::atomic::Ordering::SeqCst) as u32;
        assert!(checks <= 5, "{checks} checks ran");
        assert_eq!(record.failed_attempts, checks);
        assert!(!record.locked);
    }

    #[test]
    fn test_config_validation() {
        let config = LockoutConfig {
            warning_threshold: 6,
            delay_threshold_attempts: 5,
            ..LockoutConfig::default()
        };
        assert!(config.validate().is_err());

        let strict = LockoutConfig {
            max_login_attempts: 5,
            lockout_duration_minutes: 15,
            warning_threshold: 3,
            delay_threshold_attempts: 5,
            ..LockoutConfig::default()
        };
        assert!(strict.validate().is_ok());

        let forever = LockoutConfig {
            lockout_duration_minutes: i64::MAX,
            ..LockoutConfig::default()
        };
        assert!(forever.validate().is_err());
    }
}
