//! Access-control and resilience core for the SiteGate construction platform
//!
//! This crate decides whether a request or a login may proceed:
//! - Zero-trust request validation (device, location, time window, behavior, session, MFA)
//! - Adaptive brute-force lockout for logins
//! - Circuit breaking for identity-provider and geo lookups
//! - Device trust records and behavioral baselines
//!
//! Every service fails closed and reports outcomes as typed [`DenialCode`]s.

#![warn(missing_docs)]

pub mod audit;
pub mod behavior_analysis;
pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod error;
pub mod geo;
pub mod lockout;
pub mod login;
pub mod mfa;
pub mod policy;
pub mod session_manager;
pub mod store;
pub mod telemetry;
pub mod trust_store;
pub mod validator;

pub use audit::{AuditEvent, AuditOutcome, AuditSink, MemoryAuditSink, TracingAuditSink};
pub use behavior_analysis::{Activity, BehavioralAnalyzer, RiskAssessment, RiskLevel};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerError, CircuitState};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::AccessGuardConfig;
pub use error::{AccessGuardError, AccessGuardResult, DenialCode};
pub use geo::{GeoLookup, GeoResolver, HttpGeoResolver};
pub use lockout::{Admission, AttemptMeta, AttemptPermit, LockoutGuard, LockoutLevel, LockoutStatus};
pub use login::{CredentialVerifier, LoginGate, LoginRequest, LoginResult};
pub use mfa::{InMemoryMfaRegistry, MfaStatus, MfaVerifier};
pub use policy::{AccessRequest, Decision, Location, TimeWindow, ZeroTrustContext, ZeroTrustPolicy};
pub use session_manager::SessionRegistry;
pub use store::{InMemoryStore, StateStore};
pub use trust_store::{DeviceTrustInfo, TrustStore};
pub use validator::AccessValidator;

use std::sync::Arc;

/// All services wired from one configuration, with fresh state.
pub struct AccessCore {
    config: AccessGuardConfig,
    clock: Arc<dyn Clock>,
    trust: Arc<TrustStore>,
    sessions: Arc<SessionRegistry>,
    lockout: Arc<LockoutGuard>,
    breaker: Arc<CircuitBreaker>,
    validator: AccessValidator,
}

impl AccessCore {
    /// Wire services on the system clock with audit events sent to `tracing`.
    pub fn new(config: AccessGuardConfig, mfa: Arc<dyn MfaVerifier>) -> AccessGuardResult<Self> {
        Self::with_runtime(config, mfa, Arc::new(TracingAuditSink), Arc::new(SystemClock))
    }

    /// Wire services on an injected audit sink and clock.
    pub fn with_runtime(
        config: AccessGuardConfig,
        mfa: Arc<dyn MfaVerifier>,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
    ) -> AccessGuardResult<Self> {
        config.validate()?;

        let trust = Arc::new(TrustStore::new(config.trust.clone(), clock.clone()));
        let sessions = Arc::new(SessionRegistry::new(clock.clone()));
        let lockout = Arc::new(LockoutGuard::new(
            config.lockout.clone(),
            audit.clone(),
            clock.clone(),
        )?);
        let breaker = Arc::new(CircuitBreaker::new(
            config.circuit_breaker.clone(),
            audit.clone(),
            clock.clone(),
        )?);
        let validator = AccessValidator::new(
            config.validator.clone(),
            trust.clone(),
            BehavioralAnalyzer::new(config.behavior.clone()),
            sessions.clone(),
            mfa,
            audit,
            clock.clone(),
        )?;

        tracing::info!(
            max_login_attempts = config.lockout.max_login_attempts,
            failure_threshold = config.circuit_breaker.failure_threshold,
            "access core initialized"
        );

        Ok(Self {
            config,
            clock,
            trust,
            sessions,
            lockout,
            breaker,
            validator,
        })
    }

    /// Login flow over this core's lockout guard and circuit breaker.
    pub fn login_gate(&self, verifier: Arc<dyn CredentialVerifier>) -> LoginGate {
        LoginGate::new(self.lockout.clone(), self.breaker.clone(), verifier)
    }

    /// Geo resolution over this core's circuit breaker.
    pub fn geo_lookup(&self, resolver: Arc<dyn GeoResolver>) -> GeoLookup {
        GeoLookup::new(resolver, self.breaker.clone())
    }

    /// Request validation pipeline.
    pub fn validator(&self) -> &AccessValidator {
        &self.validator
    }

    /// Device trust and behavioral profiles.
    pub fn trust_store(&self) -> &Arc<TrustStore> {
        &self.trust
    }

    /// Session registry.
    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    /// Login lockout guard.
    pub fn lockout(&self) -> &Arc<LockoutGuard> {
        &self.lockout
    }

    /// Circuit breaker shared by the login gate and geo lookups.
    pub fn circuit_breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Clock every service reads.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Configuration the core was built from.
    pub fn config(&self) -> &AccessGuardConfig {
        &self.config
    }
}
