//! Zero-trust access pipeline
//!
//! Steps run in a fixed order and stop at the first failure:
//! policy sanity, device trust, location, time window, behavior, session, MFA.
//! Any internal fault denies with `InternalValidationError`.

use crate::audit::{AuditEvent, AuditOutcome, AuditSink};
use crate::behavior_analysis::{Activity, BehavioralAnalyzer};
use crate::clock::Clock;
use crate::error::{AccessGuardError, AccessGuardResult, DenialCode};
use crate::mfa::{MfaStatus, MfaVerifier};
use crate::policy::{AccessRequest, Decision, PolicyStep, StepOutcome, ZeroTrustPolicy};
use crate::session_manager::{SessionBinding, SessionRegistry};
use crate::trust_store::TrustStore;
use chrono::{DateTime, Datelike, FixedOffset, Local, NaiveTime, Offset, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Validator configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    /// Offset of the clock time windows are written in. Host local time when unset.
    pub policy_utc_offset_minutes: Option<i32>,
}

impl ValidatorConfig {
    /// Reject offsets of a day or more.
    pub fn validate(&self) -> AccessGuardResult<()> {
        if let Some(minutes) = self.policy_utc_offset_minutes {
            if minutes.abs() >= 24 * 60 {
                return Err(AccessGuardError::ConfigurationError {
                    message: format!("validator.policy_utc_offset_minutes {minutes} out of range"),
                });
            }
        }
        Ok(())
    }

    /// Day of week (0 = Sunday) and wall time of `at` on the policy clock.
    fn policy_time(&self, at: DateTime<Utc>) -> (u8, NaiveTime) {
        let offset = self
            .policy_utc_offset_minutes
            .and_then(|minutes| FixedOffset::east_opt(minutes * 60))
            .unwrap_or_else(|| Local.offset_from_utc_datetime(&at.naive_utc()).fix());
        let local = at.with_timezone(&offset);
        (local.weekday().num_days_from_sunday() as u8, local.time())
    }
}

/// Request authorization engine
pub struct AccessValidator {
    config: ValidatorConfig,
    trust: Arc<TrustStore>,
    analyzer: BehavioralAnalyzer,
    sessions: Arc<SessionRegistry>,
    mfa: Arc<dyn MfaVerifier>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
}

/// Steps evaluated so far plus request fields for logging
struct Trail<'a> {
    request: &'a AccessRequest,
    steps: Vec<StepOutcome>,
}

impl Trail<'_> {
    fn pass(&mut self, step: PolicyStep, detail: impl Into<String>) {
        let detail = detail.into();
        tracing::debug!(
            user_id = %self.request.user_id,
            resource_id = %self.request.resource_id,
            action = %self.request.action,
            step = ?step,
            %detail,
            "access step passed"
        );
        self.steps.push(StepOutcome {
            step,
            passed: true,
            detail,
        });
    }

    fn fail(
        &mut self,
        step: PolicyStep,
        code: DenialCode,
        detail: impl Into<String>,
    ) -> Option<DenialCode> {
        let detail = detail.into();
        tracing::info!(
            user_id = %self.request.user_id,
            resource_id = %self.request.resource_id,
            action = %self.request.action,
            step = ?step,
            reason = %code,
            %detail,
            "access step failed"
        );
        self.steps.push(StepOutcome {
            step,
            passed: false,
            detail,
        });
        Some(code)
    }
}

impl AccessValidator {
    /// Wire the pipeline. Fails on an invalid `config`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ValidatorConfig,
        trust: Arc<TrustStore>,
        analyzer: BehavioralAnalyzer,
        sessions: Arc<SessionRegistry>,
        mfa: Arc<dyn MfaVerifier>,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
    ) -> AccessGuardResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            trust,
            analyzer,
            sessions,
            mfa,
            audit,
            clock,
        })
    }

    /// Evaluate `request` against `policy`. Never fails: faults become a deny.
    pub async fn validate(&self, request: &AccessRequest, policy: &ZeroTrustPolicy) -> Decision {
        let mut trail = Trail {
            request,
            steps: Vec::with_capacity(7),
        };

        let decision = match self.evaluate(request, policy, &mut trail).await {
            Ok(None) => Decision::allow(trail.steps),
            Ok(Some(code)) => Decision::deny(code, trail.steps),
            Err(e) => {
                tracing::error!(
                    user_id = %request.user_id,
                    resource_id = %request.resource_id,
                    action = %request.action,
                    error = %e,
                    "access validation fault, denying"
                );
                Decision::deny(DenialCode::InternalValidationError, trail.steps)
            }
        };

        self.emit(request, &decision);
        decision
    }

    async fn evaluate(
        &self,
        request: &AccessRequest,
        policy: &ZeroTrustPolicy,
        trail: &mut Trail<'_>,
    ) -> AccessGuardResult<Option<DenialCode>> {
        let context = &request.context;

        if let Err(e) = policy.validate().and_then(|()| {
            if context.user_id == request.user_id {
                Ok(())
            } else {
                Err(AccessGuardError::InvalidInput {
                    field: "context.user_id".to_string(),
                    reason: "does not match request user".to_string(),
                })
            }
        }) {
            trail.fail(
                PolicyStep::PolicySanity,
                DenialCode::InternalValidationError,
                e.to_string(),
            );
            return Err(e);
        }
        trail.pass(PolicyStep::PolicySanity, "ok");

        if policy.require_device_trust {
            match &context.device_id {
                Some(device_id) => {
                    if !self.trust.is_device_trusted(&request.user_id, device_id)? {
                        return Ok(trail.fail(
                            PolicyStep::DeviceTrust,
                            DenialCode::DeviceNotTrusted,
                            format!("device {device_id} not trusted"),
                        ));
                    }
                    trail.pass(PolicyStep::DeviceTrust, format!("device {device_id} trusted"));
                }
                None => trail.pass(PolicyStep::DeviceTrust, "no device presented"),
            }
        }

        if !policy.allowed_locations.is_empty() {
            if let Some(location) = &context.location {
                if !policy.allows_country(&location.country) {
                    return Ok(trail.fail(
                        PolicyStep::Location,
                        DenialCode::LocationDenied,
                        format!("country {} not allowed", location.country),
                    ));
                }
                trail.pass(PolicyStep::Location, format!("country {}", location.country));
            }
        }

        if !policy.allowed_time_windows.is_empty() {
            // Windows are judged on our clock; the caller's timestamp may be stale.
            let (day, time) = self.config.policy_time(self.clock.now());
            if !policy
                .allowed_time_windows
                .iter()
                .any(|window| window.contains(day, time))
            {
                return Ok(trail.fail(
                    PolicyStep::TimeWindow,
                    DenialCode::TimeWindowDenied,
                    format!("day {day} {} outside allowed windows", time.format("%H:%M")),
                ));
            }
            trail.pass(PolicyStep::TimeWindow, format!("day {day} {}", time.format("%H:%M")));
        }

        let activity = Activity {
            ip: context.ip_address.clone(),
            user_agent: context.user_agent.clone(),
            timestamp: context.timestamp,
            location: context.location.clone(),
            resource: Some(request.resource_id.clone()),
            action: Some(request.action.clone()),
        };
        let assessment = match self
            .trust
            .assess_and_observe(&request.user_id, &activity, &self.analyzer)
        {
            Ok(assessment) => assessment,
            Err(e) => self.analyzer.assess_lookup(Err(e), &activity),
        };
        if assessment.level.is_blocking() {
            return Ok(trail.fail(
                PolicyStep::Behavior,
                DenialCode::SuspiciousActivity,
                format!("risk {:?} from {:?}", assessment.level, assessment.signals),
            ));
        }
        trail.pass(PolicyStep::Behavior, format!("risk {:?}", assessment.level));

        let binding = SessionBinding {
            session_id: context.session_id.clone(),
            device_id: context.device_id.clone(),
            ip_address: context.ip_address.clone(),
            user_agent: context.user_agent.clone(),
        };
        let admission = self.sessions.admit(
            &request.user_id,
            &binding,
            policy.max_concurrent_sessions,
            policy.session_timeout_minutes,
        )?;
        if !admission.admitted {
            return Ok(trail.fail(
                PolicyStep::Session,
                DenialCode::SessionLimitExceeded,
                format!("{} live sessions", admission.active_sessions),
            ));
        }
        trail.pass(
            PolicyStep::Session,
            format!("{} live sessions", admission.active_sessions),
        );

        if policy.require_mfa {
            match self.mfa.status(&request.user_id, &context.session_id).await {
                Ok(MfaStatus::Verified) => trail.pass(PolicyStep::Mfa, "verified"),
                Ok(MfaStatus::NotVerified) => {
                    return Ok(trail.fail(PolicyStep::Mfa, DenialCode::MfaRequired, "not verified"));
                }
                Err(e) => {
                    return Ok(trail.fail(
                        PolicyStep::Mfa,
                        DenialCode::MfaRequired,
                        format!("status unavailable: {e}"),
                    ));
                }
            }
        }

        Ok(None)
    }

    fn emit(&self, request: &AccessRequest, decision: &Decision) {
        let outcome = if decision.allow {
            AuditOutcome::Allowed
        } else {
            AuditOutcome::Denied
        };
        let mut event = AuditEvent::new(
            self.clock.now(),
            request.user_id.as_str(),
            "access.validate",
            outcome,
        )
        .with_metadata(serde_json::json!({
            "decision_id": decision.decision_id,
            "resource_id": request.resource_id,
            "action": request.action,
            "session_id": request.context.session_id,
            "ip_address": request.context.ip_address,
            "steps": decision.steps,
        }));
        if let Some(code) = decision.reason {
            event = event.with_reason(code.as_str());
        }
        self.audit.emit(event);
    }
}
