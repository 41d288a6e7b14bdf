//! Login control flow
//!
//! Slot admission, then credential verification through the `identity-provider`
//! circuit, then attempt recording. Admission and the lockout check are one atomic
//! step, so parallel attempts cannot slip past the backoff. Only a definite answer
//! from the identity provider counts as an attempt; an unreachable provider does not
//! burn the user's attempts.

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerError};
use crate::error::{AccessGuardResult, DenialCode};
use crate::lockout::{Admission, AttemptMeta, LockoutGuard, LockoutLevel, LockoutStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Checks a credential against the identity provider
#[async_trait]
pub trait CredentialVerifier: Send + Sync {
    /// `Ok(false)` means the credential was wrong.
    async fn verify(&self, identity: &str, secret: &str) -> AccessGuardResult<bool>;
}

/// Login attempt as presented by the client
#[derive(Debug, Clone)]
pub struct LoginRequest {
    /// Login name, usually an e-mail address
    pub identity: String,
    /// Credential presented
    pub secret: String,
    /// Resolved user, if the caller knows it
    pub user_id: Option<String>,
    /// Client IP
    pub ip_address: Option<String>,
}

/// Result of a login attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoginResult {
    /// Whether access was granted
    pub granted: bool,
    /// `None` on a plain wrong credential with no lock or backoff in force
    pub denial: Option<DenialCode>,
    /// When the caller may try again, for locked, throttled or open-circuit denials
    pub retry_after: Option<DateTime<Utc>>,
    /// Surfaced only once the identity has reached the warning level
    pub remaining_attempts: Option<u32>,
}

impl LoginResult {
    fn granted() -> Self {
        Self {
            granted: true,
            denial: None,
            retry_after: None,
            remaining_attempts: None,
        }
    }

    fn denied(code: DenialCode, retry_after: Option<DateTime<Utc>>) -> Self {
        Self {
            granted: false,
            denial: Some(code),
            retry_after,
            remaining_attempts: None,
        }
    }

    fn from_status(status: &LockoutStatus) -> Self {
        Self {
            granted: false,
            denial: status.denial(),
            retry_after: status.retry_after,
            remaining_attempts: (status.level >= LockoutLevel::Warning && !status.locked)
                .then_some(status.remaining_attempts),
        }
    }
}

/// Login gate
pub struct LoginGate {
    lockout: Arc<LockoutGuard>,
    breaker: Arc<CircuitBreaker>,
    verifier: Arc<dyn CredentialVerifier>,
}

impl LoginGate {
    /// Circuit name for credential checks
    pub const DEPENDENCY: &'static str = "identity-provider";

    /// Gate over a lockout guard and the breaker guarding `verifier`.
    pub fn new(
        lockout: Arc<LockoutGuard>,
        breaker: Arc<CircuitBreaker>,
        verifier: Arc<dyn CredentialVerifier>,
    ) -> Self {
        Self {
            lockout,
            breaker,
            verifier,
        }
    }

    /// Run one login attempt. Internal faults deny.
    pub async fn login(&self, request: &LoginRequest) -> LoginResult {
        match self.attempt(request).await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(identity = %request.identity, error = %e, "login fault, denying");
                LoginResult::denied(DenialCode::InternalValidationError, None)
            }
        }
    }

    async fn attempt(&self, request: &LoginRequest) -> AccessGuardResult<LoginResult> {
        let permit = match self.lockout.admit(&request.identity)? {
            Admission::Admitted(permit) => permit,
            Admission::Refused(status) => return Ok(LoginResult::from_status(&status)),
        };

        let verdict = self
            .breaker
            .execute(Self::DEPENDENCY, || {
                self.verifier.verify(&request.identity, &request.secret)
            })
            .await;

        // Early returns drop the permit, which frees the slot uncounted.
        let valid = match verdict {
            Ok(valid) => valid,
            Err(CircuitBreakerError::CircuitOpen { retry_after, .. }) => {
                tracing::warn!(identity = %request.identity, "identity provider circuit open");
                return Ok(LoginResult::denied(DenialCode::CircuitOpen, retry_after));
            }
            Err(e) => {
                tracing::warn!(identity = %request.identity, error = %e, "credential check failed");
                return Ok(LoginResult::denied(e.denial(), None));
            }
        };

        let meta = AttemptMeta {
            user_id: request.user_id.clone(),
            ip_address: request.ip_address.clone(),
            reason: (!valid).then(|| "invalid_credentials".to_string()),
        };
        let status = permit.record(valid, meta)?;

        Ok(if valid {
            LoginResult::granted()
        } else {
            LoginResult::from_status(&status)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::circuit_breaker::CircuitBreakerConfig;
    use crate::clock::ManualClock;
    use crate::error::AccessGuardError;
    use crate::lockout::LockoutConfig;
    use chrono::Duration;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubProvider {
        password: &'static str,
        online: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CredentialVerifier for StubProvider {
        async fn verify(&self, _identity: &str, secret: &str) -> AccessGuardResult<bool> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.online {
                return Err(AccessGuardError::DependencyFailed {
                    dependency: "identity-provider".to_string(),
                    reason: "connection refused".to_string(),
                });
            }
            Ok(secret == self.password)
        }
    }

    fn gate(online: bool) -> (LoginGate, Arc<StubProvider>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let audit = Arc::new(MemoryAuditSink::default());
        let lockout = Arc::new(
            LockoutGuard::new(LockoutConfig::default(), audit.clone(), clock.clone()).unwrap(),
        );
        let breaker = Arc::new(
            CircuitBreaker::new(CircuitBreakerConfig::default(), audit, clock.clone()).unwrap(),
        );
        let provider = Arc::new(StubProvider {
            password: "correct horse",
            online,
            calls: AtomicUsize::new(0),
        });
        (
            LoginGate::new(lockout, breaker, provider.clone()),
            provider,
            clock,
        )
    }

    fn request(secret: &str) -> LoginRequest {
        LoginRequest {
            identity: "pm@site.example".to_string(),
            secret: secret.to_string(),
            user_id: None,
            ip_address: Some("198.51.100.4".to_string()),
        }
    }

    #[tokio::test]
    async fn test_valid_credentials_granted() {
        let (gate, _, _) = gate(true);
        let result = gate.login(&request("correct horse")).await;
        assert!(result.granted);
        assert_eq!(result.denial, None);
    }

    #[tokio::test]
    async fn test_wrong_credentials_surface_warning_then_throttle() {
        let (gate, _, clock) = gate(true);
        for _ in 0..2 {
            let result = gate.login(&request("wrong")).await;
            assert!(!result.granted);
            assert_eq!(result.remaining_attempts, None);
        }
        let result = gate.login(&request("wrong")).await;
        assert_eq!(result.remaining_attempts, Some(7));

        gate.login(&request("wrong")).await;
        let result = gate.login(&request("wrong")).await;
        assert_eq!(result.denial, Some(DenialCode::AccountThrottled));

        // Correct password is refused while the backoff is owed.
        let result = gate.login(&request("correct horse")).await;
        assert_eq!(result.denial, Some(DenialCode::AccountThrottled));

        clock.advance(Duration::seconds(2));
        assert!(gate.login(&request("correct horse")).await.granted);
    }

    #[tokio::test]
    async fn test_locked_account_skips_provider() {
        let (gate, provider, clock) = gate(true);
        for _ in 0..10 {
            gate.login(&request("wrong")).await;
            clock.advance(Duration::seconds(60));
        }
        let calls = provider.calls.load(Ordering::SeqCst);

        let result = gate.login(&request("correct horse")).await;
        assert_eq!(result.denial, Some(DenialCode::AccountLocked));
        assert!(result.retry_after.is_some());
        assert_eq!(provider.calls.load(Ordering::SeqCst), calls);
    }

    #[tokio::test]
    async fn test_provider_outage_does_not_count_against_user() {
        let (gate, _, _) = gate(false);
        for _ in 0..5 {
            let result = gate.login(&request("correct horse")).await;
            assert_eq!(result.denial, Some(DenialCode::InternalValidationError));
        }
        let result = gate.login(&request("correct horse")).await;
        assert_eq!(result.denial, Some(DenialCode::CircuitOpen));
        assert!(result.retry_after.is_some());
        let record = gate.lockout.record("pm@site.example").unwrap().unwrap();
        assert_eq!(record.failed_attempts, 0);
        assert_eq!(record.in_flight, 0);
        assert!(record.recent_attempts.is_empty());
    }

    struct SlowProvider {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CredentialVerifier for SlowProvider {
        async fn verify(&self, _identity: &str, _secret: &str) -> AccessGuardResult<bool> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            Ok(false)
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_parallel_wrong_passwords_are_throttled() {
        let clock = Arc::new(ManualClock::default());
        let audit = Arc::new(MemoryAuditSink::default());
        let lockout = Arc::new(
            LockoutGuard::new(LockoutConfig::default(), audit.clone(), clock.clone()).unwrap(),
        );
        let breaker = Arc::new(
            CircuitBreaker::new(CircuitBreakerConfig::default(), audit, clock).unwrap(),
        );
        let provider = Arc::new(SlowProvider {
            calls: AtomicUsize::new(0),
        });
        let gate = Arc::new(LoginGate::new(lockout.clone(), breaker, provider.clone()));

        let handles: Vec<_> = (0..30)
            .map(|_| {
                let gate = gate.clone();
                tokio::spawn(async move { gate.login(&request("guess")).await })
            })
            .collect();
        let mut throttled = 0;
        for handle in handles {
            let result = handle.await.unwrap();
            assert!(!result.granted);
            if result.denial == Some(DenialCode::AccountThrottled) {
                throttled += 1;
            }
        }

        let checks = provider.calls.load(Ordering::SeqCst);
        assert_eq!(checks, 5);
        // 25 refused up front, plus the check that recorded the fifth failure.
        assert_eq!(throttled, 26);
        let record = lockout.record("pm@site.example").unwrap().unwrap();
        assert_eq!(record.failed_attempts, 5);
        assert_eq!(record.in_flight, 0);
        assert!(!record.locked);
    }
}
