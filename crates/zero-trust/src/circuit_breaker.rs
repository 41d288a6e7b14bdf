//! Circuit breaker for downstream dependencies
//!
//! Every named dependency has its own CLOSED / OPEN / HALF_OPEN record in the injected
//! state store. A call is admitted and its outcome recorded in two separate atomic
//! updates, so the wrapped operation itself never runs under a store lock.
//!
//! A failure in HALF_OPEN re-opens the circuit at once: failures are not reset when
//! the half-open probe starts, so the count is still at or above the threshold.

use crate::audit::{AuditEvent, AuditOutcome, AuditSink};
use crate::clock::Clock;
use crate::error::{AccessGuardError, AccessGuardResult, DenialCode};
use crate::store::{mutate, InMemoryStore, StateStore};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Statistics are halved once this many requests have been counted.
const STATS_DECAY_THRESHOLD: u64 = 10_000;

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Time the circuit stays open before a probe is allowed
    pub recovery_timeout_ms: i64,
    /// Half-open successes that close the circuit
    pub success_threshold: u32,
    /// Timeout applied by `execute` when set
    pub call_timeout_ms: Option<u64>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_ms: 60_000,
            success_threshold: 3,
            call_timeout_ms: None,
        }
    }
}

impl CircuitBreakerConfig {
    /// Thresholds and timeouts must be positive.
    pub fn validate(&self) -> AccessGuardResult<()> {
        let fail = |message: &str| {
            Err(AccessGuardError::ConfigurationError {
                message: format!("circuit_breaker: {message}"),
            })
        };
        if self.failure_threshold == 0 || self.success_threshold == 0 {
            return fail("thresholds must be at least 1");
        }
        if self.recovery_timeout_ms <= 0 {
            return fail("recovery_timeout_ms must be positive");
        }
        if self.call_timeout_ms == Some(0) {
            return fail("call_timeout_ms must be positive when set");
        }
        Ok(())
    }
}

/// Circuit state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Calls pass through
    Closed,
    /// Calls fail fast until `next_retry_time`
    Open,
    /// Probe calls allowed; one failure re-opens
    HalfOpen,
}

/// Per-dependency record, also returned as statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    /// Dependency name
    pub dependency: String,
    /// Current state
    pub state: CircuitState,
    /// Consecutive failures
    pub failures: u32,
    /// Half-open successes so far
    pub successes: u32,
    /// Epoch milliseconds
    pub last_failure_time: Option<i64>,
    /// Epoch milliseconds
    pub last_success_time: Option<i64>,
    /// Requests counted, halved past the decay threshold
    pub total_requests: u64,
    /// Failed requests, halved together with `total_requests`
    pub failed_requests: u64,
    /// Epoch milliseconds; set only while open
    pub next_retry_time: Option<i64>,
}

impl CircuitBreakerState {
    fn new(dependency: &str) -> Self {
        Self {
            dependency: dependency.to_string(),
            state: CircuitState::Closed,
            failures: 0,
            successes: 0,
            last_failure_time: None,
            last_success_time: None,
            total_requests: 0,
            failed_requests: 0,
            next_retry_time: None,
        }
    }

    /// Share of counted requests that failed.
    pub fn failure_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.failed_requests as f64 / self.total_requests as f64
        }
    }
}

/// Error returned by a guarded call
#[derive(Debug, Error)]
pub enum CircuitBreakerError<E> {
    /// Rejected without calling the dependency
    #[error("Circuit open for {dependency}")]
    CircuitOpen {
        dependency: String,
        retry_after: Option<DateTime<Utc>>,
    },

    /// The call did not finish in time
    #[error("Call to {dependency} timed out after {timeout_ms}ms")]
    Timeout { dependency: String, timeout_ms: u64 },

    /// Breaker state could not be read or written
    #[error("Circuit state unavailable: {0}")]
    StateUnavailable(AccessGuardError),

    /// The dependency itself failed
    #[error("Operation failed: {0}")]
    OperationFailed(E),
}

impl<E> CircuitBreakerError<E> {
    /// Denial reported to callers that must fail closed.
    pub fn denial(&self) -> DenialCode {
        match self {
            Self::CircuitOpen { .. } => DenialCode::CircuitOpen,
            _ => DenialCode::InternalValidationError,
        }
    }

    /// Whether the call was rejected without reaching the dependency.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }
}

struct Transition {
    from: CircuitState,
    to: CircuitState,
}

/// Multi-dependency circuit breaker
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    states: Arc<dyn StateStore<CircuitBreakerState>>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    /// Create a breaker backed by a process-local map.
    pub fn new(
        config: CircuitBreakerConfig,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
    ) -> AccessGuardResult<Self> {
        Self::with_store(config, InMemoryStore::shared("circuit_breakers"), audit, clock)
    }

    /// Create a breaker over an injected backend.
    pub fn with_store(
        config: CircuitBreakerConfig,
        states: Arc<dyn StateStore<CircuitBreakerState>>,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
    ) -> AccessGuardResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            states,
            audit,
            clock,
        })
    }

    /// Run `operation` under the circuit for `dependency`, applying
    /// `call_timeout_ms` when configured.
    pub async fn execute<T, E, F, Fut>(
        &self,
        dependency: &str,
        operation: F,
    ) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let timeout = self.config.call_timeout_ms.map(Duration::from_millis);
        self.run(dependency, timeout, operation).await
    }

    /// Like [`execute`](Self::execute) with an explicit timeout; expiry counts as a
    /// failure.
    pub async fn execute_with_timeout<T, E, F, Fut>(
        &self,
        dependency: &str,
        timeout: Duration,
        operation: F,
    ) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run(dependency, Some(timeout), operation).await
    }

    async fn run<T, E, F, Fut>(
        &self,
        dependency: &str,
        timeout: Option<Duration>,
        operation: F,
    ) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.admit(dependency)?;

        // Settles as a failure if this future is dropped mid-call.
        let mut in_flight = InFlight {
            breaker: self,
            dependency,
            settled: false,
        };

        let outcome = match timeout {
            Some(limit) => match tokio::time::timeout(limit, operation()).await {
                Ok(result) => result.map_err(CircuitBreakerError::OperationFailed),
                Err(_) => Err(CircuitBreakerError::Timeout {
                    dependency: dependency.to_string(),
                    timeout_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                }),
            },
            None => operation()
                .await
                .map_err(CircuitBreakerError::OperationFailed),
        };

        in_flight.settled = true;
        if let Err(CircuitBreakerError::Timeout { timeout_ms, .. }) = &outcome {
            tracing::warn!(dependency, timeout_ms = *timeout_ms, "guarded call timed out");
        }
        self.settle(dependency, outcome.is_ok())
            .map_err(CircuitBreakerError::StateUnavailable)?;
        outcome
    }

    fn admit<E>(&self, dependency: &str) -> Result<(), CircuitBreakerError<E>> {
        let now = self.clock.now_ms();
        let (admitted, transition, retry_at) = mutate(
            self.states.as_ref(),
            dependency,
            || CircuitBreakerState::new(dependency),
            |record| {
                let mut transition = None;
                if record.state == CircuitState::Open {
                    match record.next_retry_time {
                        Some(retry_at) if now < retry_at => {
                            return (false, None, Some(retry_at));
                        }
                        _ => {
                            record.state = CircuitState::HalfOpen;
                            record.successes = 0;
                            record.next_retry_time = None;
                            transition = Some(Transition {
                                from: CircuitState::Open,
                                to: CircuitState::HalfOpen,
                            });
                        }
                    }
                }
                record.total_requests += 1;
                if record.total_requests > STATS_DECAY_THRESHOLD {
                    record.total_requests /= 2;
                    record.failed_requests /= 2;
                }
                (true, transition, None)
            },
        )
        .map_err(CircuitBreakerError::StateUnavailable)?;

        if let Some(transition) = transition {
            self.emit_transition(dependency, transition);
        }
        if admitted {
            return Ok(());
        }

        let retry_after = retry_at.and_then(|ms| Utc.timestamp_millis_opt(ms).single());
        tracing::debug!(dependency, ?retry_after, "circuit open, call rejected");
        Err(CircuitBreakerError::CircuitOpen {
            dependency: dependency.to_string(),
            retry_after,
        })
    }

    fn settle(&self, dependency: &str, success: bool) -> AccessGuardResult<()> {
        let now = self.clock.now_ms();
        let config = &self.config;
        let transition = mutate(
            self.states.as_ref(),
            dependency,
            || CircuitBreakerState::new(dependency),
            |record| {
                let from = record.state;
                if success {
                    record.last_success_time = Some(now);
                    match record.state {
                        CircuitState::Closed => record.failures = 0,
                        CircuitState::HalfOpen => {
                            record.successes += 1;
                            if record.successes >= config.success_threshold {
                                record.state = CircuitState::Closed;
                                record.failures = 0;
                                record.successes = 0;
                            }
                        }
                        // A call admitted before the circuit opened; keep it open.
                        CircuitState::Open => {}
                    }
                } else {
                    record.last_failure_time = Some(now);
                    record.failures = record.failures.saturating_add(1);
                    record.failed_requests += 1;
                    if record.state != CircuitState::Open
                        && record.failures >= config.failure_threshold
                    {
                        record.state = CircuitState::Open;
                        record.successes = 0;
                        record.next_retry_time =
                            Some(now.saturating_add(config.recovery_timeout_ms));
                    }
                }
                (from != record.state).then_some(Transition {
                    from,
                    to: record.state,
                })
            },
        )?;

        if let Some(transition) = transition {
            self.emit_transition(dependency, transition);
        }
        Ok(())
    }

    /// Statistics for one dependency, `None` if it was never called.
    pub fn get_stats(&self, dependency: &str) -> AccessGuardResult<Option<CircuitBreakerState>> {
        self.states.get(dependency)
    }

    /// Statistics for every dependency, sorted by name.
    pub fn all_stats(&self) -> AccessGuardResult<Vec<CircuitBreakerState>> {
        let mut stats = Vec::new();
        for key in self.states.keys()? {
            if let Some(state) = self.states.get(&key)? {
                stats.push(state);
            }
        }
        stats.sort_by(|a, b| a.dependency.cmp(&b.dependency));
        Ok(stats)
    }

    /// Current state; unknown dependencies are closed.
    pub fn state(&self, dependency: &str) -> AccessGuardResult<CircuitState> {
        Ok(self
            .states
            .get(dependency)?
            .map_or(CircuitState::Closed, |s| s.state))
    }

    /// Force a dependency back to a fresh closed record.
    pub fn reset(&self, dependency: &str) -> AccessGuardResult<()> {
        let previous = self.states.remove(dependency)?;
        self.states
            .put(dependency, CircuitBreakerState::new(dependency))?;
        if let Some(previous) = previous.filter(|p| p.state != CircuitState::Closed) {
            self.emit_transition(
                dependency,
                Transition {
                    from: previous.state,
                    to: CircuitState::Closed,
                },
            );
        }
        Ok(())
    }

    /// Configuration in use.
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn emit_transition(&self, dependency: &str, transition: Transition) {
        match transition.to {
            CircuitState::Open => tracing::warn!(
                dependency,
                from = ?transition.from,
                "circuit opened"
            ),
            _ => tracing::info!(
                dependency,
                from = ?transition.from,
                to = ?transition.to,
                "circuit transition"
            ),
        }
        self.audit.emit(
            AuditEvent::new(
                self.clock.now(),
                dependency,
                "circuit.transition",
                AuditOutcome::Transition,
            )
            .with_metadata(serde_json::json!({
                "from": transition.from,
                "to": transition.to,
            })),
        );
    }
}

struct InFlight<'a> {
    breaker: &'a CircuitBreaker,
    dependency: &'a str,
    settled: bool,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        tracing::warn!(dependency = self.dependency, "guarded call cancelled");
        if let Err(e) = self.breaker.settle(self.dependency, false) {
            tracing::error!(dependency = self.dependency, error = %e, "failed to record cancellation");
        }
    }
}
