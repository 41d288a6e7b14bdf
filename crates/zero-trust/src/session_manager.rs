//! Concurrent-session and idle-timeout enforcement
//!
//! Admission is always prune, then count, then admit, under the user's key lock:
//! - Sessions idle longer than the timeout are dropped first
//! - Counts are recomputed from the surviving list on every call
//! - Re-admitting a live session refreshes it instead of counting it twice

use crate::clock::Clock;
use crate::error::{AccessGuardError, AccessGuardResult};
use crate::store::{mutate, InMemoryStore, StateStore};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Where a session came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionBinding {
    /// Session ID
    pub session_id: String,
    /// Device ID
    pub device_id: Option<String>,
    /// IP address
    pub ip_address: String,
    /// User agent
    pub user_agent: String,
}

/// Session tracked for a user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedSession {
    /// Owning user
    pub user_id: String,
    /// Origin of the session
    pub binding: SessionBinding,
    /// First admission
    pub admitted_at: DateTime<Utc>,
    /// Last admission or refresh
    pub last_seen: DateTime<Utc>,
}

impl TrackedSession {
    fn is_expired(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        now.signed_duration_since(self.last_seen) > timeout
    }
}

/// Outcome of an admission attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionAdmission {
    /// Whether the session may proceed
    pub admitted: bool,
    /// The session was already live and was refreshed
    pub refreshed: bool,
    /// Live sessions after this call
    pub active_sessions: usize,
    /// Sessions pruned as idle during this call
    pub pruned: usize,
}

/// Per-user session registry
pub struct SessionRegistry {
    sessions: Arc<dyn StateStore<Vec<TrackedSession>>>,
    clock: Arc<dyn Clock>,
}

impl SessionRegistry {
    /// Create a registry backed by a process-local map.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_store(InMemoryStore::shared("user_sessions"), clock)
    }

    /// Create a registry over an injected backend.
    pub fn with_store(
        sessions: Arc<dyn StateStore<Vec<TrackedSession>>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { sessions, clock }
    }

    fn timeout(timeout_minutes: i64) -> AccessGuardResult<Duration> {
        Duration::try_minutes(timeout_minutes)
            .filter(|_| timeout_minutes > 0)
            .ok_or_else(|| AccessGuardError::InvalidPolicy {
                reason: format!("session timeout of {timeout_minutes} minutes"),
            })
    }

    /// Admit `binding` for `user_id` unless that would exceed `max_concurrent` live
    /// sessions.
    pub fn admit(
        &self,
        user_id: &str,
        binding: &SessionBinding,
        max_concurrent: usize,
        timeout_minutes: i64,
    ) -> AccessGuardResult<SessionAdmission> {
        if max_concurrent == 0 {
            return Err(AccessGuardError::InvalidPolicy {
                reason: "max_concurrent_sessions must be at least 1".to_string(),
            });
        }
        let timeout = Self::timeout(timeout_minutes)?;
        let now = self.clock.now();

        let admission = mutate(self.sessions.as_ref(), user_id, Vec::new, |sessions| {
            let before = sessions.len();
            sessions.retain(|s| !s.is_expired(now, timeout));
            let pruned = before - sessions.len();

            if let Some(pos) = sessions
                .iter()
                .position(|s| s.binding.session_id == binding.session_id)
            {
                sessions[pos].last_seen = now;
                return SessionAdmission {
                    admitted: true,
                    refreshed: true,
                    active_sessions: sessions.len(),
                    pruned,
                };
            }

            if sessions.len() >= max_concurrent {
                return SessionAdmission {
                    admitted: false,
                    refreshed: false,
                    active_sessions: sessions.len(),
                    pruned,
                };
            }

            sessions.push(TrackedSession {
                user_id: user_id.to_string(),
                binding: binding.clone(),
                admitted_at: now,
                last_seen: now,
            });
            SessionAdmission {
                admitted: true,
                refreshed: false,
                active_sessions: sessions.len(),
                pruned,
            }
        })?;

        if admission.admitted {
            tracing::debug!(
                user_id,
                session_id = %binding.session_id,
                active = admission.active_sessions,
                refreshed = admission.refreshed,
                pruned = admission.pruned,
                "session admitted"
            );
        } else {
            tracing::warn!(
                user_id,
                session_id = %binding.session_id,
                active = admission.active_sessions,
                max_concurrent,
                "session limit reached"
            );
        }
        Ok(admission)
    }

    /// End a session. Returns whether it was live.
    pub fn release(&self, user_id: &str, session_id: &str) -> AccessGuardResult<bool> {
        let removed = mutate(self.sessions.as_ref(), user_id, Vec::new, |sessions| {
            let before = sessions.len();
            sessions.retain(|s| s.binding.session_id != session_id);
            before != sessions.len()
        })?;
        if removed {
            tracing::debug!(user_id, session_id, "session released");
        }
        Ok(removed)
    }

    /// Live sessions for a user under `timeout_minutes`.
    pub fn active_sessions(
        &self,
        user_id: &str,
        timeout_minutes: i64,
    ) -> AccessGuardResult<Vec<TrackedSession>> {
        let timeout = Self::timeout(timeout_minutes)?;
        let now = self.clock.now();
        Ok(self
            .sessions
            .get(user_id)?
            .unwrap_or_default()
            .into_iter()
            .filter(|s| !s.is_expired(now, timeout))
            .collect())
    }
}
