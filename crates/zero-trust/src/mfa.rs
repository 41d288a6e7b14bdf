//! Multi-factor verification status
//!
//! The access pipeline only asks whether a session has completed MFA. Enrollment and
//! challenge delivery live with the identity provider.

use crate::error::AccessGuardResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// MFA status of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MfaStatus {
    /// A second factor was verified for this session
    Verified,
    /// No verified second factor
    NotVerified,
}

/// Source of MFA status
#[async_trait]
pub trait MfaVerifier: Send + Sync {
    /// Status for `session_id` of `user_id`. Callers treat an error as not verified.
    async fn status(&self, user_id: &str, session_id: &str) -> AccessGuardResult<MfaStatus>;
}

/// Process-local record of sessions that completed MFA
#[derive(Debug, Default)]
pub struct InMemoryMfaRegistry {
    verified: DashMap<(String, String), DateTime<Utc>>,
}

impl InMemoryMfaRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a completed challenge.
    pub fn mark_verified(&self, user_id: &str, session_id: &str, at: DateTime<Utc>) {
        self.verified
            .insert((user_id.to_string(), session_id.to_string()), at);
    }

    /// Forget a session's verification. Returns whether one existed.
    pub fn revoke(&self, user_id: &str, session_id: &str) -> bool {
        self.verified
            .remove(&(user_id.to_string(), session_id.to_string()))
            .is_some()
    }
}

#[async_trait]
impl MfaVerifier for InMemoryMfaRegistry {
    async fn status(&self, user_id: &str, session_id: &str) -> AccessGuardResult<MfaStatus> {
        let key = (user_id.to_string(), session_id.to_string());
        Ok(if self.verified.contains_key(&key) {
            MfaStatus::Verified
        } else {
            MfaStatus::NotVerified
        })
    }
}
