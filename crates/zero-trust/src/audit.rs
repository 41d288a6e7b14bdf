//! Structured security events
//!
//! Every access decision, lockout transition and circuit transition is emitted as an
//! [`AuditEvent`]. Where the events end up is the sink's business; the core only fixes
//! the shape.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use uuid::Uuid;

/// Outcome recorded on an audit event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    /// Request allowed
    Allowed,
    /// Request denied
    Denied,
    /// Guarded operation succeeded
    Success,
    /// Guarded operation failed
    Failure,
    /// State machine moved to a new state
    Transition,
}

/// Security event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Event ID
    pub event_id: Uuid,
    /// Event timestamp
    pub timestamp: DateTime<Utc>,
    /// Who the event is about (user id, identity or dependency name)
    pub actor: String,
    /// Dotted action name, e.g. `access.validate`
    pub action: String,
    /// Outcome
    pub outcome: AuditOutcome,
    /// Machine-readable reason
    pub reason: Option<String>,
    /// Free-form context
    pub metadata: serde_json::Value,
}

impl AuditEvent {
    /// Build an event with empty metadata.
    pub fn new(
        timestamp: DateTime<Utc>,
        actor: impl Into<String>,
        action: impl Into<String>,
        outcome: AuditOutcome,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            timestamp,
            actor: actor.into(),
            action: action.into(),
            outcome,
            reason: None,
            metadata: serde_json::Value::Null,
        }
    }

    /// Attach a reason.
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Attach metadata.
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Destination for audit events. Implementations must not block.
pub trait AuditSink: Send + Sync + fmt::Debug {
    /// Record one event.
    fn emit(&self, event: AuditEvent);
}

/// Sink that writes each event as a structured `tracing` record.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn emit(&self, event: AuditEvent) {
        let reason = event.reason.as_deref().unwrap_or("");
        match event.outcome {
            AuditOutcome::Denied | AuditOutcome::Failure => tracing::warn!(
                target: "sitegate::audit",
                event_id = %event.event_id,
                actor = %event.actor,
                action = %event.action,
                outcome = ?event.outcome,
                reason,
                metadata = %event.metadata,
                "security event"
            ),
            _ => tracing::info!(
                target: "sitegate::audit",
                event_id = %event.event_id,
                actor = %event.actor,
                action = %event.action,
                outcome = ?event.outcome,
                reason,
                metadata = %event.metadata,
                "security event"
            ),
        }
    }
}

/// Bounded in-memory sink, oldest events dropped first.
#[derive(Debug)]
pub struct MemoryAuditSink {
    capacity: usize,
    events: Mutex<VecDeque<AuditEvent>>,
}

impl MemoryAuditSink {
    /// Create a sink holding at most `capacity` events.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            events: Mutex::new(VecDeque::new()),
        }
    }

    /// Snapshot of all retained events, oldest first.
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().iter().cloned().collect()
    }

    /// Retained events with the given action.
    pub fn events_for(&self, action: &str) -> Vec<AuditEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.action == action)
            .cloned()
            .collect()
    }

    /// Drop everything.
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl Default for MemoryAuditSink {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl AuditSink for MemoryAuditSink {
    fn emit(&self, event: AuditEvent) {
        let mut events = self.events.lock();
        while events.len() >= self.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }
}
