// src/audit/trail.rs
//! Lock-free audit event buffer
//!
//! Recording sits on the hot path of every manager operation, so events go
//! through a bounded MPMC queue and are persisted by a background writer.
//! When the queue is full the event is dropped and counted, never blocking
//! the caller.

use chrono::Utc;
use crossbeam::queue::ArrayQueue;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Kinds of auditable engine events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    AgentSpawned,
    AgentSuspended,
    AgentResumed,
    AgentRecovered,
    AgentTerminated,
    PluginAttached,
    PluginDetached,
    OperationExecuted,
    OperationFailed,
    SnapshotTaken,
    AgreementCreated,
    AgreementCall,
}

impl AuditKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditKind::AgentSpawned => "agent_spawned",
            AuditKind::AgentSuspended => "agent_suspended",
            AuditKind::AgentResumed => "agent_resumed",
            AuditKind::AgentRecovered => "agent_recovered",
            AuditKind::AgentTerminated => "agent_terminated",
            AuditKind::PluginAttached => "plugin_attached",
            AuditKind::PluginDetached => "plugin_detached",
            AuditKind::OperationExecuted => "operation_executed",
            AuditKind::OperationFailed => "operation_failed",
            AuditKind::SnapshotTaken => "snapshot_taken",
            AuditKind::AgreementCreated => "agreement_created",
            AuditKind::AgreementCall => "agreement_call",
        }
    }
}

/// One audit event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp_ms: i64,
    pub kind: AuditKind,
    pub agent_id: Option<String>,
    pub detail: String,
}

impl AuditEvent {
    pub fn now(kind: AuditKind, agent_id: Option<String>, detail: impl Into<String>) -> Self {
        Self {
            timestamp_ms: Utc::now().timestamp_millis(),
            kind,
            agent_id,
            detail: detail.into(),
        }
    }
}

/// Bounded lock-free audit buffer
pub struct AuditTrail {
    queue: ArrayQueue<AuditEvent>,
    recorded: AtomicU64,
    dropped: AtomicU64,
}

/// Trail statistics
#[derive(Debug, Clone, Copy)]
pub struct TrailStats {
    pub recorded: u64,
    pub dropped: u64,
    pub buffered: usize,
}

impl AuditTrail {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity),
            recorded: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Record an event (non-blocking; dropped and counted when full)
    pub fn record(&self, event: AuditEvent) {
        match self.queue.push(event) {
            Ok(()) => {
                self.recorded.fetch_add(1, Ordering::Relaxed);
            }
            Err(event) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(kind = event.kind.as_str(), "Audit queue full, event dropped");
            }
        }
    }

    /// Drain up to `max` buffered events
    pub fn try_drain(&self, max: usize) -> Vec<AuditEvent> {
        let mut events = Vec::new();
        while events.len() < max {
            match self.queue.pop() {
                Some(event) => events.push(event),
                None => break,
            }
        }
        events
    }

    pub fn stats(&self) -> TrailStats {
        TrailStats {
            recorded: self.recorded.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            buffered: self.queue.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_drain() {
        let trail = AuditTrail::new(8);
        trail.record(AuditEvent::now(AuditKind::AgentSpawned, None, "spawn"));
        trail.record(AuditEvent::now(AuditKind::SnapshotTaken, None, "snap"));

        let events = trail.try_drain(10);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, AuditKind::AgentSpawned);
        assert_eq!(trail.stats().buffered, 0);
    }

    #[test]
    fn test_full_queue_drops() {
        let trail = AuditTrail::new(2);
        for _ in 0..4 {
            trail.record(AuditEvent::now(AuditKind::OperationExecuted, None, "op"));
        }
        let stats = trail.stats();
        assert_eq!(stats.recorded, 2);
        assert_eq!(stats.dropped, 2);
    }

    #[test]
    fn test_drain_respects_max() {
        let trail = AuditTrail::new(8);
        for _ in 0..5 {
            trail.record(AuditEvent::now(AuditKind::AgreementCall, None, "call"));
        }
        assert_eq!(trail.try_drain(3).len(), 3);
        assert_eq!(trail.try_drain(3).len(), 2);
    }
}
