//! Append-only audit trail
//!
//! Every event carries the hash of its predecessor, so any in-place edit or
//! deletion breaks the chain and is caught by [`AuditLog::verify_integrity`].

use crate::ids::{EventId, TaskId};
use crate::store::StoreError;
use crate::task::{FailureCause, TaskState};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Hash of the (virtual) event preceding the first one
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Kind of audit event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    /// Task ingested
    TaskCreated,
    /// State transition applied
    Transition,
    /// Plan persisted
    PlanRecorded,
    /// Change set persisted
    ChangeSetRecorded,
    /// Review report persisted
    ReviewRecorded,
    /// Retry counter advanced
    RetryRecorded,
    /// Human gate opened
    GateOpened,
    /// Human gate resolved
    GateResolved,
    /// A stage finished after the task moved on
    StaleResultDiscarded,
    /// Change delivered to the change host
    Delivered,
    /// Generation token usage for a stage
    TokenUsage,
}

impl AuditEventType {
    /// Stable name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TaskCreated => "task_created",
            Self::Transition => "transition",
            Self::PlanRecorded => "plan_recorded",
            Self::ChangeSetRecorded => "changeset_recorded",
            Self::ReviewRecorded => "review_recorded",
            Self::RetryRecorded => "retry_recorded",
            Self::GateOpened => "gate_opened",
            Self::GateResolved => "gate_resolved",
            Self::StaleResultDiscarded => "stale_result_discarded",
            Self::Delivered => "delivered",
            Self::TokenUsage => "token_usage",
        }
    }
}

/// Immutable audit log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Event id
    pub id: EventId,
    /// Subject task
    pub task_id: TaskId,
    /// Kind
    pub event_type: AuditEventType,
    /// Component or person responsible
    pub actor: String,
    /// State before a transition
    pub from_state: Option<TaskState>,
    /// State after a transition
    pub to_state: Option<TaskState>,
    /// Snapshot before
    pub before: Option<Value>,
    /// Snapshot after
    pub after: Option<Value>,
    /// Cause for failures and escalations
    pub cause: Option<FailureCause>,
    /// Free-form detail
    pub detail: Option<String>,
    /// Creation time
    pub timestamp: DateTime<Utc>,
    /// Hash of the previous event in the log
    pub prev_hash: String,
    /// Hash of this event
    pub hash: String,
}

impl AuditEvent {
    /// Start a new event; hashes are filled in on append
    pub fn new(task_id: TaskId, event_type: AuditEventType, actor: impl Into<String>) -> Self {
        Self {
            id: EventId::new(),
            task_id,
            event_type,
            actor: actor.into(),
            from_state: None,
            to_state: None,
            before: None,
            after: None,
            cause: None,
            detail: None,
            timestamp: Utc::now(),
            prev_hash: String::new(),
            hash: String::new(),
        }
    }

    /// Record a transition
    #[must_use]
    pub fn with_transition(mut self, from: TaskState, to: TaskState) -> Self {
        self.from_state = Some(from);
        self.to_state = Some(to);
        self
    }

    /// Attach before/after snapshots
    #[must_use]
    pub fn with_snapshots(mut self, before: Option<Value>, after: Option<Value>) -> Self {
        self.before = before;
        self.after = after;
        self
    }

    /// Attach a cause
    #[must_use]
    pub fn with_cause(mut self, cause: FailureCause) -> Self {
        self.cause = Some(cause);
        self
    }

    /// Attach detail text
    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Hash-chained, append-only event list
#[derive(Debug, Default)]
pub struct AuditLog {
    inner: Mutex<Vec<AuditEvent>>,
}

impl AuditLog {
    /// Empty log
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Chain and append an event, returning the stored copy
    pub fn append(&self, mut event: AuditEvent) -> AuditEvent {
        let mut guard = self.inner.lock();
        event.prev_hash = guard
            .last()
            .map_or_else(|| GENESIS_HASH.to_string(), |e| e.hash.clone());
        event.hash = compute_hash(&event);
        guard.push(event.clone());
        event
    }

    /// Snapshot of every event
    pub fn events(&self) -> Vec<AuditEvent> {
        self.inner.lock().clone()
    }

    /// Events for one task, in append order
    pub fn for_task(&self, task_id: TaskId) -> Vec<AuditEvent> {
        self.inner
            .lock()
            .iter()
            .filter(|e| e.task_id == task_id)
            .cloned()
            .collect()
    }

    /// Events at or after a point in time
    pub fn since(&self, since: DateTime<Utc>) -> Vec<AuditEvent> {
        self.inner
            .lock()
            .iter()
            .filter(|e| e.timestamp >= since)
            .cloned()
            .collect()
    }

    /// Number of events
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Whether the log is empty
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Walk the chain and recompute every hash
    pub fn verify_integrity(&self) -> Result<(), StoreError> {
        verify_chain(&self.inner.lock())
    }

    #[cfg(test)]
    pub(crate) fn tamper(&self, index: usize, detail: &str) {
        if let Some(e) = self.inner.lock().get_mut(index) {
            e.detail = Some(detail.to_string());
        }
    }
}

/// Verify a slice of events forms an unbroken chain from genesis
pub fn verify_chain(events: &[AuditEvent]) -> Result<(), StoreError> {
    let mut prev = GENESIS_HASH.to_string();
    for (index, e) in events.iter().enumerate() {
        if e.prev_hash != prev || e.hash != compute_hash(e) {
            return Err(StoreError::IntegrityViolation { index });
        }
        prev.clone_from(&e.hash);
    }
    Ok(())
}

fn compute_hash(event: &AuditEvent) -> String {
    let mut hasher = Sha256::new();
    hasher.update(event.id.0.to_string().as_bytes());
    hasher.update(event.task_id.0.to_string().as_bytes());
    hasher.update(event.event_type.as_str().as_bytes());
    hasher.update([0]);
    hasher.update(event.actor.as_bytes());
    hasher.update([0]);
    for state in [event.from_state, event.to_state] {
        hasher.update(state.map_or("", TaskState::as_str).as_bytes());
        hasher.update([0]);
    }
    for snapshot in [&event.before, &event.after] {
        if let Some(v) = snapshot {
            hasher.update(v.to_string().as_bytes());
        }
        hasher.update([0]);
    }
    if let Some(cause) = &event.cause {
        hasher.update(cause.to_string().as_bytes());
    }
    hasher.update([0]);
    if let Some(detail) = &event.detail {
        hasher.update(detail.as_bytes());
    }
    hasher.update([0]);
    hasher.update(event.timestamp.to_rfc3339().as_bytes());
    hasher.update(event.prev_hash.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_links_events() {
        let log = AuditLog::new();
        let task = TaskId::new();
        let first = log.append(AuditEvent::new(task, AuditEventType::TaskCreated, "orchestrator"));
        let second = log.append(
            AuditEvent::new(task, AuditEventType::Transition, "orchestrator")
                .with_transition(TaskState::Pending, TaskState::Planning),
        );
        assert_eq!(first.prev_hash, GENESIS_HASH);
        assert_eq!(second.prev_hash, first.hash);
        assert!(log.verify_integrity().is_ok());
    }

    #[test]
    fn tampering_is_detected() {
        let log = AuditLog::new();
        let task = TaskId::new();
        for _ in 0..3 {
            log.append(AuditEvent::new(task, AuditEventType::RetryRecorded, "dev-loop"));
        }
        log.tamper(1, "rewritten");
        match log.verify_integrity() {
            Err(StoreError::IntegrityViolation { index }) => assert_eq!(index, 1),
            other => panic!("expected integrity violation, got {other:?}"),
        }
    }

    #[test]
    fn for_task_filters() {
        let log = AuditLog::new();
        let a = TaskId::new();
        let b = TaskId::new();
        log.append(AuditEvent::new(a, AuditEventType::TaskCreated, "o"));
        log.append(AuditEvent::new(b, AuditEventType::TaskCreated, "o"));
        log.append(AuditEvent::new(a, AuditEventType::PlanRecorded, "planner"));
        assert_eq!(log.for_task(a).len(), 2);
        assert_eq!(log.len(), 3);
    }
}
