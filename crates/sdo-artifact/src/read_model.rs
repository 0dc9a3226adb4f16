//! Dashboard read model
//!
//! Projected from the audit trail instead of written alongside it, so the
//! view can always be rebuilt and never disagrees with the log.

use crate::audit::{AuditEvent, AuditEventType};
use crate::ids::TaskId;
use crate::task::{FailureCause, Task, TaskState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};

/// Number of activity entries kept
pub const ACTIVITY_CAPACITY: usize = 50;

/// Task fields carried in audit snapshots
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    /// State
    pub state: TaskState,
    /// Retry counter
    pub retry_count: u32,
    /// Forced escalation flag
    pub forced: bool,
    /// Plan rejections so far
    pub plan_revisions: u32,
}

impl TaskSnapshot {
    /// Snapshot a task
    #[must_use]
    pub fn of(task: &Task) -> Self {
        Self {
            state: task.state,
            retry_count: task.retry_count,
            forced: task.forced,
            plan_revisions: task.plan_revisions,
        }
    }

    /// As a JSON value for [`AuditEvent`] snapshots
    #[must_use]
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Per-task row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSummary {
    /// Task
    pub task_id: TaskId,
    /// Last known state
    pub state: TaskState,
    /// Last known retry counter
    pub retry_count: u32,
    /// Escalated by the retry limit
    pub forced: bool,
    /// Latest failure or escalation cause
    pub cause: Option<FailureCause>,
    /// Generation tokens spent
    pub tokens: u64,
    /// Last event time
    pub updated_at: DateTime<Utc>,
}

/// Recent activity line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityEntry {
    /// Event time
    pub timestamp: DateTime<Utc>,
    /// Task
    pub task_id: TaskId,
    /// Event kind
    pub event_type: AuditEventType,
    /// Actor
    pub actor: String,
    /// One-line description
    pub summary: String,
}

/// Materialized dashboard
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DashboardView {
    tasks: BTreeMap<TaskId, TaskSummary>,
    activity: VecDeque<ActivityEntry>,
    events_applied: u64,
}

impl DashboardView {
    /// Build from a full event list
    #[must_use]
    pub fn project(events: &[AuditEvent]) -> Self {
        let mut view = Self::default();
        for e in events {
            view.apply(e);
        }
        view
    }

    /// Fold one event into the view
    pub fn apply(&mut self, event: &AuditEvent) {
        self.events_applied += 1;
        let row = self.tasks.entry(event.task_id).or_insert_with(|| TaskSummary {
            task_id: event.task_id,
            state: TaskState::Pending,
            retry_count: 0,
            forced: false,
            cause: None,
            tokens: 0,
            updated_at: event.timestamp,
        });
        row.updated_at = event.timestamp;

        if let Some(snapshot) = event
            .after
            .as_ref()
            .and_then(|v| serde_json::from_value::<TaskSnapshot>(v.clone()).ok())
        {
            row.state = snapshot.state;
            row.retry_count = row.retry_count.max(snapshot.retry_count);
            row.forced = snapshot.forced;
        } else if let Some(to) = event.to_state {
            row.state = to;
        }
        if let Some(cause) = &event.cause {
            row.cause = Some(cause.clone());
        }
        if event.event_type == AuditEventType::TokenUsage {
            let tokens = event
                .after
                .as_ref()
                .and_then(|v| v.get("total_tokens"))
                .and_then(Value::as_u64)
                .unwrap_or(0);
            row.tokens += tokens;
        }

        self.activity.push_back(ActivityEntry {
            timestamp: event.timestamp,
            task_id: event.task_id,
            event_type: event.event_type,
            actor: event.actor.clone(),
            summary: describe(event),
        });
        while self.activity.len() > ACTIVITY_CAPACITY {
            self.activity.pop_front();
        }
    }

    /// Row for one task
    #[must_use]
    pub fn task(&self, id: TaskId) -> Option<&TaskSummary> {
        self.tasks.get(&id)
    }

    /// All rows
    pub fn tasks(&self) -> impl Iterator<Item = &TaskSummary> {
        self.tasks.values()
    }

    /// Recent activity, oldest first
    pub fn activity(&self) -> impl Iterator<Item = &ActivityEntry> {
        self.activity.iter()
    }

    /// Tasks per state
    #[must_use]
    pub fn state_counts(&self) -> BTreeMap<TaskState, usize> {
        let mut counts = BTreeMap::new();
        for row in self.tasks.values() {
            *counts.entry(row.state).or_insert(0) += 1;
        }
        counts
    }

    /// Tasks in a state
    #[must_use]
    pub fn count(&self, state: TaskState) -> usize {
        self.tasks.values().filter(|r| r.state == state).count()
    }

    /// Completed share of terminal tasks; `None` before anything finishes
    #[must_use]
    pub fn success_rate(&self) -> Option<f64> {
        let terminal = self.tasks.values().filter(|r| r.state.is_terminal()).count();
        if terminal == 0 {
            return None;
        }
        #[allow(clippy::cast_precision_loss)]
        let rate = self.count(TaskState::Completed) as f64 / terminal as f64;
        Some(rate)
    }

    /// Total generation tokens across tasks
    #[must_use]
    pub fn total_tokens(&self) -> u64 {
        self.tasks.values().map(|r| r.tokens).sum()
    }

    /// Events folded so far
    #[must_use]
    pub fn events_applied(&self) -> u64 {
        self.events_applied
    }
}

fn describe(event: &AuditEvent) -> String {
    match (event.event_type, event.from_state, event.to_state) {
        (AuditEventType::Transition, Some(from), Some(to)) => format!("{from} -> {to}"),
        (_, _, _) => match &event.detail {
            Some(detail) => format!("{}: {detail}", event.event_type.as_str()),
            None => event.event_type.as_str().to_string(),
        },
    }
}
