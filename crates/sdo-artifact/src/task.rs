//! Task record and lifecycle state

use crate::ids::{ChangeSetId, PlanId, SourceRef, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Ingested, not yet started
    Pending,
    /// Planning engine running
    Planning,
    /// Suspended on the plan approval gate
    AwaitingPlanApproval,
    /// First development attempt running
    Developing,
    /// Review aggregator running over the latest change set
    Reviewing,
    /// Development attempt with review feedback
    RetryDeveloping,
    /// Suspended on the final approval gate
    AwaitingFinalApproval,
    /// Delivering the change to the change host
    Finalizing,
    /// Terminal: delivered
    Completed,
    /// Terminal: unrecoverable error
    Failed,
    /// Terminal: cancelled by request
    Abandoned,
}

impl TaskState {
    /// Every state, in lifecycle order
    pub const ALL: [TaskState; 11] = [
        TaskState::Pending,
        TaskState::Planning,
        TaskState::AwaitingPlanApproval,
        TaskState::Developing,
        TaskState::Reviewing,
        TaskState::RetryDeveloping,
        TaskState::AwaitingFinalApproval,
        TaskState::Finalizing,
        TaskState::Completed,
        TaskState::Failed,
        TaskState::Abandoned,
    ];

    /// Terminal states admit no further transitions
    #[inline]
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Abandoned)
    }

    /// States parked on a human gate
    #[inline]
    #[must_use]
    pub fn is_suspended(self) -> bool {
        matches!(self, Self::AwaitingPlanApproval | Self::AwaitingFinalApproval)
    }

    /// Stable snake_case name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Planning => "planning",
            Self::AwaitingPlanApproval => "awaiting_plan_approval",
            Self::Developing => "developing",
            Self::Reviewing => "reviewing",
            Self::RetryDeveloping => "retry_developing",
            Self::AwaitingFinalApproval => "awaiting_final_approval",
            Self::Finalizing => "finalizing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Abandoned => "abandoned",
        }
    }

    /// Parse a snake_case name
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_str() == name)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Work item content fetched from the issue source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// One-line summary
    pub summary: String,
    /// Free-form description, may be empty
    #[serde(default)]
    pub description: String,
}

impl TaskSpec {
    /// Create a spec
    pub fn new(summary: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            description: description.into(),
        }
    }

    /// Whether the description carries any content
    #[inline]
    #[must_use]
    pub fn has_description(&self) -> bool {
        !self.description.trim().is_empty()
    }
}

/// Stable machine-readable failure cause
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CauseCode {
    /// AI output failed structural validation after repair
    SchemaValidation,
    /// Plan merge violated coverage after correction
    CoverageViolation,
    /// Generation provider kept failing
    ProviderUnavailable,
    /// Artifact store unavailable
    Persistence,
    /// Change host rejected the delivery
    ChangeDelivery,
    /// Plan rejected too many times
    PlanRejected,
    /// Final change rejected with no retry budget left
    FinalRejected,
    /// Review kept failing; escalated to the final gate
    RebuildLimitExceeded,
    /// Gate timed out under the fail policy
    GateTimeout,
    /// Abandoned on request
    Abandoned,
    /// Anything else
    Internal,
}

impl CauseCode {
    /// Stable snake_case name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SchemaValidation => "schema_validation",
            Self::CoverageViolation => "coverage_violation",
            Self::ProviderUnavailable => "provider_unavailable",
            Self::Persistence => "persistence",
            Self::ChangeDelivery => "change_delivery",
            Self::PlanRejected => "plan_rejected",
            Self::FinalRejected => "final_rejected",
            Self::RebuildLimitExceeded => "rebuild_limit_exceeded",
            Self::GateTimeout => "gate_timeout",
            Self::Abandoned => "abandoned",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for CauseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Human-readable reason a task stopped or escalated
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureCause {
    /// Machine-readable code
    pub code: CauseCode,
    /// Explanation shown to humans
    pub message: String,
}

impl FailureCause {
    /// Create a cause
    pub fn new(code: CauseCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Where a piece of feedback came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackOrigin {
    /// Human rejected the plan
    PlanGate,
    /// Review aggregator listed mistakes
    Review,
    /// Human rejected the final change
    FinalGate,
}

/// Structured feedback injected into the next planning or development call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feedback {
    /// Origin of the feedback
    pub origin: FeedbackOrigin,
    /// Itemized points, possibly empty (timeouts carry none)
    pub items: Vec<String>,
}

impl Feedback {
    /// Feedback from a single free-text note
    pub fn from_text(origin: FeedbackOrigin, text: &str) -> Self {
        let items = text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(ToString::to_string)
            .collect();
        Self { origin, items }
    }

    /// Render as a bullet list for template variables
    #[must_use]
    pub fn render(&self) -> String {
        self.items
            .iter()
            .map(|i| format!("- {i}"))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Whether there is nothing to act on
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Outcome of delivering a change to the change host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    /// Branch that received the commit
    pub branch: String,
    /// Commit reference
    pub commit: String,
    /// Link to the opened change request
    pub change_request_url: String,
    /// When delivery finished
    pub delivered_at: DateTime<Utc>,
}

/// A unit of work flowing through the pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Task identifier
    pub id: TaskId,
    /// Originating work item
    pub source_ref: SourceRef,
    /// Work item content
    pub spec: TaskSpec,
    /// Lifecycle state, written only by the orchestrator
    pub state: TaskState,
    /// Failed review count, never decreases
    pub retry_count: u32,
    /// Current plan
    pub plan_id: Option<PlanId>,
    /// Every change set produced, oldest first
    pub changeset_ids: Vec<ChangeSetId>,
    /// How many times the plan gate sent the task back
    pub plan_revisions: u32,
    /// Set when the retry limit escalated the task to the final gate
    pub forced: bool,
    /// Feedback waiting for the next planning or development call
    pub pending_feedback: Option<Feedback>,
    /// Why the task failed or escalated
    pub cause: Option<FailureCause>,
    /// Delivery details once completed
    pub delivery: Option<DeliveryRecord>,
    /// Optimistic concurrency version, bumped by the store on every write
    pub version: u64,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last write time
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// New pending task
    #[must_use]
    pub fn new(source_ref: SourceRef, spec: TaskSpec) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new(),
            source_ref,
            spec,
            state: TaskState::Pending,
            retry_count: 0,
            plan_id: None,
            changeset_ids: Vec::new(),
            plan_revisions: 0,
            forced: false,
            pending_feedback: None,
            cause: None,
            delivery: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Most recent change set, if any
    #[inline]
    #[must_use]
    pub fn latest_changeset(&self) -> Option<ChangeSetId> {
        self.changeset_ids.last().copied()
    }

    /// Attempt number of the next development call
    #[inline]
    #[must_use]
    pub fn next_attempt(&self) -> u32 {
        u32::try_from(self.changeset_ids.len()).map_or(u32::MAX, |n| n.saturating_add(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_and_suspended_states() {
        assert!(TaskState::Completed.is_terminal());
        assert!(TaskState::Abandoned.is_terminal());
        assert!(!TaskState::Reviewing.is_terminal());
        assert!(TaskState::AwaitingPlanApproval.is_suspended());
        assert!(!TaskState::Planning.is_suspended());
    }

    #[test]
    fn state_names_round_trip() {
        for state in TaskState::ALL {
            assert_eq!(TaskState::parse(state.as_str()), Some(state));
        }
        assert_eq!(TaskState::parse("nope"), None);
    }

    #[test]
    fn feedback_from_text_itemizes_lines() {
        let fb = Feedback::from_text(FeedbackOrigin::PlanGate, "missing requirement X\n\n  add tests ");
        assert_eq!(fb.items, vec!["missing requirement X", "add tests"]);
        assert_eq!(fb.render(), "- missing requirement X\n- add tests");
        assert!(Feedback::from_text(FeedbackOrigin::FinalGate, "  ").is_empty());
    }

    #[test]
    fn new_task_starts_pending() {
        let task = Task::new(SourceRef::new("PROJ-1"), TaskSpec::new("Add login", ""));
        assert_eq!(task.state, TaskState::Pending);
        assert_eq!(task.next_attempt(), 1);
        assert!(!task.spec.has_description());
    }
}
