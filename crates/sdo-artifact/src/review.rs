//! Change sets, review reports and approval records

use crate::ids::{ChangeSetId, ReviewId, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One development attempt's output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    /// Change set id
    pub id: ChangeSetId,
    /// Owning task
    pub task_id: TaskId,
    /// 1-based attempt number
    pub attempt_number: u32,
    /// Reference to the produced artifact (patch, branch, blob key)
    pub artifact_ref: String,
    /// Short description of what changed
    pub summary: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

impl ChangeSet {
    /// Create a change set for an attempt
    pub fn new(
        task_id: TaskId,
        attempt_number: u32,
        artifact_ref: impl Into<String>,
        summary: impl Into<String>,
    ) -> Self {
        Self {
            id: ChangeSetId::new(),
            task_id,
            attempt_number,
            artifact_ref: artifact_ref.into(),
            summary: summary.into(),
            created_at: Utc::now(),
        }
    }
}

/// Review quality dimension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewDimension {
    /// Does the change implement the plan
    Completeness,
    /// Vulnerabilities and unsafe patterns
    Security,
    /// Style and conventions
    Standards,
}

impl ReviewDimension {
    /// All dimensions in report order
    pub const ALL: [ReviewDimension; 3] = [Self::Completeness, Self::Security, Self::Standards];

    /// Stable name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completeness => "completeness",
            Self::Security => "security",
            Self::Standards => "standards",
        }
    }

    /// Whether static analysis feeds this dimension
    #[inline]
    #[must_use]
    pub fn uses_static_analysis(self) -> bool {
        matches!(self, Self::Security | Self::Standards)
    }
}

impl fmt::Display for ReviewDimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Static analysis contribution to a dimension
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "score")]
pub enum AnalysisStatus {
    /// No connector configured, or dimension does not use it
    NotApplicable,
    /// Result arrived in time
    Available(f64),
    /// Bounded wait expired
    Unknown,
}

/// Result for one review dimension
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionResult {
    /// Which dimension
    pub dimension: ReviewDimension,
    /// Final dimension score, 0..=100
    pub score: f64,
    /// Raw evaluation score before analysis blending
    pub evaluation_score: f64,
    /// Disqualifying issue found
    pub critical: bool,
    /// Itemized problems
    pub mistakes: Vec<String>,
    /// Evaluator reasoning
    pub reasoning: String,
    /// Static analysis contribution
    pub analysis: AnalysisStatus,
}

/// Review of one change set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewReport {
    /// Report id
    pub id: ReviewId,
    /// Owning task
    pub task_id: TaskId,
    /// Reviewed change set
    pub changeset_id: ChangeSetId,
    /// Per-dimension results, in [`ReviewDimension::ALL`] order
    pub dimensions: Vec<DimensionResult>,
    /// Weighted combination of dimension scores
    pub aggregate_score: f64,
    /// Threshold in force when reviewed
    pub threshold: f64,
    /// `aggregate >= threshold` and nothing critical
    pub passed: bool,
    /// Mistakes across dimensions, prefixed with the dimension name
    pub mistakes: Vec<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

impl ReviewReport {
    /// Score of one dimension
    #[must_use]
    pub fn score(&self, dimension: ReviewDimension) -> Option<f64> {
        self.dimensions
            .iter()
            .find(|d| d.dimension == dimension)
            .map(|d| d.score)
    }

    /// Whether any dimension raised a critical flag
    #[must_use]
    pub fn has_critical(&self) -> bool {
        self.dimensions.iter().any(|d| d.critical)
    }
}

/// Human checkpoint name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateName {
    /// After planning
    PlanApproval,
    /// Before delivery
    FinalApproval,
}

impl GateName {
    /// Stable name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PlanApproval => "plan_approval",
            Self::FinalApproval => "final_approval",
        }
    }
}

impl fmt::Display for GateName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Gate decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// Continue forward
    Approve,
    /// Send back with feedback
    Reject,
    /// Nobody answered in time
    Timeout,
}

impl Decision {
    /// Stable name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::Reject => "reject",
            Self::Timeout => "timeout",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Recorded gate resolution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRecord {
    /// Gate
    pub gate: GateName,
    /// Opening round of the gate for this task
    pub round: u32,
    /// Task
    pub task_id: TaskId,
    /// Decision
    pub decision: Decision,
    /// Optional free-text feedback
    pub feedback: Option<String>,
    /// Who decided (`system` for timeouts)
    pub decided_by: String,
    /// When
    pub decided_at: DateTime<Utc>,
}
