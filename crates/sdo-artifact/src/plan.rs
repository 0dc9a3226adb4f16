//! Plan records

use crate::ids::{CandidateId, PlanId, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximal candidate total score
pub const MAX_CANDIDATE_SCORE: f64 = 10.0;

/// Decomposition method chosen by complexity classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanningMethod {
    /// Short linear list, no scoring pass
    Chain,
    /// Many candidates, scored, then merged
    Graph,
}

impl PlanningMethod {
    /// Stable name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Chain => "chain",
            Self::Graph => "graph",
        }
    }
}

impl fmt::Display for PlanningMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-dimension rubric scores for one candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RubricScores {
    /// 0..=3
    pub relevance: u8,
    /// 0..=3
    pub completeness: u8,
    /// 0..=2
    pub feasibility: u8,
    /// 0..=2
    pub impact: u8,
}

impl RubricScores {
    /// Upper bound per dimension, in field order
    pub const BOUNDS: [(&'static str, u8); 4] = [
        ("relevance", 3),
        ("completeness", 3),
        ("feasibility", 2),
        ("impact", 2),
    ];

    /// Validate every dimension against its bound
    pub fn validate(&self) -> Result<(), String> {
        let values = [self.relevance, self.completeness, self.feasibility, self.impact];
        for ((name, max), value) in Self::BOUNDS.iter().zip(values) {
            if value > *max {
                return Err(format!("{name} score {value} exceeds maximum {max}"));
            }
        }
        Ok(())
    }

    /// Sum of dimensions, 0..=10
    #[inline]
    #[must_use]
    pub fn total(&self) -> u8 {
        self.relevance + self.completeness + self.feasibility + self.impact
    }
}

/// One generated candidate subtask
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateSubtask {
    /// Candidate id, unique within the planning round
    pub id: CandidateId,
    /// What the subtask does
    pub description: String,
    /// Rubric scores; `None` for chain candidates, which are pre-scored
    pub scores: Option<RubricScores>,
    /// Total score, 0..=10
    pub total_score: f64,
    /// Why the score was given
    pub reasoning: String,
    /// Requirements this candidate addresses
    pub requirements_covered: Vec<String>,
}

/// One consolidated unit of the plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedSubtask {
    /// Position in the plan, 1-based
    pub id: u32,
    /// Consolidated description
    pub description: String,
    /// Candidates folded into this subtask
    pub covered_candidate_ids: Vec<CandidateId>,
    /// Why these candidates belong together
    pub reasoning: String,
    /// Justification for sharing a candidate with another subtask
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duplicate_justification: Option<String>,
    /// Mean total score of the covered candidates
    pub score: f64,
}

/// An immutable plan revision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    /// Plan id
    pub id: PlanId,
    /// Owning task
    pub task_id: TaskId,
    /// 1 for the first plan, incremented on every rejection
    pub revision: u32,
    /// Method used
    pub method: PlanningMethod,
    /// Consolidated subtasks, ordered
    pub merged_subtasks: Vec<MergedSubtask>,
    /// Every candidate generated this round, kept for audit
    pub candidates: Vec<CandidateSubtask>,
    /// Mean of merged subtask scores
    pub aggregate_score: f64,
    /// Aggregate fell below the confidence threshold
    pub low_confidence: bool,
    /// Human feedback that shaped this revision
    pub feedback_applied: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

impl Plan {
    /// Ids of every candidate generated this round
    pub fn candidate_ids(&self) -> impl Iterator<Item = &CandidateId> {
        self.candidates.iter().map(|c| &c.id)
    }

    /// Render the subtasks as a numbered list for development templates
    #[must_use]
    pub fn render_steps(&self) -> String {
        self.merged_subtasks
            .iter()
            .map(|s| format!("{}. {}", s.id, s.description))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Arithmetic mean, zero for an empty slice
#[must_use]
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    #[allow(clippy::cast_precision_loss)]
    let n = values.len() as f64;
    values.iter().sum::<f64>() / n
}
