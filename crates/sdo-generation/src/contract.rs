//! Typed output contracts
//!
//! Every template's output is decoded into one of these types and range
//! checked before any engine code sees it.

use crate::repair::extract_json;
use crate::service::Payload;
use sdo_artifact::{PlanningMethod, RubricScores};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Output shape for a template
pub trait Contract: DeserializeOwned + Send {
    /// Semantic checks beyond deserialization
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

/// Decode and validate a payload
pub fn decode<C: Contract>(payload: &Payload) -> Result<C, String> {
    let value = match payload {
        Payload::Json(v) => v.clone(),
        Payload::Text(text) => {
            extract_json(text).ok_or_else(|| "no JSON object found in output".to_string())?
        }
    };
    let parsed: C = serde_json::from_value(value).map_err(|e| e.to_string())?;
    parsed.validate()?;
    Ok(parsed)
}

fn require_text(field: &str, value: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        Err(format!("{field} must not be empty"))
    } else {
        Ok(())
    }
}

/// Complexity classification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplexityDecision {
    /// `chain`, `graph`, or anything else (treated as a tie)
    pub method: String,
    /// Why
    #[serde(default)]
    pub reasoning: String,
}

impl ComplexityDecision {
    /// Only an explicit `chain` selects the chain method
    #[must_use]
    pub fn planning_method(&self) -> PlanningMethod {
        if self.method.trim().eq_ignore_ascii_case("chain") {
            PlanningMethod::Chain
        } else {
            PlanningMethod::Graph
        }
    }
}

impl Contract for ComplexityDecision {}

/// Unscored candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateDraft {
    /// Candidate id
    pub id: String,
    /// What the subtask does
    pub description: String,
    /// Requirements addressed
    #[serde(default)]
    pub requirements_covered: Vec<String>,
}

/// Candidate generation output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateBatch {
    /// Candidates in generation order
    pub candidates: Vec<CandidateDraft>,
}

impl Contract for CandidateBatch {
    fn validate(&self) -> Result<(), String> {
        if self.candidates.is_empty() {
            return Err("candidate list is empty".to_string());
        }
        let mut seen = HashSet::new();
        for c in &self.candidates {
            require_text("candidate id", &c.id)?;
            require_text("candidate description", &c.description)?;
            if !seen.insert(c.id.trim()) {
                return Err(format!("duplicate candidate id '{}'", c.id));
            }
        }
        Ok(())
    }
}

/// Rubric score for one candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateScore {
    /// 0..=3
    pub relevance: u8,
    /// 0..=3
    pub completeness: u8,
    /// 0..=2
    pub feasibility: u8,
    /// 0..=2
    pub impact: u8,
    /// Mandatory reasoning
    pub reasoning: String,
    /// Mandatory covered requirements
    pub requirements_covered: Vec<String>,
}

impl CandidateScore {
    /// Rubric view
    #[must_use]
    pub fn rubric(&self) -> RubricScores {
        RubricScores {
            relevance: self.relevance,
            completeness: self.completeness,
            feasibility: self.feasibility,
            impact: self.impact,
        }
    }
}

impl Contract for CandidateScore {
    fn validate(&self) -> Result<(), String> {
        self.rubric().validate()?;
        require_text("reasoning", &self.reasoning)?;
        if self.requirements_covered.is_empty() {
            return Err("requirements_covered must list at least one requirement".to_string());
        }
        Ok(())
    }
}

/// One proposed merged subtask
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeDraft {
    /// Consolidated description
    pub description: String,
    /// Candidate ids folded in
    pub merged_from: Vec<String>,
    /// Why these belong together
    #[serde(default)]
    pub reasoning: String,
    /// Why a candidate is shared with another group
    #[serde(default)]
    pub duplicate_justification: Option<String>,
}

/// Merge output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeProposal {
    /// Proposed groups
    pub merged_subtasks: Vec<MergeDraft>,
}

impl Contract for MergeProposal {
    fn validate(&self) -> Result<(), String> {
        if self.merged_subtasks.is_empty() {
            return Err("merged_subtasks is empty".to_string());
        }
        for (i, m) in self.merged_subtasks.iter().enumerate() {
            require_text("merged subtask description", &m.description)?;
            if m.merged_from.is_empty() {
                return Err(format!("merged subtask {} covers no candidates", i + 1));
            }
        }
        Ok(())
    }
}

/// One review dimension evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionEvaluation {
    /// 0..=100
    pub score: f64,
    /// Disqualifying issue
    #[serde(default)]
    pub critical: bool,
    /// Itemized mistakes
    #[serde(default)]
    pub mistakes: Vec<String>,
    /// Reasoning
    #[serde(default)]
    pub reasoning: String,
}

impl Contract for DimensionEvaluation {
    fn validate(&self) -> Result<(), String> {
        if !self.score.is_finite() || !(0.0..=100.0).contains(&self.score) {
            return Err(format!("score {} outside 0..=100", self.score));
        }
        Ok(())
    }
}

/// Development attempt output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeProposal {
    /// Where the produced change lives
    pub artifact_ref: String,
    /// What changed
    #[serde(default)]
    pub summary: String,
}

impl Contract for ChangeProposal {
    fn validate(&self) -> Result<(), String> {
        require_text("artifact_ref", &self.artifact_ref)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ambiguous_classification_defaults_to_graph() {
        for method in ["graph", "tie", "", "both", "CHAIN?"] {
            let d = ComplexityDecision {
                method: method.to_string(),
                reasoning: String::new(),
            };
            assert_eq!(d.planning_method(), PlanningMethod::Graph, "{method}");
        }
        let chain = ComplexityDecision {
            method: " Chain ".to_string(),
            reasoning: String::new(),
        };
        assert_eq!(chain.planning_method(), PlanningMethod::Chain);
    }

    #[test]
    fn duplicate_candidate_ids_are_rejected() {
        let payload = Payload::Json(json!({
            "candidates": [
                {"id": "1", "description": "a"},
                {"id": "1", "description": "b"}
            ]
        }));
        let err = decode::<CandidateBatch>(&payload).unwrap_err();
        assert!(err.contains("duplicate"));
    }

    #[test]
    fn score_requires_reasoning_and_requirements() {
        let missing = Payload::Json(json!({
            "relevance": 3, "completeness": 2, "feasibility": 2, "impact": 1,
            "reasoning": "", "requirements_covered": ["R1"]
        }));
        assert!(decode::<CandidateScore>(&missing).is_err());

        let absent = Payload::Json(json!({
            "relevance": 3, "completeness": 2, "feasibility": 2, "impact": 1,
            "reasoning": "fits"
        }));
        assert!(decode::<CandidateScore>(&absent).is_err());
    }

    #[test]
    fn score_out_of_rubric_range_is_rejected() {
        let payload = Payload::Json(json!({
            "relevance": 4, "completeness": 2, "feasibility": 2, "impact": 1,
            "reasoning": "fits", "requirements_covered": ["R1"]
        }));
        let err = decode::<CandidateScore>(&payload).unwrap_err();
        assert!(err.contains("relevance"));
    }

    #[test]
    fn review_score_bounds() {
        let over = Payload::Json(json!({"score": 140}));
        assert!(decode::<DimensionEvaluation>(&over).is_err());
        let ok = Payload::Text("```json\n{\"score\": 88.5, \"critical\": true}\n```".to_string());
        let eval = decode::<DimensionEvaluation>(&ok).unwrap();
        assert!(eval.critical);
        assert!((eval.score - 88.5).abs() < f64::EPSILON);
    }
}
