//! Planning errors

use crate::coverage::CoverageReport;
use sdo_artifact::CauseCode;
use sdo_generation::{GenerationError, Template};

/// Errors raised while producing a plan
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PlanningError {
    /// Generation call failed (after the client's own retry and repair)
    #[error("generation failed: {0}")]
    Generation(#[from] GenerationError),

    /// Output decoded but violated a planning rule (e.g. wrong candidate count)
    #[error("invalid {template} output: {detail}")]
    SchemaValidation {
        /// Template whose output was rejected
        template: Template,
        /// What was wrong
        detail: String,
    },

    /// Merge still broke coverage after the correction pass
    #[error("plan merge violated coverage: {0}")]
    CoverageViolation(CoverageReport),

    /// Too few distinct candidates to fill the plan
    #[error("insufficient candidates: {available} distinct, {required} required")]
    InsufficientCandidates {
        /// Distinct candidates available
        available: usize,
        /// Merged subtasks required
        required: usize,
    },
}

impl PlanningError {
    /// Stable cause code for task failure
    #[must_use]
    pub fn cause_code(&self) -> CauseCode {
        match self {
            Self::Generation(e) if e.is_schema() => CauseCode::SchemaValidation,
            Self::Generation(GenerationError::Rejected(_)) => CauseCode::Internal,
            Self::Generation(_) => CauseCode::ProviderUnavailable,
            Self::SchemaValidation { .. } | Self::InsufficientCandidates { .. } => {
                CauseCode::SchemaValidation
            }
            Self::CoverageViolation(_) => CauseCode::CoverageViolation,
        }
    }

    /// Whether calling again could succeed
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Generation(e) if e.is_transient())
    }
}
