//! Error types for SDO Core
//!
//! Every failure reaching the orchestrator is a [`WorkflowError`]. The
//! orchestrator maps it to a [`CauseCode`] when it marks a task `Failed`.

use sdo_artifact::{CauseCode, Decision, StoreError, TaskId, TaskState};
use sdo_generation::GenerationError;
use sdo_kernel::{GateError, PoolError, TransitionError};
use sdo_planning::PlanningError;
use std::path::PathBuf;

/// Main workflow error type
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    /// Non-retryable store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Store stayed unavailable through every retry
    #[error("persistence failed during {operation} after {attempts} attempts: {last}")]
    Persistence {
        /// What was being written or read
        operation: &'static str,
        /// Attempts made
        attempts: u32,
        /// Last store error
        last: String,
    },

    /// Generation failed after retry and repair
    #[error("generation failed: {0}")]
    Generation(#[from] GenerationError),

    /// Planning failed
    #[error("planning failed: {0}")]
    Planning(#[from] PlanningError),

    /// State machine refused a transition
    #[error(transparent)]
    Transition(#[from] TransitionError),

    /// Gate error
    #[error("gate error: {0}")]
    Gate(#[from] GateError),

    /// Worker pool refused the run
    #[error("worker pool: {0}")]
    Pool(#[from] PoolError),

    /// External connector error
    #[error("connector error: {0}")]
    Connector(#[from] ConnectorError),

    /// Change host rejected the delivery
    #[error("change delivery failed: {0}")]
    ChangeDelivery(String),

    /// Another worker owns the task
    #[error("lease on {task_id} unavailable: held by {owner}")]
    LeaseUnavailable {
        /// Task
        task_id: TaskId,
        /// Current holder
        owner: String,
    },

    /// Result arrived after the task moved on (typically abandoned)
    #[error("stale result for {task_id}: task is {state}")]
    Stale {
        /// Task
        task_id: TaskId,
        /// State found on reload
        state: TaskState,
    },

    /// A record the current state depends on is missing
    #[error("missing {0}")]
    MissingArtifact(String),

    /// Humans may only approve or reject
    #[error("decision {0} cannot be submitted by a human")]
    InvalidDecision(Decision),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl WorkflowError {
    /// Stable cause code recorded on failure
    #[must_use]
    pub fn cause_code(&self) -> CauseCode {
        match self {
            Self::Store(_) | Self::Persistence { .. } => CauseCode::Persistence,
            Self::Generation(e) if e.is_schema() => CauseCode::SchemaValidation,
            Self::Generation(_) => CauseCode::ProviderUnavailable,
            Self::Planning(e) => e.cause_code(),
            Self::ChangeDelivery(_) => CauseCode::ChangeDelivery,
            Self::Stale { .. } => CauseCode::Abandoned,
            _ => CauseCode::Internal,
        }
    }

    /// Check if error is retryable
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Store(e) => e.is_retryable(),
            Self::Generation(e) => e.is_transient(),
            Self::Planning(e) => e.is_retryable(),
            Self::Connector(e) => e.is_transient(),
            _ => false,
        }
    }

    /// Check if an operator has to look at the failure
    #[inline]
    #[must_use]
    pub fn requires_human(&self) -> bool {
        matches!(
            self,
            Self::Persistence { .. }
                | Self::ChangeDelivery(_)
                | Self::Planning(PlanningError::CoverageViolation(_))
        )
    }

    /// Whether the error only means the task moved on without us
    #[inline]
    #[must_use]
    pub fn is_stale(&self) -> bool {
        matches!(self, Self::Stale { .. } | Self::Gate(GateError::Cancelled { .. }))
    }
}

/// Errors from issue source, change host and static analysis connectors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectorError {
    /// Remote system unreachable
    #[error("{system} unavailable: {detail}")]
    Unavailable {
        /// Which connector
        system: &'static str,
        /// Detail
        detail: String,
    },

    /// Remote system refused the request
    #[error("{system} rejected request: {detail}")]
    Rejected {
        /// Which connector
        system: &'static str,
        /// Detail
        detail: String,
    },

    /// Unknown reference
    #[error("{system} has no {reference}")]
    NotFound {
        /// Which connector
        system: &'static str,
        /// Missing reference
        reference: String,
    },
}

impl ConnectorError {
    /// Whether a retry could help
    #[inline]
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

/// Configuration loading and validation errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File could not be read
    #[error("cannot read {path}: {source}")]
    Io {
        /// File
        path: PathBuf,
        /// Cause
        #[source]
        source: std::io::Error,
    },

    /// TOML did not parse
    #[error("invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// Effective config could not be rendered
    #[error("cannot render TOML: {0}")]
    Render(#[from] toml::ser::Error),

    /// Environment override did not parse
    #[error("environment variable {key}={value:?} is not valid")]
    Env {
        /// Variable
        key: &'static str,
        /// Raw value
        value: String,
    },

    /// Value out of range
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
