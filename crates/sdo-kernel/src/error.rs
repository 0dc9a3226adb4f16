//! Kernel error types

use sdo_artifact::{GateName, TaskId, TaskState};

/// Transition table violations
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    /// Not an edge of the lifecycle graph
    #[error("illegal transition {from} -> {to}")]
    Illegal {
        /// Current state
        from: TaskState,
        /// Requested state
        to: TaskState,
    },
}

/// Human gate errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GateError {
    /// Gate closed without a decision (task abandoned)
    #[error("gate {gate} for {task_id} was cancelled")]
    Cancelled {
        /// Task
        task_id: TaskId,
        /// Gate
        gate: GateName,
    },

    /// A second open while the first is still waiting
    #[error("gate {gate} for {task_id} is already open")]
    AlreadyOpen {
        /// Task
        task_id: TaskId,
        /// Gate
        gate: GateName,
    },

    /// Boundary could not show the artifact
    #[error("failed to present gate: {0}")]
    Presentation(String),
}

/// Worker pool errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    /// The task already has a worker
    #[error("task {0} is already running")]
    AlreadyRunning(TaskId),

    /// Pool no longer accepts work
    #[error("worker pool is shutting down")]
    ShuttingDown,
}
