//! SDO Kernel
//!
//! Runtime primitives shared by the engine:
//! 1. **State machine**: the task lifecycle transition table
//! 2. **Gates**: blocking human checkpoints with timeout and idempotent resolution
//! 3. **Worker pool**: bounded concurrency across tasks, one run per task
//! 4. **Metrics / telemetry**: injected metrics sink and tracing setup
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use sdo_kernel::prelude::*;
//!
//! let (boundary, mut presented) = ChannelBoundary::new();
//! let gates = GateManager::new(Arc::new(boundary), Duration::from_secs(30));
//!
//! validate_transition(TaskState::Planning, TaskState::AwaitingPlanApproval)?;
//! let record = gates.open(task_id, GateName::PlanApproval, GateArtifact::Plan(plan)).await?;
//! ```

#![warn(unreachable_pub)]

pub mod error;
pub mod gate;
pub mod metrics;
pub mod pool;
pub mod state_machine;
pub mod telemetry;

pub use error::{GateError, PoolError, TransitionError};
pub use gate::{
    ChannelBoundary, GateArtifact, GateManager, GateOutcome, HitlBoundary, PendingGate,
    Presentation, Resolution, ResolveOutcome, TimeoutPolicy, SYSTEM_ACTOR,
};
pub use metrics::{FacadeMetrics, MetricEvent, MetricsSink, NoopMetrics, RecordingMetrics};
pub use pool::{PoolStats, WorkerPool};
pub use state_machine::{allowed_transitions, stage_name, validate_transition};
pub use telemetry::init_tracing;

/// Common imports
pub mod prelude {
    pub use crate::gate::{ChannelBoundary, GateArtifact, GateManager, HitlBoundary, Resolution};
    pub use crate::metrics::{MetricsSink, NoopMetrics};
    pub use crate::pool::WorkerPool;
    pub use crate::state_machine::{allowed_transitions, validate_transition};
    pub use sdo_artifact::{GateName, TaskState};
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Check if running with strict debugging enabled
pub const fn strict_debug() -> bool {
    cfg!(feature = "strict-debug")
}
