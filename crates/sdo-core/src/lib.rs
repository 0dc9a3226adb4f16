//! SDO Core - workflow orchestrator for software changes
//!
//! Drives each work item from ingestion to a delivered change request:
//! - Plans it through the planning engine and a human plan gate
//! - Develops and reviews changes in a bounded retry loop
//! - Escalates to a forced final gate when the retry budget is spent
//! - Delivers the approved change and reports status back to the source
//!
//! Every transition is a compare-and-set on the stored task and leaves an
//! audit event in a hash-chained log.
//!
//! # Example
//!
//! ```rust,ignore
//! use sdo_core::prelude::*;
//!
//! # async fn example(collaborators: Collaborators) -> Result<(), WorkflowError> {
//! let engine = WorkflowOrchestrator::new(EngineConfig::load(None)?, collaborators)?;
//! let task_id = engine.submit(SourceRef::new("PROJ-42")).await?;
//!
//! // a reviewer approves the plan
//! engine.resolve_gate(task_id, GateName::PlanApproval, Decision::Approve, None, "alice")?;
//! engine.wait_idle().await;
//! println!("{:?}", engine.status(task_id).await?.state);
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]

pub mod config;
pub mod connectors;
pub mod development;
pub mod error;
pub mod orchestrator;
pub mod persist;
pub mod review;
pub mod simulator;

pub use config::{EngineConfig, ReviewWeights};
pub use connectors::{
    AnalysisHandle, AnalysisResult, ChangeHost, InMemoryIssueSource, IssueSource,
    RecordingChangeHost, ScriptedStaticAnalysis, StaticAnalysis, StatusReport,
};
pub use development::{DevelopmentLoopController, LoopDecision};
pub use error::{ConfigError, ConnectorError, WorkflowError};
pub use orchestrator::{Collaborators, TaskStatus, WorkflowOrchestrator};
pub use persist::{PersistencePolicy, TaskWriter};
pub use review::ReviewAggregator;
pub use simulator::{run_simulator, SimulatorConfig, SimulatorReport};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Common imports
pub mod prelude {
    pub use crate::config::EngineConfig;
    pub use crate::connectors::{ChangeHost, IssueSource, StaticAnalysis};
    pub use crate::error::WorkflowError;
    pub use crate::orchestrator::{Collaborators, TaskStatus, WorkflowOrchestrator};
    pub use sdo_artifact::{Decision, GateName, SourceRef, TaskId, TaskSpec, TaskState};
    pub use sdo_kernel::TimeoutPolicy;
}
