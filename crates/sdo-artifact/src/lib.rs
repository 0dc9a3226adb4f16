//! SDO Artifact Records
//!
//! Durable records for the delivery pipeline and the store contract that
//! holds them.
//!
//! # Core Concepts
//!
//! - [`Task`]: one work item and its lifecycle [`TaskState`]
//! - [`Plan`]: immutable plan revision with merged subtasks
//! - [`ChangeSet`] / [`ReviewReport`]: one development attempt and its review
//! - [`ArtifactStore`]: compare-and-set persistence with single-writer leases
//! - [`AuditLog`]: hash-chained, append-only trail
//! - [`DashboardView`]: read model projected from the trail
//!
//! # Example
//!
//! ```rust,ignore
//! use sdo_artifact::{ArtifactStore, InMemoryArtifactStore, SourceRef, Task, TaskSpec};
//!
//! let store = InMemoryArtifactStore::new();
//! let task = store
//!     .create_task(Task::new(SourceRef::new("PROJ-1"), TaskSpec::new("Add login", "")))
//!     .await?;
//! assert_eq!(task.version, 1);
//! ```

#![warn(unreachable_pub)]

pub mod audit;
pub mod ids;
pub mod memory;
pub mod plan;
pub mod read_model;
pub mod review;
pub mod store;
pub mod task;

pub use audit::{verify_chain, AuditEvent, AuditEventType, AuditLog, GENESIS_HASH};
pub use ids::{CandidateId, ChangeSetId, EventId, PlanId, ReviewId, SourceRef, TaskId};
pub use memory::InMemoryArtifactStore;
pub use plan::{
    mean, CandidateSubtask, MergedSubtask, Plan, PlanningMethod, RubricScores,
    MAX_CANDIDATE_SCORE,
};
pub use read_model::{ActivityEntry, DashboardView, TaskSnapshot, TaskSummary, ACTIVITY_CAPACITY};
pub use review::{
    AnalysisStatus, ApprovalRecord, ChangeSet, Decision, DimensionResult, GateName,
    ReviewDimension, ReviewReport,
};
pub use store::{ArtifactStore, Lease, StoreError};
pub use task::{
    CauseCode, DeliveryRecord, FailureCause, Feedback, FeedbackOrigin, Task, TaskSpec, TaskState,
};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
