//! SDO Planning
//!
//! Turns a task spec into a fixed-size plan whose merged subtasks cover
//! every generated candidate exactly once (or with an explicit
//! justification for sharing).
//!
//! # Example
//!
//! ```rust,ignore
//! use sdo_planning::{PlanningConfig, PlanningEngine, PlanningRequest};
//!
//! let engine = PlanningEngine::new(client, PlanningConfig::default(), metrics);
//! let planned = engine.plan(&PlanningRequest::new(task.id, task.spec.clone())).await?;
//! assert_eq!(planned.plan.merged_subtasks.len(), 4);
//! ```

#![warn(unreachable_pub)]

pub mod coverage;
pub mod engine;
pub mod error;
pub mod grouping;

pub use coverage::{check_coverage, CoverageReport};
pub use engine::{verify_plan, MergeStrategy, Planned, PlanningConfig, PlanningEngine, PlanningRequest};
pub use error::PlanningError;
pub use grouping::{weighted_groups, Group};
