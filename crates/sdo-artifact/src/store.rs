//! Artifact store contract
//!
//! The store is the only shared mutable resource in the engine. Task writes
//! are compare-and-set on [`Task::version`]; every other record is
//! create-once and rejected if the id already exists.

use crate::audit::AuditEvent;
use crate::ids::{ChangeSetId, PlanId, ReviewId, SourceRef, TaskId};
use crate::plan::Plan;
use crate::review::{ApprovalRecord, ChangeSet, ReviewReport};
use crate::task::Task;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use ulid::Ulid;

/// Store errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Record missing
    #[error("{kind} {id} not found")]
    NotFound {
        /// Record kind
        kind: &'static str,
        /// Record id
        id: String,
    },

    /// Create-once record already present
    #[error("{kind} {id} already exists")]
    AlreadyExists {
        /// Record kind
        kind: &'static str,
        /// Record id
        id: String,
    },

    /// Compare-and-set lost
    #[error("version conflict on {task_id}: expected {expected}, found {actual}")]
    VersionConflict {
        /// Task
        task_id: TaskId,
        /// Version the writer read
        expected: u64,
        /// Version in the store
        actual: u64,
    },

    /// Another owner holds a live lease
    #[error("lease on {task_id} held by {owner}")]
    LeaseHeld {
        /// Task
        task_id: TaskId,
        /// Current owner
        owner: String,
    },

    /// Audit hash chain broken
    #[error("audit chain broken at index {index}")]
    IntegrityViolation {
        /// First bad event
        index: usize,
    },

    /// Backend down
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Whether retrying the same call may succeed
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }

    pub(crate) fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub(crate) fn exists(kind: &'static str, id: impl ToString) -> Self {
        Self::AlreadyExists {
            kind,
            id: id.to_string(),
        }
    }
}

/// Single-writer lease over a task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Leased task
    pub task_id: TaskId,
    /// Owner name
    pub owner: String,
    /// Unique token for this grant
    pub token: Ulid,
    /// Expiry; a lapsed lease may be taken over
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    /// Grant a lease for `ttl` from now
    #[must_use]
    pub fn grant(task_id: TaskId, owner: &str, ttl: Duration) -> Self {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(365));
        Self {
            task_id,
            owner: owner.to_string(),
            token: Ulid::new(),
            expires_at: Utc::now() + ttl,
        }
    }

    /// Whether the lease is still live
    #[inline]
    #[must_use]
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// Persistence contract for every workflow record
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Insert a new task
    async fn create_task(&self, task: Task) -> Result<Task, StoreError>;

    /// Load a task
    async fn get_task(&self, id: TaskId) -> Result<Task, StoreError>;

    /// Compare-and-set write. Fails with [`StoreError::VersionConflict`]
    /// unless the stored version equals `expected_version`. Returns the
    /// stored copy with its bumped version.
    async fn update_task(&self, expected_version: u64, task: Task) -> Result<Task, StoreError>;

    /// [`ArtifactStore::update_task`] plus its audit events, applied together
    /// or not at all. Events are chained in order after the write.
    async fn update_task_audited(
        &self,
        expected_version: u64,
        task: Task,
        events: Vec<AuditEvent>,
    ) -> Result<(Task, Vec<AuditEvent>), StoreError>;

    /// All tasks
    async fn list_tasks(&self) -> Result<Vec<Task>, StoreError>;

    /// Task ingested from a given source, if any
    async fn find_by_source(&self, source_ref: &SourceRef) -> Result<Option<Task>, StoreError>;

    /// Take (or renew) the single-writer lease
    async fn acquire_lease(
        &self,
        task_id: TaskId,
        owner: &str,
        ttl: Duration,
    ) -> Result<Lease, StoreError>;

    /// Give a lease back; a lease already taken over is left alone
    async fn release_lease(&self, lease: &Lease) -> Result<(), StoreError>;

    /// Persist a plan
    async fn put_plan(&self, plan: Plan) -> Result<(), StoreError>;

    /// Load a plan
    async fn get_plan(&self, id: PlanId) -> Result<Plan, StoreError>;

    /// Persist a change set
    async fn put_changeset(&self, changeset: ChangeSet) -> Result<(), StoreError>;

    /// Load a change set
    async fn get_changeset(&self, id: ChangeSetId) -> Result<ChangeSet, StoreError>;

    /// Persist a review report
    async fn put_review(&self, report: ReviewReport) -> Result<(), StoreError>;

    /// Load a review report
    async fn get_review(&self, id: ReviewId) -> Result<ReviewReport, StoreError>;

    /// Reviews for a task, oldest first
    async fn reviews_for_task(&self, task_id: TaskId) -> Result<Vec<ReviewReport>, StoreError>;

    /// Persist an approval record
    async fn put_approval(&self, record: ApprovalRecord) -> Result<(), StoreError>;

    /// Approvals for a task, oldest first
    async fn approvals_for_task(&self, task_id: TaskId)
        -> Result<Vec<ApprovalRecord>, StoreError>;

    /// Chain and append an audit event
    async fn append_audit(&self, event: AuditEvent) -> Result<AuditEvent, StoreError>;

    /// Audit events for a task
    async fn audit_for_task(&self, task_id: TaskId) -> Result<Vec<AuditEvent>, StoreError>;

    /// Audit events at or after a point in time
    async fn audit_since(&self, since: DateTime<Utc>) -> Result<Vec<AuditEvent>, StoreError>;

    /// Check the audit hash chain
    async fn verify_audit(&self) -> Result<(), StoreError>;
}
