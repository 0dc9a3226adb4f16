//! In-memory artifact store
//!
//! Backs the simulator and tests. Fault injection (`set_unavailable`,
//! `fail_next_writes`) lets callers exercise persistence error paths.

use crate::audit::{AuditEvent, AuditLog};
use crate::ids::{ChangeSetId, PlanId, ReviewId, SourceRef, TaskId};
use crate::plan::Plan;
use crate::review::{ApprovalRecord, ChangeSet, ReviewReport};
use crate::store::{ArtifactStore, Lease, StoreError};
use crate::task::Task;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Thread-safe in-memory store
#[derive(Debug, Default)]
pub struct InMemoryArtifactStore {
    tasks: DashMap<TaskId, Task>,
    plans: DashMap<PlanId, Plan>,
    changesets: DashMap<ChangeSetId, ChangeSet>,
    reviews: DashMap<ReviewId, ReviewReport>,
    approvals: DashMap<TaskId, Vec<ApprovalRecord>>,
    leases: DashMap<TaskId, Lease>,
    audit: AuditLog,
    unavailable: AtomicBool,
    failing_writes: AtomicU32,
}

impl InMemoryArtifactStore {
    /// Empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with [`StoreError::Unavailable`] until cleared
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Fail the next `n` write calls
    pub fn fail_next_writes(&self, n: u32) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }

    /// Direct access to the audit log
    #[must_use]
    pub fn audit_log(&self) -> &AuditLog {
        &self.audit
    }

    fn check_read(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("store offline".to_string()));
        }
        Ok(())
    }

    fn check_write(&self) -> Result<(), StoreError> {
        self.check_read()?;
        let injected = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            warn!("injected write failure");
            return Err(StoreError::Unavailable("injected write failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ArtifactStore for InMemoryArtifactStore {
    async fn create_task(&self, task: Task) -> Result<Task, StoreError> {
        self.check_write()?;
        match self.tasks.entry(task.id) {
            Entry::Occupied(_) => Err(StoreError::exists("task", task.id)),
            Entry::Vacant(v) => {
                let mut stored = task;
                stored.version = 1;
                v.insert(stored.clone());
                Ok(stored)
            }
        }
    }

    async fn get_task(&self, id: TaskId) -> Result<Task, StoreError> {
        self.check_read()?;
        self.tasks
            .get(&id)
            .map(|t| t.clone())
            .ok_or_else(|| StoreError::not_found("task", id))
    }

    async fn update_task(&self, expected_version: u64, task: Task) -> Result<Task, StoreError> {
        self.update_task_audited(expected_version, task, Vec::new())
            .await
            .map(|(stored, _)| stored)
    }

    async fn update_task_audited(
        &self,
        expected_version: u64,
        task: Task,
        events: Vec<AuditEvent>,
    ) -> Result<(Task, Vec<AuditEvent>), StoreError> {
        self.check_write()?;
        let mut entry = self
            .tasks
            .get_mut(&task.id)
            .ok_or_else(|| StoreError::not_found("task", task.id))?;
        if entry.version != expected_version {
            debug!(task_id = %task.id, expected = expected_version, actual = entry.version, "version conflict");
            return Err(StoreError::VersionConflict {
                task_id: task.id,
                expected: expected_version,
                actual: entry.version,
            });
        }
        let mut stored = task;
        stored.version = expected_version + 1;
        stored.updated_at = Utc::now();
        // the entry stays locked until the events are chained
        let appended = events.into_iter().map(|e| self.audit.append(e)).collect();
        *entry = stored.clone();
        Ok((stored, appended))
    }

    async fn list_tasks(&self) -> Result<Vec<Task>, StoreError> {
        self.check_read()?;
        let mut tasks: Vec<Task> = self.tasks.iter().map(|t| t.clone()).collect();
        tasks.sort_by_key(|t| t.id);
        Ok(tasks)
    }

    async fn find_by_source(&self, source_ref: &SourceRef) -> Result<Option<Task>, StoreError> {
        self.check_read()?;
        Ok(self
            .tasks
            .iter()
            .find(|t| &t.source_ref == source_ref)
            .map(|t| t.clone()))
    }

    async fn acquire_lease(
        &self,
        task_id: TaskId,
        owner: &str,
        ttl: Duration,
    ) -> Result<Lease, StoreError> {
        self.check_write()?;
        let now = Utc::now();
        let lease = Lease::grant(task_id, owner, ttl);
        match self.leases.entry(task_id) {
            Entry::Occupied(mut held) => {
                if held.get().owner != owner && held.get().is_live(now) {
                    return Err(StoreError::LeaseHeld {
                        task_id,
                        owner: held.get().owner.clone(),
                    });
                }
                held.insert(lease.clone());
            }
            Entry::Vacant(v) => {
                v.insert(lease.clone());
            }
        }
        Ok(lease)
    }

    async fn release_lease(&self, lease: &Lease) -> Result<(), StoreError> {
        self.check_write()?;
        self.leases
            .remove_if(&lease.task_id, |_, held| held.token == lease.token);
        Ok(())
    }

    async fn put_plan(&self, plan: Plan) -> Result<(), StoreError> {
        self.check_write()?;
        match self.plans.entry(plan.id) {
            Entry::Occupied(_) => Err(StoreError::exists("plan", plan.id)),
            Entry::Vacant(v) => {
                v.insert(plan);
                Ok(())
            }
        }
    }

    async fn get_plan(&self, id: PlanId) -> Result<Plan, StoreError> {
        self.check_read()?;
        self.plans
            .get(&id)
            .map(|p| p.clone())
            .ok_or_else(|| StoreError::not_found("plan", id))
    }

    async fn put_changeset(&self, changeset: ChangeSet) -> Result<(), StoreError> {
        self.check_write()?;
        match self.changesets.entry(changeset.id) {
            Entry::Occupied(_) => Err(StoreError::exists("changeset", changeset.id)),
            Entry::Vacant(v) => {
                v.insert(changeset);
                Ok(())
            }
        }
    }

    async fn get_changeset(&self, id: ChangeSetId) -> Result<ChangeSet, StoreError> {
        self.check_read()?;
        self.changesets
            .get(&id)
            .map(|c| c.clone())
            .ok_or_else(|| StoreError::not_found("changeset", id))
    }

    async fn put_review(&self, report: ReviewReport) -> Result<(), StoreError> {
        self.check_write()?;
        match self.reviews.entry(report.id) {
            Entry::Occupied(_) => Err(StoreError::exists("review", report.id)),
            Entry::Vacant(v) => {
                v.insert(report);
                Ok(())
            }
        }
    }

    async fn get_review(&self, id: ReviewId) -> Result<ReviewReport, StoreError> {
        self.check_read()?;
        self.reviews
            .get(&id)
            .map(|r| r.clone())
            .ok_or_else(|| StoreError::not_found("review", id))
    }

    async fn reviews_for_task(&self, task_id: TaskId) -> Result<Vec<ReviewReport>, StoreError> {
        self.check_read()?;
        let mut reviews: Vec<ReviewReport> = self
            .reviews
            .iter()
            .filter(|r| r.task_id == task_id)
            .map(|r| r.clone())
            .collect();
        reviews.sort_by_key(|r| r.id);
        Ok(reviews)
    }

    async fn put_approval(&self, record: ApprovalRecord) -> Result<(), StoreError> {
        self.check_write()?;
        self.approvals.entry(record.task_id).or_default().push(record);
        Ok(())
    }

    async fn approvals_for_task(
        &self,
        task_id: TaskId,
    ) -> Result<Vec<ApprovalRecord>, StoreError> {
        self.check_read()?;
        Ok(self
            .approvals
            .get(&task_id)
            .map(|a| a.clone())
            .unwrap_or_default())
    }

    async fn append_audit(&self, event: AuditEvent) -> Result<AuditEvent, StoreError> {
        self.check_write()?;
        Ok(self.audit.append(event))
    }

    async fn audit_for_task(&self, task_id: TaskId) -> Result<Vec<AuditEvent>, StoreError> {
        self.check_read()?;
        Ok(self.audit.for_task(task_id))
    }

    async fn audit_since(&self, since: DateTime<Utc>) -> Result<Vec<AuditEvent>, StoreError> {
        self.check_read()?;
        Ok(self.audit.since(since))
    }

    async fn verify_audit(&self) -> Result<(), StoreError> {
        self.check_read()?;
        self.audit.verify_integrity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{TaskSpec, TaskState};

    fn task() -> Task {
        Task::new(SourceRef::new("PROJ-7"), TaskSpec::new("Add search", "full text"))
    }

    #[tokio::test]
    async fn create_sets_initial_version() {
        let store = InMemoryArtifactStore::new();
        let stored = store.create_task(task()).await.unwrap();
        assert_eq!(stored.version, 1);
        let again = store.create_task(stored.clone()).await;
        assert!(matches!(again, Err(StoreError::AlreadyExists { .. })));
    }

    #[tokio::test]
    async fn update_is_compare_and_set() {
        let store = InMemoryArtifactStore::new();
        let stored = store.create_task(task()).await.unwrap();

        let mut a = stored.clone();
        a.state = TaskState::Planning;
        let written = store.update_task(stored.version, a).await.unwrap();
        assert_eq!(written.version, 2);

        let mut b = stored.clone();
        b.state = TaskState::Abandoned;
        match store.update_task(stored.version, b).await {
            Err(StoreError::VersionConflict { expected, actual, .. }) => {
                assert_eq!(expected, 1);
                assert_eq!(actual, 2);
            }
            other => panic!("expected conflict, got {other:?}"),
        }
        assert_eq!(store.get_task(stored.id).await.unwrap().state, TaskState::Planning);
    }

    #[tokio::test]
    async fn lease_is_exclusive_until_released() {
        let store = InMemoryArtifactStore::new();
        let id = TaskId::new();
        let lease = store
            .acquire_lease(id, "worker-1", Duration::from_secs(60))
            .await
            .unwrap();
        let denied = store.acquire_lease(id, "worker-2", Duration::from_secs(60)).await;
        assert!(matches!(denied, Err(StoreError::LeaseHeld { .. })));

        store.release_lease(&lease).await.unwrap();
        assert!(store
            .acquire_lease(id, "worker-2", Duration::from_secs(60))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn expired_lease_can_be_taken_over() {
        let store = InMemoryArtifactStore::new();
        let id = TaskId::new();
        store
            .acquire_lease(id, "crashed", Duration::from_secs(0))
            .await
            .unwrap();
        let taken = store
            .acquire_lease(id, "worker-2", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(taken.owner, "worker-2");
    }

    #[tokio::test]
    async fn injected_failures_are_transient() {
        let store = InMemoryArtifactStore::new();
        store.fail_next_writes(1);
        let err = store.create_task(task()).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(store.create_task(task()).await.is_ok());
    }

    #[tokio::test]
    async fn audited_update_writes_task_and_events_together() {
        use crate::audit::AuditEventType;

        let store = InMemoryArtifactStore::new();
        let stored = store.create_task(task()).await.unwrap();
        let mut next = stored.clone();
        next.state = TaskState::Planning;
        let event = AuditEvent::new(stored.id, AuditEventType::Transition, "test")
            .with_transition(TaskState::Pending, TaskState::Planning);

        store.fail_next_writes(1);
        let failed = store
            .update_task_audited(stored.version, next.clone(), vec![event.clone()])
            .await;
        assert!(matches!(failed, Err(StoreError::Unavailable(_))));
        assert_eq!(store.get_task(stored.id).await.unwrap().version, 1);
        assert!(store.audit_log().is_empty());

        let mut stale = stored.clone();
        stale.state = TaskState::Abandoned;
        store.update_task(stored.version, stale).await.unwrap();
        let conflict = store
            .update_task_audited(stored.version, next, vec![event])
            .await;
        assert!(matches!(conflict, Err(StoreError::VersionConflict { .. })));
        assert!(store.audit_log().is_empty());
    }

    #[tokio::test]
    async fn audited_update_chains_events_in_order() {
        use crate::audit::AuditEventType;

        let store = InMemoryArtifactStore::new();
        let stored = store.create_task(task()).await.unwrap();
        let mut next = stored.clone();
        next.state = TaskState::Planning;
        let events = vec![
            AuditEvent::new(stored.id, AuditEventType::Transition, "test"),
            AuditEvent::new(stored.id, AuditEventType::PlanRecorded, "test"),
        ];
        let (written, appended) = store
            .update_task_audited(stored.version, next, events)
            .await
            .unwrap();
        assert_eq!(written.version, 2);
        assert_eq!(appended.len(), 2);
        assert_eq!(appended[1].prev_hash, appended[0].hash);
        assert!(store.verify_audit().await.is_ok());
    }

    #[tokio::test]
    async fn unavailable_blocks_reads() {
        let store = InMemoryArtifactStore::new();
        store.set_unavailable(true);
        assert!(matches!(
            store.list_tasks().await,
            Err(StoreError::Unavailable(_))
        ));
    }
}
