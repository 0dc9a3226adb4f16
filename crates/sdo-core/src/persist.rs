//! Store access with retry and compare-and-set
//!
//! Store calls that fail with a retryable error are repeated with backoff.
//! Task writes are compare-and-set on the version the caller read; a
//! conflict against a terminal task means the caller's result is stale and
//! is discarded (with an audit entry), never applied.

use crate::config::PersistenceSection;
use crate::error::WorkflowError;
use sdo_artifact::{ArtifactStore, AuditEvent, AuditEventType, StoreError, Task, TaskId};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Backoff for store calls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistencePolicy {
    /// Attempts per call
    pub max_attempts: u32,
    /// First delay
    pub base_delay: Duration,
    /// Delay cap
    pub max_delay: Duration,
}

impl PersistencePolicy {
    fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.base_delay
            .checked_mul(1_u32 << exp)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl From<&PersistenceSection> for PersistencePolicy {
    fn from(section: &PersistenceSection) -> Self {
        Self {
            max_attempts: section.max_attempts.max(1),
            base_delay: Duration::from_millis(section.base_delay_ms),
            max_delay: Duration::from_millis(section.max_delay_ms),
        }
    }
}

/// Retrying, version-checked access to the artifact store
#[derive(Clone)]
pub struct TaskWriter {
    store: Arc<dyn ArtifactStore>,
    policy: PersistencePolicy,
}

impl std::fmt::Debug for TaskWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskWriter")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl TaskWriter {
    /// Wrap a store
    #[must_use]
    pub fn new(store: Arc<dyn ArtifactStore>, policy: PersistencePolicy) -> Self {
        Self { store, policy }
    }

    /// Underlying store
    #[must_use]
    pub fn store(&self) -> &Arc<dyn ArtifactStore> {
        &self.store
    }

    /// Run a store call, retrying while the store is unavailable
    pub async fn retry<T, F, Fut>(&self, operation: &'static str, mut call: F) -> Result<T, WorkflowError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.policy.max_attempts => {
                    let delay = self.policy.delay_for(attempt);
                    warn!(operation, attempt, ?delay, error = %e, "store unavailable, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) if e.is_retryable() => {
                    return Err(WorkflowError::Persistence {
                        operation,
                        attempts: attempt,
                        last: e.to_string(),
                    })
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Load a task
    pub async fn load(&self, task: TaskId) -> Result<Task, WorkflowError> {
        self.retry("get_task", || self.store.get_task(task)).await
    }

    /// Append an audit event
    pub async fn audit(&self, event: AuditEvent) -> Result<AuditEvent, WorkflowError> {
        self.retry("append_audit", || self.store.append_audit(event.clone())).await
    }

    /// Apply `mutate` to `task` and write it if nobody else wrote first
    pub async fn cas<F>(&self, task: Task, actor: &str, mutate: F) -> Result<Task, WorkflowError>
    where
        F: FnOnce(&mut Task),
    {
        self.cas_audited(task, actor, mutate, |_, _| Vec::new()).await
    }

    /// [`TaskWriter::cas`] whose audit events are written in the same store
    /// call. `events` sees the task before and after `mutate`.
    pub async fn cas_audited<F, E>(
        &self,
        task: Task,
        actor: &str,
        mutate: F,
        events: E,
    ) -> Result<Task, WorkflowError>
    where
        F: FnOnce(&mut Task),
        E: FnOnce(&Task, &Task) -> Vec<AuditEvent>,
    {
        let expected = task.version;
        let mut next = task.clone();
        mutate(&mut next);
        next.updated_at = chrono::Utc::now();
        let events = events(&task, &next);

        let written = if events.is_empty() {
            self.retry("update_task", || self.store.update_task(expected, next.clone()))
                .await
        } else {
            self.retry("update_task_audited", || {
                self.store.update_task_audited(expected, next.clone(), events.clone())
            })
            .await
            .map(|(written, _)| written)
        };
        match written {
            Err(WorkflowError::Store(StoreError::VersionConflict { task_id, .. })) => {
                Err(self.discard(task_id, expected, actor).await?)
            }
            other => other,
        }
    }

    async fn discard(&self, task_id: TaskId, expected: u64, actor: &str) -> Result<WorkflowError, WorkflowError> {
        let current = self.load(task_id).await?;
        if current.state.is_terminal() {
            info!(task_id = %task_id, state = %current.state, actor, "discarding stale result");
            let event = AuditEvent::new(task_id, AuditEventType::StaleResultDiscarded, actor).with_detail(format!(
                "result for version {expected} discarded; task is {}",
                current.state
            ));
            self.audit(event).await?;
        }
        Ok(WorkflowError::Stale {
            task_id,
            state: current.state,
        })
    }
}
