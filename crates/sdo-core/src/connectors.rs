//! External connectors
//!
//! Issue source, change host and static analysis are injected as trait
//! objects. The in-memory implementations here back the simulator and the
//! test suites; real API clients live outside this workspace.

use crate::error::ConnectorError;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use sdo_artifact::{ChangeSet, FailureCause, SourceRef, Task, TaskId, TaskSpec, TaskState};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tracing::debug;

/// Where work items come from
#[async_trait]
pub trait IssueSource: Send + Sync {
    /// Fetch the content of one work item
    async fn fetch(&self, source_ref: &SourceRef) -> Result<TaskSpec, ConnectorError>;

    /// Work items ready to be picked up
    async fn list_ready(&self) -> Result<Vec<SourceRef>, ConnectorError>;

    /// Best-effort status update; callers never wait on it
    async fn report_status(
        &self,
        task_id: TaskId,
        source_ref: &SourceRef,
        state: TaskState,
        cause: Option<&FailureCause>,
    ) -> Result<(), ConnectorError>;
}

/// Where approved changes are delivered
#[async_trait]
pub trait ChangeHost: Send + Sync {
    /// Create the branch for a task; returns the branch name
    async fn create_branch(&self, task_id: TaskId, source_ref: &SourceRef) -> Result<String, ConnectorError>;

    /// Commit a change set onto a branch; returns the commit reference
    async fn commit_changes(&self, branch: &str, changeset: &ChangeSet) -> Result<String, ConnectorError>;

    /// Open a change request; returns its URL
    async fn open_change_request(
        &self,
        branch: &str,
        task: &Task,
        changeset: &ChangeSet,
    ) -> Result<String, ConnectorError>;
}

/// Handle for a submitted analysis
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AnalysisHandle(pub String);

/// Finished analysis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    /// Quality score, 0..=100
    pub score: f64,
    /// Findings passed to the security and standards evaluations
    pub findings: Vec<String>,
}

/// Asynchronous static analysis
#[async_trait]
pub trait StaticAnalysis: Send + Sync {
    /// Start analysing a change set
    async fn submit(&self, changeset: &ChangeSet) -> Result<AnalysisHandle, ConnectorError>;

    /// `Ok(None)` while the analysis is still running
    async fn poll(&self, handle: &AnalysisHandle) -> Result<Option<AnalysisResult>, ConnectorError>;
}

/// Status update seen by [`InMemoryIssueSource`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    /// Task
    pub task_id: TaskId,
    /// Work item
    pub source_ref: SourceRef,
    /// New state
    pub state: TaskState,
    /// Cause, if any
    pub cause: Option<FailureCause>,
}

/// Issue source backed by a map
#[derive(Debug, Default)]
pub struct InMemoryIssueSource {
    items: DashMap<SourceRef, TaskSpec>,
    ready: Mutex<VecDeque<SourceRef>>,
    reports: Mutex<Vec<StatusReport>>,
    reporting_down: AtomicBool,
}

impl InMemoryIssueSource {
    /// Empty source
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a work item and mark it ready
    pub fn add(&self, source_ref: impl Into<String>, spec: TaskSpec) -> SourceRef {
        let source_ref = SourceRef::new(source_ref);
        self.items.insert(source_ref.clone(), spec);
        self.ready.lock().push_back(source_ref.clone());
        source_ref
    }

    /// Delete a work item's content; a ready listing for it stays queued
    pub fn remove(&self, source_ref: &SourceRef) -> Option<TaskSpec> {
        self.items.remove(source_ref).map(|(_, spec)| spec)
    }

    /// Make `report_status` fail
    pub fn set_reporting_down(&self, down: bool) {
        self.reporting_down.store(down, Ordering::SeqCst);
    }

    /// Reports received, oldest first
    #[must_use]
    pub fn reports(&self) -> Vec<StatusReport> {
        self.reports.lock().clone()
    }

    /// States reported for one work item
    #[must_use]
    pub fn states_for(&self, source_ref: &SourceRef) -> Vec<TaskState> {
        self.reports
            .lock()
            .iter()
            .filter(|r| &r.source_ref == source_ref)
            .map(|r| r.state)
            .collect()
    }
}

#[async_trait]
impl IssueSource for InMemoryIssueSource {
    async fn fetch(&self, source_ref: &SourceRef) -> Result<TaskSpec, ConnectorError> {
        self.items
            .get(source_ref)
            .map(|spec| spec.value().clone())
            .ok_or_else(|| ConnectorError::NotFound {
                system: "issue source",
                reference: source_ref.to_string(),
            })
    }

    async fn list_ready(&self) -> Result<Vec<SourceRef>, ConnectorError> {
        Ok(self.ready.lock().drain(..).collect())
    }

    async fn report_status(
        &self,
        task_id: TaskId,
        source_ref: &SourceRef,
        state: TaskState,
        cause: Option<&FailureCause>,
    ) -> Result<(), ConnectorError> {
        if self.reporting_down.load(Ordering::SeqCst) {
            return Err(ConnectorError::Unavailable {
                system: "issue source",
                detail: "status endpoint offline".to_string(),
            });
        }
        self.reports.lock().push(StatusReport {
            task_id,
            source_ref: source_ref.clone(),
            state,
            cause: cause.cloned(),
        });
        Ok(())
    }
}

/// Delivery step that [`RecordingChangeHost`] can be told to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStep {
    /// `create_branch`
    Branch,
    /// `commit_changes`
    Commit,
    /// `open_change_request`
    ChangeRequest,
}

/// Opened change request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Task
    pub task_id: TaskId,
    /// Branch
    pub branch: String,
    /// Commit
    pub commit: String,
    /// URL
    pub url: String,
}

/// Change host that records deliveries in memory
#[derive(Debug, Default)]
pub struct RecordingChangeHost {
    deliveries: Mutex<Vec<Delivery>>,
    commits: DashMap<String, String>,
    fail_at: Mutex<Option<DeliveryStep>>,
    sequence: AtomicU32,
}

impl RecordingChangeHost {
    /// Empty host
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every call at `step`
    pub fn fail_at(&self, step: Option<DeliveryStep>) {
        *self.fail_at.lock() = step;
    }

    /// Opened change requests
    #[must_use]
    pub fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries.lock().clone()
    }

    fn check(&self, step: DeliveryStep) -> Result<(), ConnectorError> {
        if *self.fail_at.lock() == Some(step) {
            return Err(ConnectorError::Rejected {
                system: "change host",
                detail: format!("{step:?} refused"),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ChangeHost for RecordingChangeHost {
    async fn create_branch(&self, task_id: TaskId, source_ref: &SourceRef) -> Result<String, ConnectorError> {
        self.check(DeliveryStep::Branch)?;
        Ok(format!("sdo/{}-{}", source_ref.as_str().to_lowercase(), task_id))
    }

    async fn commit_changes(&self, branch: &str, changeset: &ChangeSet) -> Result<String, ConnectorError> {
        self.check(DeliveryStep::Commit)?;
        let n = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let commit = format!("c{n:07x}");
        self.commits.insert(branch.to_string(), commit.clone());
        debug!(branch, artifact = %changeset.artifact_ref, commit = %commit, "change committed");
        Ok(commit)
    }

    async fn open_change_request(
        &self,
        branch: &str,
        task: &Task,
        changeset: &ChangeSet,
    ) -> Result<String, ConnectorError> {
        self.check(DeliveryStep::ChangeRequest)?;
        let commit = self
            .commits
            .get(branch)
            .map(|c| c.value().clone())
            .ok_or_else(|| ConnectorError::Rejected {
                system: "change host",
                detail: format!("nothing committed on {branch} for {}", changeset.id),
            })?;
        let number = self.deliveries.lock().len() + 1;
        let url = format!("https://changes.example/{}/{number}", task.source_ref);
        self.deliveries.lock().push(Delivery {
            task_id: task.id,
            branch: branch.to_string(),
            commit,
            url: url.clone(),
        });
        Ok(url)
    }
}

/// Static analysis that finishes after a fixed number of polls
#[derive(Debug)]
pub struct ScriptedStaticAnalysis {
    result: AnalysisResult,
    polls_needed: Option<u32>,
    polls: AtomicU32,
    submitted: Mutex<Vec<String>>,
}

impl ScriptedStaticAnalysis {
    /// Ready on the `polls_needed`-th poll
    #[must_use]
    pub fn ready_after(polls_needed: u32, result: AnalysisResult) -> Self {
        Self {
            result,
            polls_needed: Some(polls_needed.max(1)),
            polls: AtomicU32::new(0),
            submitted: Mutex::new(Vec::new()),
        }
    }

    /// Never produces a result
    #[must_use]
    pub fn never() -> Self {
        Self {
            result: AnalysisResult {
                score: 0.0,
                findings: Vec::new(),
            },
            polls_needed: None,
            polls: AtomicU32::new(0),
            submitted: Mutex::new(Vec::new()),
        }
    }

    /// Polls received
    #[must_use]
    pub fn polls(&self) -> u32 {
        self.polls.load(Ordering::SeqCst)
    }

    /// Artifacts submitted
    #[must_use]
    pub fn submitted(&self) -> Vec<String> {
        self.submitted.lock().clone()
    }
}

#[async_trait]
impl StaticAnalysis for ScriptedStaticAnalysis {
    async fn submit(&self, changeset: &ChangeSet) -> Result<AnalysisHandle, ConnectorError> {
        self.submitted.lock().push(changeset.artifact_ref.clone());
        Ok(AnalysisHandle(changeset.id.to_string()))
    }

    async fn poll(&self, _handle: &AnalysisHandle) -> Result<Option<AnalysisResult>, ConnectorError> {
        let n = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(match self.polls_needed {
            Some(needed) if n >= needed => Some(self.result.clone()),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn issue_source_drains_ready_queue() {
        let source = InMemoryIssueSource::new();
        let r = source.add("PROJ-7", TaskSpec::new("Add export", "CSV export"));
        assert_eq!(source.list_ready().await.unwrap(), vec![r.clone()]);
        assert!(source.list_ready().await.unwrap().is_empty());
        assert_eq!(source.fetch(&r).await.unwrap().summary, "Add export");
        assert!(matches!(
            source.fetch(&SourceRef::new("nope")).await,
            Err(ConnectorError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn change_host_failure_injection() {
        let host = RecordingChangeHost::new();
        host.fail_at(Some(DeliveryStep::Commit));
        let task = Task::new(SourceRef::new("PROJ-1"), TaskSpec::new("x", ""));
        let cs = ChangeSet::new(task.id, 1, "patch-1", "s");
        let branch = host.create_branch(task.id, &task.source_ref).await.unwrap();
        assert!(host.commit_changes(&branch, &cs).await.is_err());
        assert!(host.deliveries().is_empty());
    }

    #[tokio::test]
    async fn static_analysis_ready_after_polls() {
        let analysis = ScriptedStaticAnalysis::ready_after(
            2,
            AnalysisResult {
                score: 80.0,
                findings: vec!["unused import".to_string()],
            },
        );
        let cs = ChangeSet::new(TaskId::new(), 1, "patch", "s");
        let handle = analysis.submit(&cs).await.unwrap();
        assert!(analysis.poll(&handle).await.unwrap().is_none());
        let result = analysis.poll(&handle).await.unwrap().unwrap();
        assert!((result.score - 80.0).abs() < f64::EPSILON);
    }
}
