//! Workflow Orchestrator
//!
//! The only writer of `Task.state`. It:
//! - Ingests work items and dispatches each task to the worker pool
//! - Drives a task stage by stage under a single-writer lease
//! - Suspends at the plan and final gates
//! - Records every transition in the audit trail
//! - Marks tasks `Failed` or `Abandoned` with a human-readable cause

use crate::config::EngineConfig;
use crate::connectors::{ChangeHost, IssueSource, StaticAnalysis};
use crate::development::{DevelopmentLoopController, LoopDecision};
use crate::error::{ConnectorError, WorkflowError};
use crate::persist::{PersistencePolicy, TaskWriter};
use crate::review::ReviewAggregator;
use chrono::{DateTime, Utc};
use sdo_artifact::{
    ApprovalRecord, ArtifactStore, AuditEvent, AuditEventType, CauseCode, ChangeSet, ChangeSetId,
    DashboardView, Decision, DeliveryRecord, FailureCause, Feedback, FeedbackOrigin, GateName,
    Lease, Plan, PlanId, SourceRef, StoreError, Task, TaskId, TaskSnapshot, TaskState,
};
use sdo_generation::{GenerationClient, GenerationService, TokenUsage};
use sdo_kernel::{
    stage_name, validate_transition, GateArtifact, GateManager, GateOutcome, HitlBoundary,
    MetricsSink, PoolStats, Resolution, ResolveOutcome, WorkerPool,
};
use sdo_planning::{verify_plan, PlanningEngine, PlanningError, PlanningRequest};
use serde::Serialize;
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};
use ulid::Ulid;

const ACTOR: &str = "orchestrator";

/// External systems the orchestrator talks to
#[derive(Clone)]
pub struct Collaborators {
    /// Durable records
    pub store: Arc<dyn ArtifactStore>,
    /// AI backend
    pub generation: Arc<dyn GenerationService>,
    /// Where work items come from
    pub issues: Arc<dyn IssueSource>,
    /// Where finished changes go
    pub changes: Arc<dyn ChangeHost>,
    /// Where humans see gates
    pub boundary: Arc<dyn HitlBoundary>,
    /// Measurements
    pub metrics: Arc<dyn MetricsSink>,
    /// Optional static analysis
    pub static_analysis: Option<Arc<dyn StaticAnalysis>>,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators")
            .field("static_analysis", &self.static_analysis.is_some())
            .finish_non_exhaustive()
    }
}

/// Externally visible task status
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskStatus {
    /// Task
    pub task_id: TaskId,
    /// Originating work item
    pub source_ref: SourceRef,
    /// Current state
    pub state: TaskState,
    /// Failed reviews and counted final rejections
    pub retry_count: u32,
    /// Escalated by the retry limit
    pub forced: bool,
    /// Last failure or escalation cause
    pub cause: Option<String>,
    /// Current plan
    pub plan_id: Option<PlanId>,
    /// Change sets, oldest first
    pub changeset_ids: Vec<ChangeSetId>,
    /// Plan rejections so far
    pub plan_revisions: u32,
    /// Change request link once delivered
    pub change_request_url: Option<String>,
    /// Gate waiting for a human, if any
    pub open_gate: Option<GateName>,
}

/// The workflow engine
pub struct WorkflowOrchestrator {
    config: EngineConfig,
    writer: TaskWriter,
    issues: Arc<dyn IssueSource>,
    changes: Arc<dyn ChangeHost>,
    gates: GateManager,
    planner: PlanningEngine,
    reviewer: ReviewAggregator,
    dlc: DevelopmentLoopController,
    pool: WorkerPool,
    metrics: Arc<dyn MetricsSink>,
}

impl std::fmt::Debug for WorkflowOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowOrchestrator")
            .field("config", &self.config)
            .field("gates", &self.gates)
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

impl WorkflowOrchestrator {
    /// Validate `config` and wire the engine
    pub fn new(config: EngineConfig, collaborators: Collaborators) -> Result<Arc<Self>, WorkflowError> {
        config.validate()?;
        let Collaborators {
            store,
            generation,
            issues,
            changes,
            boundary,
            metrics,
            static_analysis,
        } = collaborators;

        let client = GenerationClient::new(generation, config.retry_policy());
        let writer = TaskWriter::new(store, PersistencePolicy::from(&config.persistence));
        let planner = PlanningEngine::new(client.clone(), config.planning_config(), Arc::clone(&metrics));
        let mut reviewer = ReviewAggregator::new(
            client.clone(),
            config.review_weights,
            config.review_threshold,
            Arc::clone(&metrics),
        );
        if let Some(analysis) = static_analysis {
            reviewer = reviewer.with_static_analysis(
                analysis,
                Duration::from_secs(config.static_analysis.timeout_secs),
                Duration::from_millis(config.static_analysis.poll_interval_ms),
            );
        }
        let dlc = DevelopmentLoopController::new(
            client,
            writer.clone(),
            config.max_rebuild_attempts,
            Arc::clone(&metrics),
        );

        info!(
            max_workers = config.max_workers,
            max_rebuild_attempts = config.max_rebuild_attempts,
            review_threshold = config.review_threshold,
            "orchestrator ready"
        );
        Ok(Arc::new(Self {
            gates: GateManager::new(boundary, config.hitl_timeout()),
            pool: WorkerPool::new(config.max_workers),
            config,
            writer,
            issues,
            changes,
            planner,
            reviewer,
            dlc,
            metrics,
        }))
    }

    /// Configuration in force
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Gate registry
    #[must_use]
    pub fn gates(&self) -> &GateManager {
        &self.gates
    }

    /// Artifact store
    #[must_use]
    pub fn store(&self) -> &Arc<dyn ArtifactStore> {
        self.writer.store()
    }

    /// Worker pool statistics
    #[must_use]
    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Create a task for a work item and start driving it
    #[instrument(skip_all, fields(source_ref = %source_ref))]
    pub async fn submit(self: &Arc<Self>, source_ref: SourceRef) -> Result<TaskId, WorkflowError> {
        let spec = self.issues.fetch(&source_ref).await?;
        let task = Task::new(source_ref, spec);
        let task = self
            .writer
            .retry("create_task", || self.store().create_task(task.clone()))
            .await?;
        self.writer
            .audit(
                AuditEvent::new(task.id, AuditEventType::TaskCreated, ACTOR)
                    .with_snapshots(None, Some(TaskSnapshot::of(&task).to_value()))
                    .with_detail(format!("{}: {}", task.source_ref, task.spec.summary)),
            )
            .await?;
        info!(task_id = %task.id, "task created");
        self.dispatch(task.id)?;
        Ok(task.id)
    }

    /// Submit every ready work item not already known
    ///
    /// A source reference is known if any task carries it, whatever its
    /// state. An item that cannot be submitted is logged and skipped so the
    /// rest of the batch still goes through.
    pub async fn ingest_ready(self: &Arc<Self>) -> Result<Vec<TaskId>, WorkflowError> {
        let ready = self.issues.list_ready().await?;
        let mut submitted = Vec::new();
        let mut skipped = 0_usize;
        for source_ref in ready {
            let known = self
                .writer
                .retry("find_by_source", || self.store().find_by_source(&source_ref))
                .await?;
            if let Some(existing) = known {
                debug!(source_ref = %source_ref, task_id = %existing.id, "work item already ingested");
                continue;
            }
            match self.submit(source_ref.clone()).await {
                Ok(task_id) => submitted.push(task_id),
                Err(e) => {
                    skipped += 1;
                    warn!(source_ref = %source_ref, error = %e, "work item skipped");
                }
            }
        }
        info!(count = submitted.len(), skipped, "ingested ready work items");
        Ok(submitted)
    }

    /// Re-dispatch a task from its last durable state
    pub async fn resume(self: &Arc<Self>, task_id: TaskId) -> Result<TaskState, WorkflowError> {
        let task = self.writer.load(task_id).await?;
        if task.state.is_terminal() {
            debug!(task_id = %task_id, state = %task.state, "resume of terminal task ignored");
            return Ok(task.state);
        }
        self.dispatch(task_id)?;
        Ok(task.state)
    }

    fn dispatch(self: &Arc<Self>, task_id: TaskId) -> Result<(), WorkflowError> {
        let this = Arc::clone(self);
        self.pool.submit(task_id, async move {
            match this.drive(task_id).await {
                Ok(state) => info!(task_id = %task_id, state = %state, "run finished"),
                Err(e @ WorkflowError::LeaseUnavailable { .. }) => warn!(task_id = %task_id, error = %e, "run skipped"),
                Err(e) => error!(task_id = %task_id, error = %e, "run stopped; task held in last durable state"),
            }
        })?;
        Ok(())
    }

    /// Wait for every dispatched run to finish
    pub async fn wait_idle(&self) {
        self.pool.drain().await;
    }

    /// Refuse new runs and wait for in-flight ones
    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }

    /// Run a task to a terminal state
    ///
    /// # Workflow
    /// 1. Acquire the task's lease (refused if another worker holds it)
    /// 2. Reload the task and renew the lease
    /// 3. Run the stage for the current state; its result is persisted
    ///    before the next iteration
    /// 4. On an unrecoverable error record `Failed` with the cause
    /// 5. Release the lease
    ///
    /// A stage whose result lost the race against `abandon` is discarded
    /// and the loop observes the terminal state.
    pub async fn drive(&self, task_id: TaskId) -> Result<TaskState, WorkflowError> {
        let owner = format!("worker-{}", Ulid::new());
        let mut lease = self.acquire_lease(task_id, &owner).await?;
        let result = self.run_stages(task_id, &owner, &mut lease).await;
        if let Err(e) = self
            .writer
            .retry("release_lease", || self.store().release_lease(&lease))
            .await
        {
            warn!(task_id = %task_id, error = %e, "lease release failed; it will lapse");
        }
        result
    }

    async fn acquire_lease(&self, task_id: TaskId, owner: &str) -> Result<Lease, WorkflowError> {
        let ttl = self.config.lease_ttl();
        match self
            .writer
            .retry("acquire_lease", || self.store().acquire_lease(task_id, owner, ttl))
            .await
        {
            Ok(lease) => Ok(lease),
            Err(WorkflowError::Store(StoreError::LeaseHeld { owner, .. })) => {
                Err(WorkflowError::LeaseUnavailable { task_id, owner })
            }
            Err(e) => Err(e),
        }
    }

    async fn run_stages(&self, task_id: TaskId, owner: &str, lease: &mut Lease) -> Result<TaskState, WorkflowError> {
        loop {
            let task = self.writer.load(task_id).await?;
            if task.state.is_terminal() {
                self.gates.forget(task_id);
                return Ok(task.state);
            }
            *lease = self.acquire_lease(task_id, owner).await?;

            let state = task.state;
            let started = Instant::now();
            let outcome = self.step(task, lease).await;
            self.metrics.stage_duration(stage_name(state), started.elapsed());

            match outcome {
                Ok(()) => {}
                Err(e) if e.is_stale() => {
                    debug!(task_id = %task_id, state = %state, error = %e, "stage result discarded");
                }
                Err(e @ WorkflowError::LeaseUnavailable { .. }) => return Err(e),
                Err(e) => {
                    error!(task_id = %task_id, state = %state, error = %e, "stage failed");
                    self.fail(task_id, FailureCause::new(e.cause_code(), e.to_string()))
                        .await?;
                }
            }
        }
    }

    async fn step(&self, task: Task, lease: &mut Lease) -> Result<(), WorkflowError> {
        match task.state {
            TaskState::Pending => self.transition(task, TaskState::Planning, None, |_| {}).await.map(drop),
            TaskState::Planning => self.plan_stage(task).await,
            TaskState::AwaitingPlanApproval => self.plan_gate(task, lease).await,
            TaskState::Developing | TaskState::RetryDeveloping => self.develop_stage(task).await,
            TaskState::Reviewing => self.review_stage(task).await,
            TaskState::AwaitingFinalApproval => self.final_gate(task, lease).await,
            TaskState::Finalizing => self.finalize(task).await,
            TaskState::Completed | TaskState::Failed | TaskState::Abandoned => Ok(()),
        }
    }

    #[instrument(skip_all, fields(task_id = %task.id, revision = task.plan_revisions + 1))]
    async fn plan_stage(&self, task: Task) -> Result<(), WorkflowError> {
        let request = PlanningRequest::new(task.id, task.spec.clone())
            .with_feedback(task.plan_revisions + 1, task.pending_feedback.clone());
        let planned = self.planner.plan(&request).await?;

        let k = self.planner.config().k_for(planned.plan.method);
        let coverage = verify_plan(&planned.plan, k);
        if !coverage.is_valid() {
            return Err(PlanningError::CoverageViolation(coverage).into());
        }

        let plan = planned.plan;
        self.writer
            .retry("put_plan", || self.store().put_plan(plan.clone()))
            .await?;
        let plan_id = plan.id;
        let recorded = AuditEvent::new(task.id, AuditEventType::PlanRecorded, ACTOR).with_detail(format!(
            "plan {} revision {} ({}, {} subtasks, aggregate {:.2}{})",
            plan.id,
            plan.revision,
            plan.method,
            plan.merged_subtasks.len(),
            plan.aggregate_score,
            if plan.low_confidence { ", low confidence" } else { "" },
        ));
        let task = self
            .transition_with(task, TaskState::AwaitingPlanApproval, None, vec![recorded], move |t| {
                t.plan_id = Some(plan_id);
                t.pending_feedback = None;
            })
            .await?;
        self.record_tokens(task.id, "planning", planned.usage).await
    }

    async fn plan_gate(&self, task: Task, lease: &mut Lease) -> Result<(), WorkflowError> {
        let plan = self.current_plan(&task).await?;
        let record = self
            .await_gate(&task, lease, GateName::PlanApproval, GateArtifact::Plan(Box::new(plan)))
            .await?;

        match self.config.gate_timeout_policy.interpret(&record) {
            GateOutcome::Approved => self.transition(task, TaskState::Developing, None, |_| {}).await.map(drop),
            GateOutcome::Rejected { feedback } => {
                let revisions = task.plan_revisions + 1;
                if revisions >= self.config.max_plan_revisions {
                    let cause = FailureCause::new(
                        CauseCode::PlanRejected,
                        format!("plan rejected {revisions} times"),
                    );
                    return self
                        .transition(task, TaskState::Failed, Some(cause), move |t| t.plan_revisions = revisions)
                        .await
                        .map(drop);
                }
                let feedback = feedback
                    .map(|text| Feedback::from_text(FeedbackOrigin::PlanGate, &text))
                    .filter(|f| !f.is_empty());
                self.transition(task, TaskState::Planning, None, move |t| {
                    t.plan_revisions = revisions;
                    t.pending_feedback = feedback;
                })
                .await
                .map(drop)
            }
            GateOutcome::TimedOut => {
                let cause = FailureCause::new(CauseCode::GateTimeout, "plan approval timed out");
                self.transition(task, TaskState::Failed, Some(cause), |_| {}).await.map(drop)
            }
        }
    }

    #[instrument(skip_all, fields(task_id = %task.id, attempt = task.next_attempt()))]
    async fn develop_stage(&self, task: Task) -> Result<(), WorkflowError> {
        let plan = self.current_plan(&task).await?;
        let developed = self.dlc.develop(&task, &plan).await?;
        let task = self.dlc.record_attempt(task, &developed.changeset).await?;

        let cs = &developed.changeset;
        let recorded = AuditEvent::new(task.id, AuditEventType::ChangeSetRecorded, ACTOR)
            .with_detail(format!("attempt {}: {} {}", cs.attempt_number, cs.id, cs.artifact_ref));
        let task = self
            .transition_with(task, TaskState::Reviewing, None, vec![recorded], |_| {})
            .await?;
        self.record_tokens(task.id, "development", developed.usage).await
    }

    #[instrument(skip_all, fields(task_id = %task.id, retry_count = task.retry_count))]
    async fn review_stage(&self, task: Task) -> Result<(), WorkflowError> {
        let plan = self.current_plan(&task).await?;
        let changeset = self.latest_changeset(&task).await?;
        let reviewed = self.reviewer.review(&task, &plan, &changeset).await?;
        let report = reviewed.report;
        self.writer
            .retry("put_review", || self.store().put_review(report.clone()))
            .await?;

        let (decision, task) = self.dlc.assess(task, &report).await?;
        let recorded = AuditEvent::new(task.id, AuditEventType::ReviewRecorded, ACTOR).with_detail(format!(
            "review {} of {}: aggregate {:.2}, threshold {:.2}, {}",
            report.id,
            report.changeset_id,
            report.aggregate_score,
            report.threshold,
            if report.passed { "passed" } else { "failed" },
        ));
        let task = match decision {
            LoopDecision::Proceed => {
                self.transition_with(task, TaskState::AwaitingFinalApproval, None, vec![recorded], |t| {
                    t.forced = false;
                    t.cause = None;
                })
                .await
            }
            LoopDecision::Retry => {
                let retry = self.retry_event(&task, "review failed");
                self.transition_with(task, TaskState::RetryDeveloping, None, vec![recorded, retry], |_| {})
                    .await
            }
            LoopDecision::Escalate => {
                let cause = FailureCause::new(
                    CauseCode::RebuildLimitExceeded,
                    format!(
                        "review failed {} times; escalated for a human decision",
                        task.retry_count
                    ),
                );
                warn!(task_id = %task.id, retry_count = task.retry_count, "retry budget spent, forcing final gate");
                self.transition_with(task, TaskState::AwaitingFinalApproval, Some(cause), vec![recorded], |t| {
                    t.forced = true;
                })
                .await
            }
        }?;
        self.record_tokens(task.id, "review", reviewed.usage).await
    }

    async fn final_gate(&self, task: Task, lease: &mut Lease) -> Result<(), WorkflowError> {
        let changeset = self.latest_changeset(&task).await?;
        let review = self
            .writer
            .retry("reviews_for_task", || self.store().reviews_for_task(task.id))
            .await?
            .into_iter()
            .rev()
            .find(|r| r.changeset_id == changeset.id)
            .ok_or_else(|| WorkflowError::MissingArtifact(format!("review of change set {}", changeset.id)))?;

        let artifact = GateArtifact::Final {
            changeset,
            review: Box::new(review),
            forced: task.forced,
            cause: task.cause.clone(),
        };
        let record = self
            .await_gate(&task, lease, GateName::FinalApproval, artifact)
            .await?;

        match self.config.gate_timeout_policy.interpret(&record) {
            GateOutcome::Approved => self.transition(task, TaskState::Finalizing, None, |_| {}).await.map(drop),
            GateOutcome::Rejected { feedback } => {
                let budget = self.dlc.max_rebuild_attempts();
                let retry_count = task.retry_count;
                match self.dlc.apply_final_rejection(task.clone(), feedback.as_deref()).await? {
                    Some(task) => {
                        let retry = self.retry_event(&task, "final change rejected");
                        self.transition_with(task, TaskState::RetryDeveloping, None, vec![retry], |t| {
                            t.forced = false;
                            t.cause = None;
                        })
                        .await
                        .map(drop)
                    }
                    None => {
                        let cause = FailureCause::new(
                            CauseCode::FinalRejected,
                            format!("final change rejected with no retries left ({retry_count} of {budget})"),
                        );
                        self.transition(task, TaskState::Failed, Some(cause), |_| {}).await.map(drop)
                    }
                }
            }
            GateOutcome::TimedOut => {
                let cause = FailureCause::new(CauseCode::GateTimeout, "final approval timed out");
                self.transition(task, TaskState::Failed, Some(cause), |_| {}).await.map(drop)
            }
        }
    }

    #[instrument(skip_all, fields(task_id = %task.id))]
    async fn finalize(&self, task: Task) -> Result<(), WorkflowError> {
        let changeset = self.latest_changeset(&task).await?;
        let delivery = self
            .deliver(&task, &changeset)
            .await
            .map_err(|e| WorkflowError::ChangeDelivery(e.to_string()))?;
        let delivered =
            AuditEvent::new(task.id, AuditEventType::Delivered, ACTOR).with_detail(delivery.change_request_url.clone());
        self.transition_with(task, TaskState::Completed, None, vec![delivered], move |t| {
            t.delivery = Some(delivery);
        })
        .await
        .map(drop)
    }

    async fn deliver(&self, task: &Task, changeset: &ChangeSet) -> Result<DeliveryRecord, ConnectorError> {
        let branch = self.changes.create_branch(task.id, &task.source_ref).await?;
        let commit = self.changes.commit_changes(&branch, changeset).await?;
        let change_request_url = self.changes.open_change_request(&branch, task, changeset).await?;
        info!(task_id = %task.id, branch = %branch, url = %change_request_url, "change delivered");
        Ok(DeliveryRecord {
            branch,
            commit,
            change_request_url,
            delivered_at: Utc::now(),
        })
    }

    async fn transition<F>(
        &self,
        task: Task,
        to: TaskState,
        cause: Option<FailureCause>,
        mutate: F,
    ) -> Result<Task, WorkflowError>
    where
        F: FnOnce(&mut Task),
    {
        self.transition_with(task, to, cause, Vec::new(), mutate).await
    }

    /// Validate and CAS-write one transition
    ///
    /// `records` and the transition event are appended in the same store
    /// write as the task, records first, so the audit trail never lags the
    /// task row.
    async fn transition_with<F>(
        &self,
        task: Task,
        to: TaskState,
        cause: Option<FailureCause>,
        records: Vec<AuditEvent>,
        mutate: F,
    ) -> Result<Task, WorkflowError>
    where
        F: FnOnce(&mut Task),
    {
        let from = task.state;
        validate_transition(from, to)?;
        let recorded_cause = cause.clone();
        let written = self
            .writer
            .cas_audited(
                task,
                ACTOR,
                move |t| {
                    t.state = to;
                    if let Some(cause) = recorded_cause {
                        t.cause = Some(cause);
                    }
                    mutate(t);
                },
                move |before, after| {
                    let mut event = AuditEvent::new(after.id, AuditEventType::Transition, ACTOR)
                        .with_transition(from, to)
                        .with_snapshots(
                            Some(TaskSnapshot::of(before).to_value()),
                            Some(TaskSnapshot::of(after).to_value()),
                        );
                    if let Some(cause) = cause {
                        event = event.with_cause(cause);
                    }
                    let mut events = records;
                    events.push(event);
                    events
                },
            )
            .await?;

        self.metrics.transition(from, to);
        info!(task_id = %written.id, from = %from, to = %to, "transition");
        self.report_status(&written);
        Ok(written)
    }

    /// Best-effort, never awaited
    fn report_status(&self, task: &Task) {
        let issues = Arc::clone(&self.issues);
        let (task_id, source_ref, state, cause) =
            (task.id, task.source_ref.clone(), task.state, task.cause.clone());
        tokio::spawn(async move {
            if let Err(e) = issues
                .report_status(task_id, &source_ref, state, cause.as_ref())
                .await
            {
                warn!(task_id = %task_id, state = %state, error = %e, "status report failed");
            }
        });
    }

    /// Record `Failed`, unless the task already reached a terminal state
    pub async fn fail(&self, task_id: TaskId, cause: FailureCause) -> Result<TaskState, WorkflowError> {
        self.terminate(task_id, TaskState::Failed, cause).await
    }

    /// Abandon a task, possibly while a stage is running
    ///
    /// Open gates are cancelled; any stage result arriving later is
    /// discarded. Abandoning a terminal task reports its state.
    #[instrument(skip(self, reason), fields(task_id = %task_id))]
    pub async fn abandon(&self, task_id: TaskId, reason: &str) -> Result<TaskState, WorkflowError> {
        let state = self
            .terminate(task_id, TaskState::Abandoned, FailureCause::new(CauseCode::Abandoned, reason))
            .await?;
        if state == TaskState::Abandoned {
            self.gates.cancel(task_id);
            self.gates.forget(task_id);
        }
        Ok(state)
    }

    async fn terminate(&self, task_id: TaskId, to: TaskState, cause: FailureCause) -> Result<TaskState, WorkflowError> {
        loop {
            let task = self.writer.load(task_id).await?;
            if task.state.is_terminal() {
                debug!(task_id = %task_id, state = %task.state, "already terminal");
                return Ok(task.state);
            }
            match self.transition(task, to, Some(cause.clone()), |_| {}).await {
                Ok(task) => return Ok(task.state),
                Err(e) if e.is_stale() => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Human callback for an open gate
    ///
    /// Only approve and reject are accepted; timeouts are the gate's own.
    pub fn resolve_gate(
        &self,
        task_id: TaskId,
        gate: GateName,
        decision: Decision,
        feedback: Option<String>,
        decided_by: &str,
    ) -> Result<ResolveOutcome, WorkflowError> {
        if decision == Decision::Timeout {
            return Err(WorkflowError::InvalidDecision(decision));
        }
        let resolution = Resolution {
            decision,
            feedback,
            decided_by: decided_by.to_string(),
            round: None,
        };
        Ok(self.gates.resolve(task_id, gate, resolution))
    }

    /// Register, present and wait out one gate, then persist its decision
    ///
    /// The task is re-read after the slot is registered: an `abandon` that
    /// landed earlier found nothing to cancel, so the gate is withdrawn
    /// before anyone sees it.
    async fn await_gate(
        &self,
        task: &Task,
        lease: &mut Lease,
        gate: GateName,
        artifact: GateArtifact,
    ) -> Result<ApprovalRecord, WorkflowError> {
        let pending = self.gates.register(task.id, gate)?;
        let current = self.writer.load(task.id).await?;
        if current.state.is_terminal() {
            self.gates.cancel(task.id);
            debug!(task_id = %task.id, gate = %gate, state = %current.state, "gate withdrawn");
            return Err(WorkflowError::Stale {
                task_id: task.id,
                state: current.state,
            });
        }

        let mut detail = gate.to_string();
        if task.forced {
            detail.push_str(" (forced)");
        }
        self.writer
            .audit(AuditEvent::new(task.id, AuditEventType::GateOpened, ACTOR).with_detail(detail))
            .await?;

        let record = self
            .holding_lease(task.id, lease, self.gates.wait(pending, artifact))
            .await??;
        self.record_decision(&record).await?;
        Ok(record)
    }

    /// Drive `work` while renewing the task's lease every half TTL
    ///
    /// Losing the lease to another owner abandons `work`; a renewal that
    /// fails for any other reason is logged and retried on the next tick.
    async fn holding_lease<T>(
        &self,
        task_id: TaskId,
        lease: &mut Lease,
        work: impl Future<Output = T>,
    ) -> Result<T, WorkflowError> {
        let period = self.config.lease_ttl() / 2;
        let owner = lease.owner.clone();
        let mut renew = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        tokio::pin!(work);
        loop {
            tokio::select! {
                out = &mut work => return Ok(out),
                _ = renew.tick() => match self.acquire_lease(task_id, &owner).await {
                    Ok(renewed) => *lease = renewed,
                    Err(e @ WorkflowError::LeaseUnavailable { .. }) => return Err(e),
                    Err(e) => warn!(task_id = %task_id, error = %e, "lease renewal failed"),
                },
            }
        }
    }

    async fn record_decision(&self, record: &ApprovalRecord) -> Result<(), WorkflowError> {
        self.writer
            .retry("put_approval", || self.store().put_approval(record.clone()))
            .await?;
        let mut detail = format!(
            "{} round {}: {} by {}",
            record.gate, record.round, record.decision, record.decided_by
        );
        if let Some(feedback) = &record.feedback {
            detail.push_str(": ");
            detail.push_str(feedback);
        }
        self.writer
            .audit(AuditEvent::new(record.task_id, AuditEventType::GateResolved, record.decided_by.clone()).with_detail(detail))
            .await?;
        self.metrics.gate_resolved(record.gate, record.decision);
        Ok(())
    }

    /// Current status of a task
    pub async fn status(&self, task_id: TaskId) -> Result<TaskStatus, WorkflowError> {
        let task = self.writer.load(task_id).await?;
        let open_gate = [GateName::PlanApproval, GateName::FinalApproval]
            .into_iter()
            .find(|&g| self.gates.is_open(task_id, g));
        Ok(TaskStatus {
            task_id: task.id,
            source_ref: task.source_ref,
            state: task.state,
            retry_count: task.retry_count,
            forced: task.forced,
            cause: task.cause.map(|c| c.to_string()),
            plan_id: task.plan_id,
            changeset_ids: task.changeset_ids,
            plan_revisions: task.plan_revisions,
            change_request_url: task.delivery.map(|d| d.change_request_url),
            open_gate,
        })
    }

    /// Read model projected from the whole audit trail
    pub async fn dashboard(&self) -> Result<DashboardView, WorkflowError> {
        let events = self
            .writer
            .retry("audit_since", || self.store().audit_since(DateTime::<Utc>::MIN_UTC))
            .await?;
        Ok(DashboardView::project(&events))
    }

    /// Check the audit hash chain
    pub async fn verify_audit(&self) -> Result<(), WorkflowError> {
        self.writer
            .retry("verify_audit", || self.store().verify_audit())
            .await
    }

    async fn current_plan(&self, task: &Task) -> Result<Plan, WorkflowError> {
        let plan_id = task
            .plan_id
            .ok_or_else(|| WorkflowError::MissingArtifact(format!("plan for task {}", task.id)))?;
        self.writer
            .retry("get_plan", || self.store().get_plan(plan_id))
            .await
    }

    async fn latest_changeset(&self, task: &Task) -> Result<ChangeSet, WorkflowError> {
        let id = task
            .latest_changeset()
            .ok_or_else(|| WorkflowError::MissingArtifact(format!("change set for task {}", task.id)))?;
        self.writer
            .retry("get_changeset", || self.store().get_changeset(id))
            .await
    }

    fn retry_event(&self, task: &Task, reason: &str) -> AuditEvent {
        AuditEvent::new(task.id, AuditEventType::RetryRecorded, ACTOR)
            .with_snapshots(None, Some(TaskSnapshot::of(task).to_value()))
            .with_detail(format!(
                "{reason}; retry {} of {}",
                task.retry_count,
                self.dlc.max_rebuild_attempts()
            ))
    }

    async fn record_tokens(&self, task_id: TaskId, stage: &str, usage: TokenUsage) -> Result<(), WorkflowError> {
        if usage.is_zero() {
            return Ok(());
        }
        let totals = json!({
            "prompt_tokens": usage.prompt_tokens,
            "completion_tokens": usage.completion_tokens,
            "total_tokens": usage.total(),
        });
        self.writer
            .audit(
                AuditEvent::new(task_id, AuditEventType::TokenUsage, ACTOR)
                    .with_snapshots(None, Some(totals))
                    .with_detail(stage.to_string()),
            )
            .await
            .map(drop)
    }
}
