//! End-to-end workflow behaviour over in-memory collaborators

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mockall::mock;
use pretty_assertions::assert_eq;
use sdo_artifact::{
    AnalysisStatus, ApprovalRecord, ArtifactStore, AuditEvent, AuditEventType, CauseCode, ChangeSet,
    ChangeSetId, Decision, GateName, InMemoryArtifactStore, Lease, Plan, PlanId, ReviewDimension,
    ReviewId, ReviewReport, SourceRef, StoreError, Task, TaskId, TaskSpec, TaskState,
};
use sdo_core::connectors::{
    AnalysisResult, ChangeHost, DeliveryStep, InMemoryIssueSource, IssueSource, ScriptedStaticAnalysis,
    StaticAnalysis,
};
use sdo_core::error::ConnectorError;
use sdo_core::orchestrator::{Collaborators, WorkflowOrchestrator};
use sdo_core::simulator::{simulation_responder, PLAN_FEEDBACK};
use sdo_core::WorkflowError;
use sdo_generation::{ScriptedGenerationService, Template};
use sdo_kernel::{
    ChannelBoundary, GateArtifact, Presentation, RecordingMetrics, ResolveOutcome, TimeoutPolicy,
};
use sdo_test_utils::{spec_with, test_config, TestEngine, CHAIN_MARKER, FAIL_REVIEW_MARKER};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

const GATE_WAIT: Duration = Duration::from_secs(5);

fn approve(engine: &TestEngine, task_id: TaskId, gate: GateName) -> ResolveOutcome {
    engine
        .orchestrator
        .resolve_gate(task_id, gate, Decision::Approve, None, "reviewer")
        .unwrap()
}

fn reject(engine: &TestEngine, task_id: TaskId, gate: GateName, feedback: &str) -> ResolveOutcome {
    engine
        .orchestrator
        .resolve_gate(task_id, gate, Decision::Reject, Some(feedback.to_string()), "reviewer")
        .unwrap()
}

async fn audit_types(store: &InMemoryArtifactStore, task_id: TaskId) -> Vec<AuditEventType> {
    store
        .audit_for_task(task_id)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.event_type)
        .collect()
}

#[tokio::test]
async fn approved_task_is_delivered() {
    let mut engine = TestEngine::new();
    let resolver = engine.auto_resolve();
    let id = engine.submit("APP-1", spec_with("Add retry header", &[CHAIN_MARKER])).await;
    engine.orchestrator.wait_idle().await;
    resolver.abort();

    let status = engine.orchestrator.status(id).await.unwrap();
    assert_eq!(status.state, TaskState::Completed);
    assert_eq!(status.retry_count, 0);
    assert!(!status.forced);
    assert_eq!(status.changeset_ids.len(), 1);
    assert_eq!(status.open_gate, None);

    let deliveries = engine.changes.deliveries();
    assert_eq!(deliveries.len(), 1);
    assert_eq!(status.change_request_url.as_deref(), Some(deliveries[0].url.as_str()));

    let types = audit_types(&engine.store, id).await;
    assert_eq!(types.first(), Some(&AuditEventType::TaskCreated));
    assert!(types.contains(&AuditEventType::PlanRecorded));
    assert!(types.contains(&AuditEventType::ReviewRecorded));
    // the delivery record is written together with the completing transition
    assert_eq!(
        &types[types.len() - 2..],
        &[AuditEventType::Delivered, AuditEventType::Transition]
    );
    assert_eq!(engine.orchestrator.gates().tracked(), 0);
    assert_eq!(engine.metrics.transitions_into(TaskState::Completed), 1);
}

#[tokio::test]
async fn status_reports_reach_the_issue_source() {
    let mut engine = TestEngine::new();
    let resolver = engine.auto_resolve();
    let id = engine.submit("APP-2", spec_with("Trim logs", &[])).await;
    engine.orchestrator.wait_idle().await;
    resolver.abort();
    assert_eq!(engine.state(id).await, TaskState::Completed);

    // reports are fire-and-forget; give the spawned senders a moment
    let source_ref = SourceRef::new("APP-2");
    let reported = tokio::time::timeout(GATE_WAIT, async {
        loop {
            if engine.issues.states_for(&source_ref).contains(&TaskState::Completed) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(reported.is_ok());
}

#[tokio::test]
async fn failing_reviews_force_the_final_gate() {
    let mut engine = TestEngine::new();
    let id = engine.submit("APP-3", spec_with("Harden parser", &[FAIL_REVIEW_MARKER])).await;

    let plan_gate = engine.next_gate(GATE_WAIT).await;
    assert_eq!(plan_gate.gate, GateName::PlanApproval);
    approve(&engine, id, GateName::PlanApproval);

    let final_gate = engine.next_gate(GATE_WAIT).await;
    assert_eq!(final_gate.gate, GateName::FinalApproval);
    match &final_gate.artifact {
        GateArtifact::Final { forced, cause, review, .. } => {
            assert!(*forced);
            assert_eq!(cause.as_ref().map(|c| c.code), Some(CauseCode::RebuildLimitExceeded));
            assert!(!review.passed);
        }
        other => panic!("expected final artifact, got {other:?}"),
    }
    assert_eq!(engine.generation.call_count(Template::DevelopChange), 1);
    assert_eq!(engine.generation.call_count(Template::ReviseChange), 2);

    // revisions carry the previous review's mistakes
    let revise = engine.generation.calls_for(Template::ReviseChange);
    assert!(revise[0].get_str("feedback").unwrap().contains("requirements not met"));

    approve(&engine, id, GateName::FinalApproval);
    engine.orchestrator.wait_idle().await;

    let status = engine.orchestrator.status(id).await.unwrap();
    assert_eq!(status.state, TaskState::Completed);
    assert_eq!(status.retry_count, 3);
    assert!(status.forced);
    assert_eq!(status.changeset_ids.len(), 3);
    assert_eq!(engine.metrics.retries(), 2);
}

#[tokio::test]
async fn rejected_plan_is_replanned_with_feedback() {
    let mut engine = TestEngine::new();
    let id = engine.submit("APP-4", spec_with("Add export", &[CHAIN_MARKER])).await;

    let first = engine.next_gate(GATE_WAIT).await;
    assert_eq!(first.round, 1);
    assert!(matches!(reject(&engine, id, GateName::PlanApproval, PLAN_FEEDBACK), ResolveOutcome::Applied(_)));

    let second = engine.next_gate(GATE_WAIT).await;
    assert_eq!(second.gate, GateName::PlanApproval);
    assert_eq!(second.round, 2);
    let status = engine.orchestrator.status(id).await.unwrap();
    assert_eq!(status.state, TaskState::AwaitingPlanApproval);
    assert_eq!(status.plan_revisions, 1);

    let generated = engine.generation.calls_for(Template::ChainCandidates);
    assert_eq!(generated.len(), 2);
    assert_eq!(generated[0].get_str("feedback"), None);
    assert!(generated[1].get_str("feedback").unwrap().contains(PLAN_FEEDBACK));

    approve(&engine, id, GateName::PlanApproval);
    let final_gate = engine.next_gate(GATE_WAIT).await;
    approve(&engine, final_gate.task_id, GateName::FinalApproval);
    engine.orchestrator.wait_idle().await;
    assert_eq!(engine.state(id).await, TaskState::Completed);

    let events = engine.store.audit_for_task(id).await.unwrap();
    assert!(events.iter().any(|e| e.from_state == Some(TaskState::AwaitingPlanApproval)
        && e.to_state == Some(TaskState::Planning)));
}

#[tokio::test]
async fn repeated_plan_rejection_fails_the_task() {
    let mut engine = TestEngine::new();
    let id = engine.submit("APP-5", spec_with("Rewrite cache", &[CHAIN_MARKER])).await;
    for _ in 0..3 {
        engine.next_gate(GATE_WAIT).await;
        reject(&engine, id, GateName::PlanApproval, "still wrong");
    }
    engine.orchestrator.wait_idle().await;

    let status = engine.orchestrator.status(id).await.unwrap();
    assert_eq!(status.state, TaskState::Failed);
    assert_eq!(status.plan_revisions, 3);
    assert!(status.cause.unwrap().starts_with("plan_rejected"));
}

#[tokio::test]
async fn final_rejection_counts_as_a_retry() {
    let mut engine = TestEngine::new();
    let id = engine.submit("APP-6", spec_with("Add pagination", &[CHAIN_MARKER])).await;
    engine.next_gate(GATE_WAIT).await;
    approve(&engine, id, GateName::PlanApproval);

    engine.next_gate(GATE_WAIT).await;
    reject(&engine, id, GateName::FinalApproval, "tighten input validation");

    let second = engine.next_gate(GATE_WAIT).await;
    assert_eq!(second.gate, GateName::FinalApproval);
    assert_eq!(second.round, 2);
    let revise = engine.generation.calls_for(Template::ReviseChange);
    assert_eq!(revise.len(), 1);
    assert!(revise[0].get_str("feedback").unwrap().contains("tighten input validation"));

    approve(&engine, id, GateName::FinalApproval);
    engine.orchestrator.wait_idle().await;
    let status = engine.orchestrator.status(id).await.unwrap();
    assert_eq!(status.state, TaskState::Completed);
    assert_eq!(status.retry_count, 1);
    assert!(audit_types(&engine.store, id).await.contains(&AuditEventType::RetryRecorded));
}

#[tokio::test]
async fn final_rejection_without_budget_fails() {
    let mut engine = TestEngine::with(
        test_config().with_max_rebuild_attempts(1),
        sdo_test_utils::simulated_generation(),
        None,
    );
    let id = engine.submit("APP-7", spec_with("Tune pool", &[FAIL_REVIEW_MARKER])).await;
    engine.next_gate(GATE_WAIT).await;
    approve(&engine, id, GateName::PlanApproval);
    engine.next_gate(GATE_WAIT).await;
    reject(&engine, id, GateName::FinalApproval, "no");
    engine.orchestrator.wait_idle().await;

    let status = engine.orchestrator.status(id).await.unwrap();
    assert_eq!(status.state, TaskState::Failed);
    assert!(status.cause.unwrap().starts_with("final_rejected"));
}

#[tokio::test]
async fn abandon_at_gate_cancels_it() {
    let mut engine = TestEngine::new();
    let id = engine.submit("APP-8", spec_with("Drop legacy flag", &[CHAIN_MARKER])).await;
    engine.next_gate(GATE_WAIT).await;
    assert!(engine.orchestrator.gates().is_open(id, GateName::PlanApproval));

    let state = engine.orchestrator.abandon(id, "no longer needed").await.unwrap();
    assert_eq!(state, TaskState::Abandoned);
    engine.orchestrator.wait_idle().await;

    let status = engine.orchestrator.status(id).await.unwrap();
    assert_eq!(status.state, TaskState::Abandoned);
    assert_eq!(status.open_gate, None);
    assert!(status.cause.unwrap().contains("no longer needed"));
    assert_eq!(engine.orchestrator.gates().tracked(), 0);
    assert_eq!(approve(&engine, id, GateName::PlanApproval), ResolveOutcome::Unknown);

    // terminal tasks stay put
    assert_eq!(engine.orchestrator.abandon(id, "again").await.unwrap(), TaskState::Abandoned);
    assert_eq!(engine.orchestrator.resume(id).await.unwrap(), TaskState::Abandoned);
}

#[tokio::test]
async fn abandon_in_flight_discards_late_result() {
    let generation = Arc::new(
        ScriptedGenerationService::new()
            .with_responder(simulation_responder())
            .with_latency(Duration::from_millis(50)),
    );
    let engine = TestEngine::with(test_config(), generation, None);
    let id = engine.submit("APP-9", spec_with("Slow plan", &[CHAIN_MARKER])).await;

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(engine.orchestrator.abandon(id, "cancelled upstream").await.unwrap(), TaskState::Abandoned);
    engine.orchestrator.wait_idle().await;

    assert_eq!(engine.state(id).await, TaskState::Abandoned);
    let types = audit_types(&engine.store, id).await;
    assert!(types.contains(&AuditEventType::StaleResultDiscarded));
    assert!(!types.contains(&AuditEventType::PlanRecorded));
    assert_eq!(engine.generation.call_count(Template::DevelopChange), 0);
}

#[tokio::test]
async fn delivery_failure_fails_the_task() {
    let mut engine = TestEngine::new();
    engine.changes.fail_at(Some(DeliveryStep::ChangeRequest));
    let resolver = engine.auto_resolve();
    let id = engine.submit("APP-10", spec_with("Ship it", &[CHAIN_MARKER])).await;
    engine.orchestrator.wait_idle().await;
    resolver.abort();

    let status = engine.orchestrator.status(id).await.unwrap();
    assert_eq!(status.state, TaskState::Failed);
    assert!(status.cause.unwrap().starts_with("change_delivery"));
    assert!(engine.changes.deliveries().is_empty());
}

#[tokio::test]
async fn store_outage_holds_task_until_resumed() {
    let mut config = test_config();
    config.lease_ttl_secs = 1;
    let mut engine = TestEngine::with(config, sdo_test_utils::simulated_generation(), None);
    let id = engine.submit("APP-11", spec_with("Outage", &[CHAIN_MARKER])).await;
    engine.next_gate(GATE_WAIT).await;
    approve(&engine, id, GateName::PlanApproval);
    engine.next_gate(GATE_WAIT).await;

    engine.store.set_unavailable(true);
    approve(&engine, id, GateName::FinalApproval);
    engine.orchestrator.wait_idle().await;
    engine.store.set_unavailable(false);

    // the run stopped without recording a failure
    assert_eq!(engine.state(id).await, TaskState::AwaitingFinalApproval);
    let dashboard = engine.orchestrator.dashboard().await.unwrap();
    assert_eq!(dashboard.task(id).unwrap().state, TaskState::AwaitingFinalApproval);

    // the stopped run could not release its lease; wait for it to lapse
    tokio::time::sleep(Duration::from_millis(1_100)).await;
    assert_eq!(engine.orchestrator.resume(id).await.unwrap(), TaskState::AwaitingFinalApproval);
    let reopened = engine.next_gate(GATE_WAIT).await;
    assert_eq!(reopened.round, 2);
    approve(&engine, id, GateName::FinalApproval);
    engine.orchestrator.wait_idle().await;
    assert_eq!(engine.state(id).await, TaskState::Completed);
}

#[tokio::test]
async fn held_lease_refuses_a_second_worker() {
    let engine = TestEngine::new();
    let task = engine
        .store
        .create_task(Task::new(SourceRef::new("APP-12"), TaskSpec::new("Leased", "")))
        .await
        .unwrap();
    engine
        .store
        .acquire_lease(task.id, "other-worker", Duration::from_secs(60))
        .await
        .unwrap();

    let err = engine.orchestrator.drive(task.id).await.unwrap_err();
    match err {
        WorkflowError::LeaseUnavailable { owner, .. } => assert_eq!(owner, "other-worker"),
        other => panic!("expected lease refusal, got {other}"),
    }
    assert_eq!(engine.state(task.id).await, TaskState::Pending);
}

#[tokio::test(start_paused = true)]
async fn gate_timeout_fails_under_fail_policy() {
    let engine = TestEngine::with(
        test_config().with_gate_timeout_policy(TimeoutPolicy::Fail),
        sdo_test_utils::simulated_generation(),
        None,
    );
    let id = engine.submit("APP-13", spec_with("Nobody looks", &[CHAIN_MARKER])).await;
    engine.orchestrator.wait_idle().await;

    let status = engine.orchestrator.status(id).await.unwrap();
    assert_eq!(status.state, TaskState::Failed);
    assert!(status.cause.unwrap().starts_with("gate_timeout"));
}

#[tokio::test(start_paused = true)]
async fn gate_timeout_rejects_under_reject_policy() {
    let engine = TestEngine::new();
    let id = engine.submit("APP-14", spec_with("Nobody looks", &[CHAIN_MARKER])).await;
    engine.orchestrator.wait_idle().await;

    // every timeout is a rejection, so the revision budget runs out
    let status = engine.orchestrator.status(id).await.unwrap();
    assert_eq!(status.state, TaskState::Failed);
    assert_eq!(status.plan_revisions, 3);
    assert!(status.cause.unwrap().starts_with("plan_rejected"));
    assert_eq!(engine.generation.call_count(Template::ChainCandidates), 3);
}

#[tokio::test]
async fn gate_resolution_is_idempotent() {
    let mut engine = TestEngine::new();
    let id = engine.submit("APP-15", spec_with("Twice", &[CHAIN_MARKER])).await;
    engine.next_gate(GATE_WAIT).await;

    let err = engine
        .orchestrator
        .resolve_gate(id, GateName::PlanApproval, Decision::Timeout, None, "reviewer")
        .unwrap_err();
    assert!(matches!(err, WorkflowError::InvalidDecision(Decision::Timeout)));

    assert!(matches!(approve(&engine, id, GateName::PlanApproval), ResolveOutcome::Applied(_)));
    assert!(matches!(
        reject(&engine, id, GateName::PlanApproval, "too late"),
        ResolveOutcome::AlreadyResolved(_)
    ));

    engine.next_gate(GATE_WAIT).await;
    engine.orchestrator.abandon(id, "done testing").await.unwrap();
    engine.orchestrator.wait_idle().await;
    let approvals = engine.store.approvals_for_task(id).await.unwrap();
    assert_eq!(approvals.len(), 1);
    assert_eq!(approvals[0].decision, Decision::Approve);
}

#[tokio::test]
async fn ingest_skips_known_work_items() {
    let mut engine = TestEngine::new();
    let resolver = engine.auto_resolve();
    engine.issues.add("ING-1", spec_with("First", &[CHAIN_MARKER]));
    engine.issues.add("ING-2", spec_with("Second", &[]));
    let first = engine.orchestrator.ingest_ready().await.unwrap();
    assert_eq!(first.len(), 2);

    // re-listing a known ref is a no-op
    engine.issues.add("ING-1", spec_with("First", &[CHAIN_MARKER]));
    engine.issues.add("ING-3", spec_with("Third", &[CHAIN_MARKER]));
    let second = engine.orchestrator.ingest_ready().await.unwrap();
    assert_eq!(second.len(), 1);

    engine.orchestrator.wait_idle().await;
    resolver.abort();
    assert_eq!(engine.store.list_tasks().await.unwrap().len(), 3);
}

#[tokio::test]
async fn static_analysis_is_blended_into_review() {
    let mut config = test_config();
    config.static_analysis.poll_interval_ms = 5;
    let analysis = Arc::new(ScriptedStaticAnalysis::ready_after(
        2,
        AnalysisResult {
            score: 60.0,
            findings: vec!["unchecked index in parser".to_string()],
        },
    ));
    let mut engine = TestEngine::with(
        config,
        sdo_test_utils::simulated_generation(),
        Some(analysis.clone() as Arc<dyn StaticAnalysis>),
    );
    let resolver = engine.auto_resolve();
    let id = engine.submit("APP-16", spec_with("Analyzed", &[CHAIN_MARKER])).await;
    engine.orchestrator.wait_idle().await;
    resolver.abort();

    assert_eq!(engine.state(id).await, TaskState::Completed);
    assert_eq!(analysis.submitted().len(), 1);
    let reviews = engine.store.reviews_for_task(id).await.unwrap();
    let security = reviews[0]
        .dimensions
        .iter()
        .find(|d| d.dimension == ReviewDimension::Security)
        .unwrap();
    assert_eq!(security.analysis, AnalysisStatus::Available(60.0));
    assert!((security.score - 74.0).abs() < 1e-9);

    let prompt = &engine.generation.calls_for(Template::EvaluateSecurity)[0];
    assert_eq!(prompt.get_str("analysis_findings"), Some("unchecked index in parser"));
}

#[tokio::test]
async fn audit_chain_and_dashboard_cover_every_task() {
    let mut engine = TestEngine::new();
    let resolver = engine.auto_resolve();
    engine.issues.add("DB-1", spec_with("One", &[CHAIN_MARKER]));
    engine.issues.add("DB-2", spec_with("Two", &[]));
    tokio_test::assert_ok!(engine.orchestrator.ingest_ready().await);
    engine.orchestrator.wait_idle().await;
    resolver.abort();

    tokio_test::assert_ok!(engine.orchestrator.verify_audit().await);
    let dashboard = engine.orchestrator.dashboard().await.unwrap();
    assert_eq!(dashboard.count(TaskState::Completed), 2);
    assert_eq!(dashboard.success_rate(), Some(1.0));
    assert!(dashboard.total_tokens() > 0);
}

mock! {
    Host {}

    #[async_trait]
    impl ChangeHost for Host {
        async fn create_branch(&self, task_id: TaskId, source_ref: &SourceRef) -> Result<String, ConnectorError>;
        async fn commit_changes(&self, branch: &str, changeset: &ChangeSet) -> Result<String, ConnectorError>;
        async fn open_change_request(&self, branch: &str, task: &Task, changeset: &ChangeSet) -> Result<String, ConnectorError>;
    }
}

fn collaborators(
    issues: Arc<dyn IssueSource>,
    changes: Arc<dyn ChangeHost>,
) -> (Collaborators, UnboundedReceiver<Presentation>) {
    let (boundary, presentations) = ChannelBoundary::new();
    let collaborators = Collaborators {
        store: Arc::new(InMemoryArtifactStore::new()),
        generation: sdo_test_utils::simulated_generation(),
        issues,
        changes,
        boundary: Arc::new(boundary),
        metrics: Arc::new(RecordingMetrics::new()),
        static_analysis: None,
    };
    (collaborators, presentations)
}

#[tokio::test]
async fn delivery_calls_each_change_host_step_once() {
    let mut host = MockHost::new();
    host.expect_create_branch()
        .times(1)
        .returning(|_, source_ref| Ok(format!("sdo/{source_ref}")));
    host.expect_commit_changes()
        .times(1)
        .returning(|branch, _| {
            assert_eq!(branch, "sdo/MOCK-1");
            Ok("c0ffee".to_string())
        });
    host.expect_open_change_request()
        .times(1)
        .returning(|_, _, _| Ok("https://example.test/cr/1".to_string()));

    let issues = Arc::new(InMemoryIssueSource::new());
    let source_ref = issues.add("MOCK-1", spec_with("Mocked", &[CHAIN_MARKER]));
    let (collaborators, presentations) = collaborators(issues, Arc::new(host));
    let orchestrator = WorkflowOrchestrator::new(test_config(), collaborators).unwrap();
    let resolver = tokio::spawn(sdo_core::simulator::auto_resolve(Arc::clone(&orchestrator), presentations));

    let id = orchestrator.submit(source_ref).await.unwrap();
    orchestrator.wait_idle().await;
    resolver.abort();

    let status = orchestrator.status(id).await.unwrap();
    assert_eq!(status.state, TaskState::Completed);
    assert_eq!(status.change_request_url.as_deref(), Some("https://example.test/cr/1"));
}

#[tokio::test]
async fn unknown_work_item_is_not_created() {
    let (collaborators, _presentations) =
        collaborators(Arc::new(InMemoryIssueSource::new()), Arc::new(MockHost::new()));
    let store = Arc::clone(&collaborators.store);
    let orchestrator = WorkflowOrchestrator::new(test_config(), collaborators).unwrap();

    let err = orchestrator.submit(SourceRef::new("GONE-1")).await.unwrap_err();
    assert!(matches!(err, WorkflowError::Connector(ConnectorError::NotFound { .. })));
    assert!(store.list_tasks().await.unwrap().is_empty());
}

#[tokio::test]
async fn rejected_final_change_cannot_push_retries_past_the_budget() {
    let generation = sdo_test_utils::simulated_generation();
    let failing = json!({
        "score": 40.0,
        "critical": true,
        "mistakes": ["requirements not met"],
        "reasoning": "incomplete",
    });
    let passing = json!({ "score": 88.0, "critical": false, "mistakes": [], "reasoning": "complete" });
    for answer in [&failing, &failing, &passing, &failing] {
        generation.push_json(Template::EvaluateCompleteness, answer.clone());
    }
    let mut engine = TestEngine::with(test_config(), generation, None);
    let budget = engine.orchestrator.config().max_rebuild_attempts;
    let id = engine.submit("APP-17", spec_with("Bounded rework", &[CHAIN_MARKER])).await;
    engine.next_gate(GATE_WAIT).await;
    approve(&engine, id, GateName::PlanApproval);

    let first = engine.next_gate(GATE_WAIT).await;
    assert!(matches!(first.artifact, GateArtifact::Final { forced: false, .. }));
    assert_eq!(engine.orchestrator.status(id).await.unwrap().retry_count, budget - 1);
    reject(&engine, id, GateName::FinalApproval, "redo");

    // the rejection spent the last retry; the failed rework escalates
    let second = engine.next_gate(GATE_WAIT).await;
    assert_eq!(second.round, 2);
    match &second.artifact {
        GateArtifact::Final { forced, cause, .. } => {
            assert!(*forced);
            assert_eq!(cause.as_ref().map(|c| c.code), Some(CauseCode::RebuildLimitExceeded));
        }
        other => panic!("expected final artifact, got {other:?}"),
    }
    let status = engine.orchestrator.status(id).await.unwrap();
    assert_eq!(status.retry_count, budget);
    assert_eq!(status.changeset_ids.len(), 4);

    reject(&engine, id, GateName::FinalApproval, "still wrong");
    engine.orchestrator.wait_idle().await;
    let status = engine.orchestrator.status(id).await.unwrap();
    assert_eq!(status.state, TaskState::Failed);
    assert_eq!(status.retry_count, budget);
    assert!(status.cause.unwrap().starts_with("final_rejected"));
    assert_eq!(
        engine.generation.call_count(Template::DevelopChange) + engine.generation.call_count(Template::ReviseChange),
        4
    );
}

#[tokio::test]
async fn dashboard_matches_status_after_write_failures() {
    let mut engine = TestEngine::new();
    let id = engine.submit("APP-18", spec_with("Flaky store", &[CHAIN_MARKER])).await;
    engine.next_gate(GATE_WAIT).await;

    // enough failures to exhaust the retries of the next write
    engine
        .store
        .fail_next_writes(engine.orchestrator.config().persistence.max_attempts);
    approve(&engine, id, GateName::PlanApproval);
    engine.orchestrator.wait_idle().await;

    let status = engine.orchestrator.status(id).await.unwrap();
    assert_eq!(status.state, TaskState::Failed);
    assert!(status.cause.unwrap().starts_with("persistence"));

    let dashboard = engine.orchestrator.dashboard().await.unwrap();
    let row = dashboard.task(id).unwrap();
    assert_eq!(row.state, status.state);
    assert_eq!(row.cause.as_ref().map(|c| c.code), Some(CauseCode::Persistence));
    tokio_test::assert_ok!(engine.orchestrator.verify_audit().await);

    // the failed write left no transition behind
    let events = engine.store.audit_for_task(id).await.unwrap();
    let last = events.iter().rev().find(|e| e.event_type == AuditEventType::Transition).unwrap();
    assert_eq!(last.to_state, Some(TaskState::Failed));
    assert!(!events.iter().any(|e| e.to_state == Some(TaskState::Developing)));
}

#[tokio::test]
async fn unfetchable_item_does_not_block_ingestion() {
    let mut engine = TestEngine::new();
    let resolver = engine.auto_resolve();
    engine.issues.add("ING-4", spec_with("Before", &[CHAIN_MARKER]));
    let gone = engine.issues.add("ING-5", spec_with("Deleted", &[CHAIN_MARKER]));
    engine.issues.add("ING-6", spec_with("After", &[CHAIN_MARKER]));
    engine.issues.remove(&gone);

    let submitted = engine.orchestrator.ingest_ready().await.unwrap();
    assert_eq!(submitted.len(), 2);
    engine.orchestrator.wait_idle().await;
    resolver.abort();

    let tasks = engine.store.list_tasks().await.unwrap();
    assert_eq!(tasks.len(), 2);
    assert!(tasks.iter().all(|t| t.source_ref != gone));
    assert!(tasks.iter().all(|t| t.state == TaskState::Completed));
}

#[tokio::test]
async fn waiting_gate_keeps_the_lease() {
    let mut config = test_config();
    config.lease_ttl_secs = 1;
    let mut engine = TestEngine::with(config, sdo_test_utils::simulated_generation(), None);
    let id = engine.submit("APP-19", spec_with("Slow reviewer", &[CHAIN_MARKER])).await;
    engine.next_gate(GATE_WAIT).await;

    // longer than the TTL; the waiting run renews its lease
    tokio::time::sleep(Duration::from_millis(1_500)).await;
    let intruder = engine
        .store
        .acquire_lease(id, "intruder", Duration::from_secs(60))
        .await;
    assert!(matches!(intruder, Err(StoreError::LeaseHeld { .. })));

    approve(&engine, id, GateName::PlanApproval);
    engine.next_gate(GATE_WAIT).await;
    approve(&engine, id, GateName::FinalApproval);
    engine.orchestrator.wait_idle().await;
    assert_eq!(engine.state(id).await, TaskState::Completed);
}

/// Store that abandons the task behind the engine's back when its plan is
/// read, i.e. after the gate stage loaded the task but before the gate is
/// registered
struct AbandonOnPlanRead {
    inner: Arc<InMemoryArtifactStore>,
}

#[async_trait]
impl ArtifactStore for AbandonOnPlanRead {
    async fn create_task(&self, task: Task) -> Result<Task, StoreError> {
        self.inner.create_task(task).await
    }

    async fn get_task(&self, id: TaskId) -> Result<Task, StoreError> {
        self.inner.get_task(id).await
    }

    async fn update_task(&self, expected_version: u64, task: Task) -> Result<Task, StoreError> {
        self.inner.update_task(expected_version, task).await
    }

    async fn update_task_audited(
        &self,
        expected_version: u64,
        task: Task,
        events: Vec<AuditEvent>,
    ) -> Result<(Task, Vec<AuditEvent>), StoreError> {
        self.inner.update_task_audited(expected_version, task, events).await
    }

    async fn list_tasks(&self) -> Result<Vec<Task>, StoreError> {
        self.inner.list_tasks().await
    }

    async fn find_by_source(&self, source_ref: &SourceRef) -> Result<Option<Task>, StoreError> {
        self.inner.find_by_source(source_ref).await
    }

    async fn acquire_lease(&self, task_id: TaskId, owner: &str, ttl: Duration) -> Result<Lease, StoreError> {
        self.inner.acquire_lease(task_id, owner, ttl).await
    }

    async fn release_lease(&self, lease: &Lease) -> Result<(), StoreError> {
        self.inner.release_lease(lease).await
    }

    async fn put_plan(&self, plan: Plan) -> Result<(), StoreError> {
        self.inner.put_plan(plan).await
    }

    async fn get_plan(&self, id: PlanId) -> Result<Plan, StoreError> {
        let plan = self.inner.get_plan(id).await?;
        let task = self.inner.get_task(plan.task_id).await?;
        if !task.state.is_terminal() {
            let mut abandoned = task.clone();
            abandoned.state = TaskState::Abandoned;
            self.inner.update_task(task.version, abandoned).await?;
        }
        Ok(plan)
    }

    async fn put_changeset(&self, changeset: ChangeSet) -> Result<(), StoreError> {
        self.inner.put_changeset(changeset).await
    }

    async fn get_changeset(&self, id: ChangeSetId) -> Result<ChangeSet, StoreError> {
        self.inner.get_changeset(id).await
    }

    async fn put_review(&self, report: ReviewReport) -> Result<(), StoreError> {
        self.inner.put_review(report).await
    }

    async fn get_review(&self, id: ReviewId) -> Result<ReviewReport, StoreError> {
        self.inner.get_review(id).await
    }

    async fn reviews_for_task(&self, task_id: TaskId) -> Result<Vec<ReviewReport>, StoreError> {
        self.inner.reviews_for_task(task_id).await
    }

    async fn put_approval(&self, record: ApprovalRecord) -> Result<(), StoreError> {
        self.inner.put_approval(record).await
    }

    async fn approvals_for_task(&self, task_id: TaskId) -> Result<Vec<ApprovalRecord>, StoreError> {
        self.inner.approvals_for_task(task_id).await
    }

    async fn append_audit(&self, event: AuditEvent) -> Result<AuditEvent, StoreError> {
        self.inner.append_audit(event).await
    }

    async fn audit_for_task(&self, task_id: TaskId) -> Result<Vec<AuditEvent>, StoreError> {
        self.inner.audit_for_task(task_id).await
    }

    async fn audit_since(&self, since: DateTime<Utc>) -> Result<Vec<AuditEvent>, StoreError> {
        self.inner.audit_since(since).await
    }

    async fn verify_audit(&self) -> Result<(), StoreError> {
        self.inner.verify_audit().await
    }
}

#[tokio::test]
async fn abandon_before_gate_registration_is_never_presented() {
    let inner = Arc::new(InMemoryArtifactStore::new());
    let issues = Arc::new(InMemoryIssueSource::new());
    let source_ref = issues.add("APP-20", spec_with("Withdrawn", &[CHAIN_MARKER]));
    let (boundary, mut presentations) = ChannelBoundary::new();
    let orchestrator = WorkflowOrchestrator::new(
        test_config(),
        Collaborators {
            store: Arc::new(AbandonOnPlanRead { inner: inner.clone() }),
            generation: sdo_test_utils::simulated_generation(),
            issues,
            changes: Arc::new(sdo_core::connectors::RecordingChangeHost::new()),
            boundary: Arc::new(boundary),
            metrics: Arc::new(RecordingMetrics::new()),
            static_analysis: None,
        },
    )
    .unwrap();

    let id = orchestrator.submit(source_ref).await.unwrap();
    orchestrator.wait_idle().await;

    assert_eq!(inner.get_task(id).await.unwrap().state, TaskState::Abandoned);
    assert!(presentations.try_recv().is_err());
    assert!(!audit_types(&inner, id).await.contains(&AuditEventType::GateOpened));
    assert_eq!(orchestrator.gates().tracked(), 0);
}
