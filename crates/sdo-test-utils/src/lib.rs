//! Testing utilities for SDO workspace
//!
//! Shared fixtures: an engine wired to in-memory collaborators, the
//! deterministic simulation model, and gate helpers.

#![allow(missing_docs)]

use sdo_artifact::{InMemoryArtifactStore, SourceRef, TaskId, TaskSpec, TaskState};
use sdo_core::connectors::{InMemoryIssueSource, RecordingChangeHost, StaticAnalysis};
use sdo_core::orchestrator::{Collaborators, WorkflowOrchestrator};
use sdo_core::simulator::simulation_responder;
use sdo_core::EngineConfig;
use sdo_generation::ScriptedGenerationService;
use sdo_kernel::{ChannelBoundary, Presentation, RecordingMetrics};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

pub use sdo_core::simulator::{CHAIN_MARKER, FAIL_REVIEW_MARKER, REJECT_PLAN_MARKER};

/// Config for tests: no backoff, short gate timeout, two workers
pub fn test_config() -> EngineConfig {
    EngineConfig::default()
        .without_backoff()
        .with_hitl_timeout_secs(5)
        .with_max_workers(2)
}

/// Scripted generation answering every template with the simulation model
pub fn simulated_generation() -> Arc<ScriptedGenerationService> {
    Arc::new(ScriptedGenerationService::new().with_responder(simulation_responder()))
}

/// Work item whose summary carries the given markers
pub fn spec_with(summary: &str, markers: &[&str]) -> TaskSpec {
    let mut text = summary.to_string();
    for marker in markers {
        text.push(' ');
        text.push_str(marker);
    }
    TaskSpec::new(text, "Requirement R1 for the service under test")
}

/// Engine plus handles on every in-memory collaborator
pub struct TestEngine {
    pub orchestrator: Arc<WorkflowOrchestrator>,
    pub store: Arc<InMemoryArtifactStore>,
    pub issues: Arc<InMemoryIssueSource>,
    pub changes: Arc<RecordingChangeHost>,
    pub metrics: Arc<RecordingMetrics>,
    pub generation: Arc<ScriptedGenerationService>,
    pub presentations: UnboundedReceiver<Presentation>,
}

impl TestEngine {
    /// Engine over the simulation model with the test config
    pub fn new() -> Self {
        Self::with(test_config(), simulated_generation(), None)
    }

    /// Engine with explicit config, generation and static analysis
    pub fn with(
        config: EngineConfig,
        generation: Arc<ScriptedGenerationService>,
        static_analysis: Option<Arc<dyn StaticAnalysis>>,
    ) -> Self {
        let store = Arc::new(InMemoryArtifactStore::new());
        let issues = Arc::new(InMemoryIssueSource::new());
        let changes = Arc::new(RecordingChangeHost::new());
        let metrics = Arc::new(RecordingMetrics::new());
        let (boundary, presentations) = ChannelBoundary::new();
        let orchestrator = WorkflowOrchestrator::new(
            config,
            Collaborators {
                store: store.clone(),
                generation: generation.clone(),
                issues: issues.clone(),
                changes: changes.clone(),
                boundary: Arc::new(boundary),
                metrics: metrics.clone(),
                static_analysis,
            },
        )
        .expect("test config is valid");
        Self {
            orchestrator,
            store,
            issues,
            changes,
            metrics,
            generation,
            presentations,
        }
    }

    /// Register a work item and submit it
    pub async fn submit(&self, key: &str, spec: TaskSpec) -> TaskId {
        let source_ref: SourceRef = self.issues.add(key, spec);
        self.orchestrator.submit(source_ref).await.expect("submit")
    }

    /// Next gate shown to humans, failing the test after `timeout`
    pub async fn next_gate(&mut self, timeout: Duration) -> Presentation {
        tokio::time::timeout(timeout, self.presentations.recv())
            .await
            .expect("gate presented in time")
            .expect("boundary still open")
    }

    /// Hand presentations to the simulator's auto-resolver
    pub fn auto_resolve(&mut self) -> tokio::task::JoinHandle<()> {
        let (_, empty) = tokio::sync::mpsc::unbounded_channel();
        let rx = std::mem::replace(&mut self.presentations, empty);
        tokio::spawn(sdo_core::simulator::auto_resolve(
            Arc::clone(&self.orchestrator),
            rx,
        ))
    }

    /// Current state of a task
    pub async fn state(&self, task_id: TaskId) -> TaskState {
        self.orchestrator
            .status(task_id)
            .await
            .expect("task exists")
            .state
    }
}

impl Default for TestEngine {
    fn default() -> Self {
        Self::new()
    }
}
