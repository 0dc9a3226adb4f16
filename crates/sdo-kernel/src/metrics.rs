//! Metrics sink
//!
//! Components receive an `Arc<dyn MetricsSink>` at construction. There is
//! no process-wide tracker; the facade sink forwards to whatever recorder
//! the binary installs for the `metrics` crate.

use parking_lot::Mutex;
use sdo_artifact::{Decision, GateName, TaskId, TaskState};
use std::time::Duration;

/// Receiver of engine measurements
pub trait MetricsSink: Send + Sync {
    /// A task changed state
    fn transition(&self, _from: TaskState, _to: TaskState) {}

    /// A stage finished
    fn stage_duration(&self, _stage: &'static str, _elapsed: Duration) {}

    /// A generation call completed
    fn generation_call(&self, _template: &'static str, _tokens: u64) {}

    /// A review report was produced
    fn review_scored(&self, _aggregate: f64, _passed: bool) {}

    /// A development retry was scheduled
    fn retry_scheduled(&self, _task_id: TaskId, _retry_count: u32) {}

    /// A gate was resolved
    fn gate_resolved(&self, _gate: GateName, _decision: Decision) {}
}

/// Discards everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {}

/// Forwards to the `metrics` crate facade
#[derive(Debug, Clone, Copy, Default)]
pub struct FacadeMetrics;

impl MetricsSink for FacadeMetrics {
    fn transition(&self, from: TaskState, to: TaskState) {
        ::metrics::counter!("sdo_transitions_total", "from" => from.as_str(), "to" => to.as_str())
            .increment(1);
    }

    fn stage_duration(&self, stage: &'static str, elapsed: Duration) {
        ::metrics::histogram!("sdo_stage_duration_seconds", "stage" => stage)
            .record(elapsed.as_secs_f64());
    }

    fn generation_call(&self, template: &'static str, tokens: u64) {
        ::metrics::counter!("sdo_generation_calls_total", "template" => template).increment(1);
        ::metrics::counter!("sdo_generation_tokens_total", "template" => template).increment(tokens);
    }

    fn review_scored(&self, aggregate: f64, passed: bool) {
        let outcome = if passed { "passed" } else { "failed" };
        ::metrics::histogram!("sdo_review_aggregate_score", "outcome" => outcome).record(aggregate);
    }

    fn retry_scheduled(&self, _task_id: TaskId, _retry_count: u32) {
        ::metrics::counter!("sdo_retries_total").increment(1);
    }

    fn gate_resolved(&self, gate: GateName, decision: Decision) {
        ::metrics::counter!("sdo_gate_decisions_total", "gate" => gate.as_str(), "decision" => decision.as_str())
            .increment(1);
    }
}

/// Recorded measurement
#[derive(Debug, Clone, PartialEq)]
pub enum MetricEvent {
    /// See [`MetricsSink::transition`]
    Transition(TaskState, TaskState),
    /// See [`MetricsSink::stage_duration`]
    Stage(&'static str, Duration),
    /// See [`MetricsSink::generation_call`]
    Generation(&'static str, u64),
    /// See [`MetricsSink::review_scored`]
    Review(f64, bool),
    /// See [`MetricsSink::retry_scheduled`]
    Retry(TaskId, u32),
    /// See [`MetricsSink::gate_resolved`]
    Gate(GateName, Decision),
}

/// Keeps every measurement in memory
#[derive(Debug, Default)]
pub struct RecordingMetrics {
    events: Mutex<Vec<MetricEvent>>,
}

impl RecordingMetrics {
    /// Empty recorder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot
    pub fn events(&self) -> Vec<MetricEvent> {
        self.events.lock().clone()
    }

    /// Transitions into `state`
    pub fn transitions_into(&self, state: TaskState) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| matches!(e, MetricEvent::Transition(_, to) if *to == state))
            .count()
    }

    /// Tokens recorded across generation calls
    pub fn total_tokens(&self) -> u64 {
        self.events
            .lock()
            .iter()
            .map(|e| match e {
                MetricEvent::Generation(_, t) => *t,
                _ => 0,
            })
            .sum()
    }

    /// Retries recorded
    pub fn retries(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| matches!(e, MetricEvent::Retry(..)))
            .count()
    }

    fn push(&self, event: MetricEvent) {
        self.events.lock().push(event);
    }
}

impl MetricsSink for RecordingMetrics {
    fn transition(&self, from: TaskState, to: TaskState) {
        self.push(MetricEvent::Transition(from, to));
    }

    fn stage_duration(&self, stage: &'static str, elapsed: Duration) {
        self.push(MetricEvent::Stage(stage, elapsed));
    }

    fn generation_call(&self, template: &'static str, tokens: u64) {
        self.push(MetricEvent::Generation(template, tokens));
    }

    fn review_scored(&self, aggregate: f64, passed: bool) {
        self.push(MetricEvent::Review(aggregate, passed));
    }

    fn retry_scheduled(&self, task_id: TaskId, retry_count: u32) {
        self.push(MetricEvent::Retry(task_id, retry_count));
    }

    fn gate_resolved(&self, gate: GateName, decision: Decision) {
        self.push(MetricEvent::Gate(gate, decision));
    }
}
