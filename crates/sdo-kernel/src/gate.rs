//! Human-in-the-loop gates
//!
//! A gate is keyed by `(task_id, gate_name)`. Opening it registers a slot,
//! presents the artifact to the boundary and parks the caller on a oneshot
//! channel until a human resolves it, the timeout fires, or the task is
//! cancelled. Every state change of a slot happens under its lock, so a
//! resolution racing the timeout produces exactly one recorded decision.

use crate::error::GateError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use sdo_artifact::{
    ApprovalRecord, ChangeSet, Decision, FailureCause, GateName, Plan, ReviewReport, TaskId,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Actor name recorded for timeouts
pub const SYSTEM_ACTOR: &str = "system";

/// What the human is asked to decide on
#[derive(Debug, Clone, PartialEq)]
pub enum GateArtifact {
    /// Plan approval; `plan.low_confidence` is surfaced to the reviewer
    Plan(Box<Plan>),
    /// Final approval of a reviewed change
    Final {
        /// Latest change set
        changeset: ChangeSet,
        /// Its review
        review: Box<ReviewReport>,
        /// Escalated by the retry limit rather than a passing review
        forced: bool,
        /// Why it was escalated
        cause: Option<FailureCause>,
    },
}

/// One pending decision, as shown to the boundary
#[derive(Debug, Clone, PartialEq)]
pub struct Presentation {
    /// Task
    pub task_id: TaskId,
    /// Gate
    pub gate: GateName,
    /// Opening round; pass it back to reject stale answers
    pub round: u32,
    /// Content under review
    pub artifact: GateArtifact,
    /// When the gate times out
    pub deadline: DateTime<Utc>,
}

/// Where pending decisions are shown to humans
#[async_trait]
pub trait HitlBoundary: Send + Sync {
    /// Publish a pending gate
    async fn present(&self, presentation: Presentation) -> Result<(), GateError>;
}

/// Boundary that forwards presentations to an in-process channel
#[derive(Debug, Clone)]
pub struct ChannelBoundary {
    tx: mpsc::UnboundedSender<Presentation>,
}

impl ChannelBoundary {
    /// Boundary plus the receiving end
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Presentation>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl HitlBoundary for ChannelBoundary {
    async fn present(&self, presentation: Presentation) -> Result<(), GateError> {
        self.tx
            .send(presentation)
            .map_err(|_| GateError::Presentation("boundary channel closed".to_string()))
    }
}

/// How a `timeout` decision is interpreted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutPolicy {
    /// Treat as a rejection with empty feedback
    #[default]
    Reject,
    /// Fail the task
    Fail,
}

/// Effective meaning of a recorded decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateOutcome {
    /// Move forward
    Approved,
    /// Go back one stage
    Rejected {
        /// Human feedback, `None` for timeouts
        feedback: Option<String>,
    },
    /// Timeout under [`TimeoutPolicy::Fail`]
    TimedOut,
}

impl TimeoutPolicy {
    /// Map a record to its effect. A timeout never approves.
    #[must_use]
    pub fn interpret(self, record: &ApprovalRecord) -> GateOutcome {
        match (record.decision, self) {
            (Decision::Approve, _) => GateOutcome::Approved,
            (Decision::Reject, _) => GateOutcome::Rejected {
                feedback: record.feedback.clone(),
            },
            (Decision::Timeout, TimeoutPolicy::Reject) => GateOutcome::Rejected { feedback: None },
            (Decision::Timeout, TimeoutPolicy::Fail) => GateOutcome::TimedOut,
        }
    }
}

/// A human's answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// Decision
    pub decision: Decision,
    /// Optional feedback
    pub feedback: Option<String>,
    /// Who answered
    pub decided_by: String,
    /// Round being answered; `None` answers whatever is open
    pub round: Option<u32>,
}

impl Resolution {
    /// Approve
    pub fn approve(decided_by: impl Into<String>) -> Self {
        Self {
            decision: Decision::Approve,
            feedback: None,
            decided_by: decided_by.into(),
            round: None,
        }
    }

    /// Reject with feedback
    pub fn reject(decided_by: impl Into<String>, feedback: impl Into<String>) -> Self {
        Self {
            decision: Decision::Reject,
            feedback: Some(feedback.into()),
            decided_by: decided_by.into(),
            round: None,
        }
    }

    /// Pin to a round
    #[must_use]
    pub fn for_round(mut self, round: u32) -> Self {
        self.round = Some(round);
        self
    }
}

/// Result of [`GateManager::resolve`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveOutcome {
    /// This call decided the gate
    Applied(ApprovalRecord),
    /// Already decided; nothing changed
    AlreadyResolved(ApprovalRecord),
    /// Answer for an older round; nothing changed
    StaleRound {
        /// Round currently open or last decided
        current: u32,
    },
    /// No such gate is open
    Unknown,
}

#[derive(Debug, Default)]
enum SlotState {
    #[default]
    Idle,
    Open(oneshot::Sender<ApprovalRecord>),
    Resolved(ApprovalRecord),
    Cancelled,
}

#[derive(Debug, Default)]
struct Slot {
    round: u32,
    state: SlotState,
}

/// A registered gate round awaiting [`GateManager::wait`]
#[derive(Debug)]
pub struct PendingGate {
    task_id: TaskId,
    gate: GateName,
    round: u32,
    slot: Arc<Mutex<Slot>>,
    rx: Option<oneshot::Receiver<ApprovalRecord>>,
}

impl PendingGate {
    /// Round this registration opened
    #[inline]
    #[must_use]
    pub fn round(&self) -> u32 {
        self.round
    }
}

impl Drop for PendingGate {
    fn drop(&mut self) {
        let mut s = self.slot.lock();
        if s.round == self.round && matches!(s.state, SlotState::Open(_)) {
            debug!(task_id = %self.task_id, gate = %self.gate, round = self.round, "gate round withdrawn");
            s.state = SlotState::Idle;
        }
    }
}

/// Gate registry
pub struct GateManager {
    slots: DashMap<(TaskId, GateName), Arc<Mutex<Slot>>>,
    boundary: Arc<dyn HitlBoundary>,
    timeout: Duration,
}

impl std::fmt::Debug for GateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GateManager")
            .field("slots", &self.slots.len())
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl GateManager {
    /// Create a manager presenting through `boundary`
    #[must_use]
    pub fn new(boundary: Arc<dyn HitlBoundary>, timeout: Duration) -> Self {
        Self {
            slots: DashMap::new(),
            boundary,
            timeout,
        }
    }

    /// Configured timeout
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Open a gate and wait for its decision
    pub async fn open(
        &self,
        task_id: TaskId,
        gate: GateName,
        artifact: GateArtifact,
    ) -> Result<ApprovalRecord, GateError> {
        let pending = self.register(task_id, gate)?;
        self.wait(pending, artifact).await
    }

    /// Register the next round of a gate without presenting it
    ///
    /// From here on [`GateManager::cancel`] reaches the gate. Dropping the
    /// returned handle before it is decided withdraws the round.
    pub fn register(&self, task_id: TaskId, gate: GateName) -> Result<PendingGate, GateError> {
        let slot = Arc::clone(self.slots.entry((task_id, gate)).or_default().value());
        let (tx, rx) = oneshot::channel();
        let round = {
            let mut s = slot.lock();
            if matches!(s.state, SlotState::Open(_)) {
                return Err(GateError::AlreadyOpen { task_id, gate });
            }
            s.round += 1;
            s.state = SlotState::Open(tx);
            s.round
        };
        Ok(PendingGate {
            task_id,
            gate,
            round,
            slot,
            rx: Some(rx),
        })
    }

    /// Present a registered gate and wait for its decision
    pub async fn wait(&self, mut pending: PendingGate, artifact: GateArtifact) -> Result<ApprovalRecord, GateError> {
        let (task_id, gate, round) = (pending.task_id, pending.gate, pending.round);
        let still_open = matches!(pending.slot.lock().state, SlotState::Open(_));
        let Some(rx) = pending.rx.take().filter(|_| still_open) else {
            return Err(GateError::Cancelled { task_id, gate });
        };

        let deadline = Utc::now()
            + chrono::Duration::from_std(self.timeout).unwrap_or_else(|_| chrono::Duration::days(365));
        let presentation = Presentation {
            task_id,
            gate,
            round,
            artifact,
            deadline,
        };
        self.boundary.present(presentation).await?;
        info!(task_id = %task_id, gate = %gate, round, "gate opened");

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(record)) => Ok(record),
            Ok(Err(_)) => Err(GateError::Cancelled { task_id, gate }),
            Err(_) => self.expire(&pending.slot, task_id, gate),
        }
    }

    fn expire(
        &self,
        slot: &Mutex<Slot>,
        task_id: TaskId,
        gate: GateName,
    ) -> Result<ApprovalRecord, GateError> {
        let mut s = slot.lock();
        let round = s.round;
        match std::mem::take(&mut s.state) {
            SlotState::Open(_) => {
                let record = ApprovalRecord {
                    gate,
                    round,
                    task_id,
                    decision: Decision::Timeout,
                    feedback: None,
                    decided_by: SYSTEM_ACTOR.to_string(),
                    decided_at: Utc::now(),
                };
                warn!(task_id = %task_id, gate = %gate, round, timeout = ?self.timeout, "gate timed out");
                s.state = SlotState::Resolved(record.clone());
                Ok(record)
            }
            SlotState::Resolved(record) => {
                s.state = SlotState::Resolved(record.clone());
                Ok(record)
            }
            other => {
                s.state = other;
                Err(GateError::Cancelled { task_id, gate })
            }
        }
    }

    /// Record a human decision. Idempotent: repeated or stale answers
    /// change nothing.
    pub fn resolve(&self, task_id: TaskId, gate: GateName, resolution: Resolution) -> ResolveOutcome {
        let Some(slot) = self.slots.get(&(task_id, gate)).map(|s| Arc::clone(s.value())) else {
            warn!(task_id = %task_id, gate = %gate, "resolve for unknown gate ignored");
            return ResolveOutcome::Unknown;
        };
        let mut s = slot.lock();
        let round = s.round;
        if let Some(asked) = resolution.round {
            if asked != round {
                warn!(task_id = %task_id, gate = %gate, asked, current = round, "stale gate resolution ignored");
                return ResolveOutcome::StaleRound { current: round };
            }
        }
        match std::mem::take(&mut s.state) {
            SlotState::Open(tx) => {
                let record = ApprovalRecord {
                    gate,
                    round,
                    task_id,
                    decision: resolution.decision,
                    feedback: resolution.feedback.filter(|f| !f.trim().is_empty()),
                    decided_by: resolution.decided_by,
                    decided_at: Utc::now(),
                };
                s.state = SlotState::Resolved(record.clone());
                if tx.send(record.clone()).is_err() {
                    debug!(task_id = %task_id, gate = %gate, "gate waiter already gone");
                }
                info!(task_id = %task_id, gate = %gate, round, decision = %record.decision, "gate resolved");
                ResolveOutcome::Applied(record)
            }
            SlotState::Resolved(existing) => {
                warn!(task_id = %task_id, gate = %gate, round, "gate already resolved; second resolution ignored");
                s.state = SlotState::Resolved(existing.clone());
                ResolveOutcome::AlreadyResolved(existing)
            }
            other => {
                s.state = other;
                warn!(task_id = %task_id, gate = %gate, "resolve for gate that is not open ignored");
                ResolveOutcome::Unknown
            }
        }
    }

    /// Cancel every open gate of a task; waiters get [`GateError::Cancelled`]
    pub fn cancel(&self, task_id: TaskId) -> usize {
        let mut cancelled = 0;
        for gate in [GateName::PlanApproval, GateName::FinalApproval] {
            if let Some(slot) = self.slots.get(&(task_id, gate)).map(|s| Arc::clone(s.value())) {
                let mut s = slot.lock();
                if matches!(s.state, SlotState::Open(_)) {
                    s.state = SlotState::Cancelled;
                    cancelled += 1;
                }
            }
        }
        if cancelled > 0 {
            info!(task_id = %task_id, cancelled, "gates cancelled");
        }
        cancelled
    }

    /// Drop a finished task's slots; later resolutions report
    /// [`ResolveOutcome::Unknown`]
    pub fn forget(&self, task_id: TaskId) -> usize {
        [GateName::PlanApproval, GateName::FinalApproval]
            .into_iter()
            .filter(|&gate| self.slots.remove(&(task_id, gate)).is_some())
            .count()
    }

    /// Number of slots held
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.slots.len()
    }

    /// Whether a gate is waiting for a decision
    #[must_use]
    pub fn is_open(&self, task_id: TaskId, gate: GateName) -> bool {
        self.slots
            .get(&(task_id, gate))
            .is_some_and(|slot| {
                let s = slot.lock();
                matches!(s.state, SlotState::Open(_))
            })
    }

    /// Last decision recorded for a gate
    #[must_use]
    pub fn last_record(&self, task_id: TaskId, gate: GateName) -> Option<ApprovalRecord> {
        self.slots.get(&(task_id, gate)).and_then(|slot| {
            let s = slot.lock();
            match &s.state {
                SlotState::Resolved(r) => Some(r.clone()),
                _ => None,
            }
        })
    }

    /// All open gates with their rounds
    #[must_use]
    pub fn open_gates(&self) -> Vec<(TaskId, GateName, u32)> {
        self.slots
            .iter()
            .filter_map(|entry| {
                let s = entry.value().lock();
                matches!(s.state, SlotState::Open(_)).then(|| (entry.key().0, entry.key().1, s.round))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sdo_artifact::{PlanId, PlanningMethod};

    fn plan(task_id: TaskId) -> GateArtifact {
        GateArtifact::Plan(Box::new(Plan {
            id: PlanId::new(),
            task_id,
            revision: 1,
            method: PlanningMethod::Chain,
            merged_subtasks: Vec::new(),
            candidates: Vec::new(),
            aggregate_score: 10.0,
            low_confidence: false,
            feedback_applied: None,
            created_at: Utc::now(),
        }))
    }

    fn manager(timeout: Duration) -> (Arc<GateManager>, mpsc::UnboundedReceiver<Presentation>) {
        let (boundary, rx) = ChannelBoundary::new();
        (Arc::new(GateManager::new(Arc::new(boundary), timeout)), rx)
    }

    #[tokio::test]
    async fn approval_releases_waiter() {
        let (gates, mut rx) = manager(Duration::from_secs(60));
        let task = TaskId::new();
        let waiter = {
            let gates = Arc::clone(&gates);
            tokio::spawn(async move { gates.open(task, GateName::PlanApproval, plan(task)).await })
        };
        let shown = rx.recv().await.unwrap();
        assert_eq!(shown.round, 1);
        let outcome = gates.resolve(task, GateName::PlanApproval, Resolution::approve("alice"));
        assert!(matches!(outcome, ResolveOutcome::Applied(_)));

        let record = waiter.await.unwrap().unwrap();
        assert_eq!(record.decision, Decision::Approve);
        assert_eq!(record.decided_by, "alice");
    }

    #[tokio::test]
    async fn second_resolution_is_a_no_op() {
        let (gates, mut rx) = manager(Duration::from_secs(60));
        let task = TaskId::new();
        let waiter = {
            let gates = Arc::clone(&gates);
            tokio::spawn(async move { gates.open(task, GateName::FinalApproval, plan(task)).await })
        };
        rx.recv().await.unwrap();
        gates.resolve(task, GateName::FinalApproval, Resolution::reject("bob", "needs tests"));
        let second = gates.resolve(task, GateName::FinalApproval, Resolution::approve("carol"));

        match second {
            ResolveOutcome::AlreadyResolved(record) => {
                assert_eq!(record.decision, Decision::Reject);
                assert_eq!(record.feedback.as_deref(), Some("needs tests"));
            }
            other => panic!("expected AlreadyResolved, got {other:?}"),
        }
        let record = waiter.await.unwrap().unwrap();
        assert_eq!(record.decision, Decision::Reject);
        assert_eq!(
            gates.last_record(task, GateName::FinalApproval).unwrap().decided_by,
            "bob"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_resolves_to_timeout_never_approve() {
        let (gates, _rx) = manager(Duration::from_secs(30));
        let task = TaskId::new();
        let record = gates.open(task, GateName::PlanApproval, plan(task)).await.unwrap();
        assert_eq!(record.decision, Decision::Timeout);
        assert_eq!(record.decided_by, SYSTEM_ACTOR);
        assert_eq!(
            TimeoutPolicy::default().interpret(&record),
            GateOutcome::Rejected { feedback: None }
        );
        assert_eq!(TimeoutPolicy::Fail.interpret(&record), GateOutcome::TimedOut);

        let late = gates.resolve(task, GateName::PlanApproval, Resolution::approve("late"));
        assert!(matches!(late, ResolveOutcome::AlreadyResolved(r) if r.decision == Decision::Timeout));
    }

    #[tokio::test]
    async fn cancel_wakes_waiter() {
        let (gates, mut rx) = manager(Duration::from_secs(60));
        let task = TaskId::new();
        let waiter = {
            let gates = Arc::clone(&gates);
            tokio::spawn(async move { gates.open(task, GateName::PlanApproval, plan(task)).await })
        };
        rx.recv().await.unwrap();
        assert_eq!(gates.cancel(task), 1);
        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, GateError::Cancelled { .. }));
    }

    #[tokio::test]
    async fn stale_round_is_ignored() {
        let (gates, mut rx) = manager(Duration::from_secs(60));
        let task = TaskId::new();
        for expected_round in 1..=2 {
            let waiter = {
                let gates = Arc::clone(&gates);
                tokio::spawn(async move { gates.open(task, GateName::PlanApproval, plan(task)).await })
            };
            let shown = rx.recv().await.unwrap();
            assert_eq!(shown.round, expected_round);
            if expected_round == 2 {
                let stale = gates.resolve(
                    task,
                    GateName::PlanApproval,
                    Resolution::reject("bob", "old").for_round(1),
                );
                assert_eq!(stale, ResolveOutcome::StaleRound { current: 2 });
            }
            gates.resolve(task, GateName::PlanApproval, Resolution::approve("alice").for_round(expected_round));
            assert_eq!(waiter.await.unwrap().unwrap().round, expected_round);
        }
    }

    #[tokio::test]
    async fn cancel_before_wait_is_never_presented() {
        let (gates, mut rx) = manager(Duration::from_secs(60));
        let task = TaskId::new();
        let pending = gates.register(task, GateName::PlanApproval).unwrap();
        assert_eq!(pending.round(), 1);
        assert!(gates.is_open(task, GateName::PlanApproval));

        assert_eq!(gates.cancel(task), 1);
        let err = gates.wait(pending, plan(task)).await.unwrap_err();
        assert!(matches!(err, GateError::Cancelled { .. }));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn dropped_registration_frees_the_slot() {
        let (gates, _rx) = manager(Duration::from_secs(60));
        let task = TaskId::new();
        drop(gates.register(task, GateName::FinalApproval).unwrap());
        assert!(!gates.is_open(task, GateName::FinalApproval));

        let again = gates.register(task, GateName::FinalApproval).unwrap();
        assert_eq!(again.round(), 2);
    }

    #[tokio::test]
    async fn forget_releases_every_slot_of_a_task() {
        let (gates, mut rx) = manager(Duration::from_secs(60));
        let task = TaskId::new();
        let other = TaskId::new();
        let waiter = {
            let gates = Arc::clone(&gates);
            tokio::spawn(async move { gates.open(task, GateName::PlanApproval, plan(task)).await })
        };
        rx.recv().await.unwrap();
        gates.resolve(task, GateName::PlanApproval, Resolution::approve("alice"));
        waiter.await.unwrap().unwrap();
        drop(gates.register(other, GateName::PlanApproval).unwrap());
        assert_eq!(gates.tracked(), 2);

        assert_eq!(gates.forget(task), 1);
        assert_eq!(gates.tracked(), 1);
        assert_eq!(
            gates.resolve(task, GateName::PlanApproval, Resolution::approve("late")),
            ResolveOutcome::Unknown
        );
        assert_eq!(gates.forget(task), 0);
    }

    #[test]
    fn unknown_gate() {
        let (gates, _rx) = manager(Duration::from_secs(1));
        let outcome = gates.resolve(TaskId::new(), GateName::PlanApproval, Resolution::approve("x"));
        assert_eq!(outcome, ResolveOutcome::Unknown);
    }

    #[test]
    fn interpret_passes_feedback_through() {
        let record = ApprovalRecord {
            gate: GateName::PlanApproval,
            round: 1,
            task_id: TaskId::new(),
            decision: Decision::Reject,
            feedback: Some("missing requirement X".to_string()),
            decided_by: "alice".to_string(),
            decided_at: Utc::now(),
        };
        assert_eq!(
            TimeoutPolicy::Reject.interpret(&record),
            GateOutcome::Rejected {
                feedback: Some("missing requirement X".to_string())
            }
        );
    }
}
