//! Development loop controller
//!
//! Owns the develop → review → retry bookkeeping: which template a
//! development attempt uses, how review mistakes become feedback, and when
//! the retry budget is spent. It never writes `Task.state`; the orchestrator
//! turns its [`LoopDecision`] into a transition.

use crate::error::WorkflowError;
use crate::persist::TaskWriter;
use sdo_artifact::{ChangeSet, Feedback, FeedbackOrigin, Plan, ReviewReport, Task};
use sdo_generation::contract::ChangeProposal;
use sdo_generation::{GenerationClient, Template, TokenUsage, Variables};
use sdo_kernel::MetricsSink;
use std::sync::Arc;
use tracing::{debug, info, instrument};

const ACTOR: &str = "development_loop";

/// What to do after a review
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopDecision {
    /// Review passed; go to the final gate
    Proceed,
    /// Review failed with budget left; develop again
    Retry,
    /// Review failed and the budget is spent; force the final gate
    Escalate,
}

/// A development attempt's change set plus tokens spent
#[derive(Debug, Clone, PartialEq)]
pub struct Developed {
    /// Persisted change set
    pub changeset: ChangeSet,
    /// Tokens
    pub usage: TokenUsage,
}

/// Runs development attempts and decides retries
pub struct DevelopmentLoopController {
    client: GenerationClient,
    writer: TaskWriter,
    max_rebuild_attempts: u32,
    metrics: Arc<dyn MetricsSink>,
}

impl std::fmt::Debug for DevelopmentLoopController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DevelopmentLoopController")
            .field("max_rebuild_attempts", &self.max_rebuild_attempts)
            .finish_non_exhaustive()
    }
}

impl DevelopmentLoopController {
    /// Create a controller
    #[must_use]
    pub fn new(
        client: GenerationClient,
        writer: TaskWriter,
        max_rebuild_attempts: u32,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            client,
            writer,
            max_rebuild_attempts,
            metrics,
        }
    }

    /// Retry budget
    #[inline]
    #[must_use]
    pub fn max_rebuild_attempts(&self) -> u32 {
        self.max_rebuild_attempts
    }

    /// Template for the task's next attempt
    #[must_use]
    pub fn template_for(task: &Task) -> Template {
        let has_feedback = task.pending_feedback.as_ref().is_some_and(|f| !f.is_empty());
        if has_feedback || task.retry_count > 0 {
            Template::ReviseChange
        } else {
            Template::DevelopChange
        }
    }

    /// Generate and persist one change set
    #[instrument(skip_all, fields(task_id = %task.id, attempt = task.next_attempt()))]
    pub async fn develop(&self, task: &Task, plan: &Plan) -> Result<Developed, WorkflowError> {
        let template = Self::template_for(task);
        let attempt = task.next_attempt();
        let mut vars = Variables::new()
            .with("summary", task.spec.summary.clone())
            .with("plan", plan.render_steps())
            .with("attempt", attempt);
        if task.spec.has_description() {
            vars.insert("description", task.spec.description.clone());
        }
        if let Some(feedback) = task.pending_feedback.as_ref().filter(|f| !f.is_empty()) {
            vars.insert("feedback", feedback.render());
        }

        let generated = self.client.invoke::<ChangeProposal>(template, &vars).await?;
        self.metrics.generation_call(template.as_str(), generated.usage.total());

        let proposal = generated.value;
        let changeset = ChangeSet::new(task.id, attempt, proposal.artifact_ref, proposal.summary);
        let stored = changeset.clone();
        self.writer
            .retry("put_changeset", || self.writer.store().put_changeset(stored.clone()))
            .await?;
        info!(changeset_id = %changeset.id, template = %template, "change set recorded");
        Ok(Developed {
            changeset,
            usage: generated.usage,
        })
    }

    /// Attach a change set to the task and consume the feedback it answered
    pub async fn record_attempt(&self, task: Task, changeset: &ChangeSet) -> Result<Task, WorkflowError> {
        let id = changeset.id;
        self.writer
            .cas(task, ACTOR, move |t| {
                t.changeset_ids.push(id);
                t.pending_feedback = None;
            })
            .await
    }

    /// Decide what follows a review and persist the retry bookkeeping
    ///
    /// `retry_count` stops at `max_rebuild_attempts`; a failed review at the
    /// limit escalates without counting again.
    pub async fn assess(&self, task: Task, report: &ReviewReport) -> Result<(LoopDecision, Task), WorkflowError> {
        if report.passed {
            debug!(task_id = %task.id, aggregate = report.aggregate_score, "review passed");
            return Ok((LoopDecision::Proceed, task));
        }

        let feedback = if report.mistakes.is_empty() {
            Feedback {
                origin: FeedbackOrigin::Review,
                items: vec![format!(
                    "aggregate {:.2} below threshold {:.2}",
                    report.aggregate_score, report.threshold
                )],
            }
        } else {
            Feedback {
                origin: FeedbackOrigin::Review,
                items: report.mistakes.clone(),
            }
        };
        // a counted final rejection can already have spent the budget
        let retry_count = if task.retry_count >= self.max_rebuild_attempts {
            task.retry_count
        } else {
            task.retry_count + 1
        };
        let task = self
            .writer
            .cas(task, ACTOR, move |t| {
                t.retry_count = retry_count;
                t.pending_feedback = Some(feedback);
            })
            .await?;

        let decision = if retry_count < self.max_rebuild_attempts {
            self.metrics.retry_scheduled(task.id, retry_count);
            LoopDecision::Retry
        } else {
            LoopDecision::Escalate
        };
        info!(task_id = %task.id, retry_count, ?decision, "review failed");
        Ok((decision, task))
    }

    /// Count a final-gate rejection as a retry if budget remains
    ///
    /// Returns `None` when the budget is spent and the task must fail.
    pub async fn apply_final_rejection(
        &self,
        task: Task,
        feedback: Option<&str>,
    ) -> Result<Option<Task>, WorkflowError> {
        if task.retry_count >= self.max_rebuild_attempts {
            return Ok(None);
        }
        let retry_count = task.retry_count + 1;
        let feedback = Feedback::from_text(FeedbackOrigin::FinalGate, feedback.unwrap_or_default());
        let task = self
            .writer
            .cas(task, ACTOR, move |t| {
                t.retry_count = retry_count;
                t.pending_feedback = Some(feedback);
            })
            .await?;
        self.metrics.retry_scheduled(task.id, retry_count);
        Ok(Some(task))
    }
}
