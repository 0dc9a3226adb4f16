//! Planning engine
//!
//! classify → generate candidates → score (graph only) → merge → verify.
//! Every step goes through the [`GenerationClient`], so provider retries
//! and schema repair are handled below this layer.

use crate::coverage::{check_coverage, CoverageReport};
use crate::error::PlanningError;
use crate::grouping::{distinct_count, groups_to_subtasks, weighted_groups};
use chrono::Utc;
use futures::future::try_join_all;
use sdo_artifact::{
    mean, CandidateId, CandidateSubtask, Feedback, MergedSubtask, Plan, PlanId, PlanningMethod,
    TaskId, TaskSpec, MAX_CANDIDATE_SCORE,
};
use sdo_generation::contract::{
    CandidateBatch, CandidateDraft, CandidateScore, ComplexityDecision, MergeProposal,
};
use sdo_generation::{Contract, GenerationClient, Generated, Template, TokenUsage, Variables};
use sdo_kernel::MetricsSink;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// How candidates are consolidated
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Generation call proposes groups; engine verifies them
    #[default]
    Generated,
    /// Local deterministic grouping by score
    Weighted,
}

/// Planning parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlanningConfig {
    /// Candidates generated for `chain`
    pub chain_candidates: usize,
    /// Candidates generated for `graph`
    pub graph_candidates: usize,
    /// Merged subtasks for `chain`
    pub chain_k: usize,
    /// Merged subtasks for `graph`
    pub graph_k: usize,
    /// Merge strategy
    pub merge_strategy: MergeStrategy,
    /// Aggregate below this marks the plan low-confidence
    pub plan_score_threshold: f64,
}

impl Default for PlanningConfig {
    fn default() -> Self {
        Self {
            chain_candidates: 3,
            graph_candidates: 6,
            chain_k: 3,
            graph_k: 4,
            merge_strategy: MergeStrategy::Generated,
            plan_score_threshold: 7.0,
        }
    }
}

impl PlanningConfig {
    /// With merge strategy
    #[inline]
    #[must_use]
    pub fn with_merge_strategy(mut self, strategy: MergeStrategy) -> Self {
        self.merge_strategy = strategy;
        self
    }

    /// With confidence threshold
    #[inline]
    #[must_use]
    pub fn with_plan_score_threshold(mut self, threshold: f64) -> Self {
        self.plan_score_threshold = threshold;
        self
    }

    /// With merged subtask count for `method`
    #[inline]
    #[must_use]
    pub fn with_k(mut self, method: PlanningMethod, k: usize) -> Self {
        match method {
            PlanningMethod::Chain => self.chain_k = k,
            PlanningMethod::Graph => self.graph_k = k,
        }
        self
    }

    /// Candidates to generate
    #[must_use]
    pub fn candidates_for(&self, method: PlanningMethod) -> usize {
        match method {
            PlanningMethod::Chain => self.chain_candidates,
            PlanningMethod::Graph => self.graph_candidates,
        }
    }

    /// Merged subtasks to produce
    #[must_use]
    pub fn k_for(&self, method: PlanningMethod) -> usize {
        match method {
            PlanningMethod::Chain => self.chain_k,
            PlanningMethod::Graph => self.graph_k,
        }
    }
}

/// Input to one planning round
#[derive(Debug, Clone, PartialEq)]
pub struct PlanningRequest {
    /// Task being planned
    pub task_id: TaskId,
    /// Work item content
    pub spec: TaskSpec,
    /// Revision number of the plan to produce
    pub revision: u32,
    /// Feedback from a rejected plan gate
    pub feedback: Option<Feedback>,
}

impl PlanningRequest {
    /// First revision, no feedback
    #[must_use]
    pub fn new(task_id: TaskId, spec: TaskSpec) -> Self {
        Self {
            task_id,
            spec,
            revision: 1,
            feedback: None,
        }
    }

    /// With plan-gate feedback for the given revision
    #[must_use]
    pub fn with_feedback(mut self, revision: u32, feedback: Option<Feedback>) -> Self {
        self.revision = revision;
        self.feedback = feedback.filter(|f| !f.is_empty());
        self
    }

    fn feedback_text(&self) -> Option<String> {
        self.feedback.as_ref().map(Feedback::render)
    }
}

/// A verified plan plus the tokens it cost
#[derive(Debug, Clone, PartialEq)]
pub struct Planned {
    /// Coverage-valid plan
    pub plan: Plan,
    /// Tokens across every call of the round
    pub usage: TokenUsage,
}

/// Produces coverage-valid plans
pub struct PlanningEngine {
    client: GenerationClient,
    config: PlanningConfig,
    metrics: Arc<dyn MetricsSink>,
}

impl std::fmt::Debug for PlanningEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlanningEngine")
            .field("client", &self.client)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PlanningEngine {
    /// Create an engine
    #[must_use]
    pub fn new(client: GenerationClient, config: PlanningConfig, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            client,
            config,
            metrics,
        }
    }

    /// Configuration in force
    #[must_use]
    pub fn config(&self) -> &PlanningConfig {
        &self.config
    }

    /// Run one planning round
    #[instrument(skip(self, request), fields(task_id = %request.task_id, revision = request.revision))]
    pub async fn plan(&self, request: &PlanningRequest) -> Result<Planned, PlanningError> {
        let mut usage = TokenUsage::default();
        let base = self.base_variables(request);

        let method = self.classify(&base, &mut usage).await?;
        let k = self.config.k_for(method);
        let drafts = self.generate(method, &base, &mut usage).await?;

        let candidates = match method {
            PlanningMethod::Chain => drafts.into_iter().map(prescored).collect(),
            PlanningMethod::Graph => self.score_all(drafts, &base, &mut usage).await?,
        };

        let available = distinct_count(&candidates);
        if available < k {
            return Err(PlanningError::InsufficientCandidates {
                available,
                required: k,
            });
        }

        let merged = if method == PlanningMethod::Chain && candidates.len() == k {
            identity_merge(&candidates)
        } else {
            match self.config.merge_strategy {
                MergeStrategy::Weighted => {
                    let groups = weighted_groups(&candidates, k)?;
                    groups_to_subtasks(&groups, &candidates)
                }
                MergeStrategy::Generated => self.generated_merge(&candidates, k, &base, &mut usage).await?,
            }
        };

        let ids: Vec<CandidateId> = candidates.iter().map(|c| c.id.clone()).collect();
        let report = check_coverage(&ids, &merged, k);
        if !report.is_valid() {
            return Err(PlanningError::CoverageViolation(report));
        }

        let aggregate_score = mean(&merged.iter().map(|m| m.score).collect::<Vec<_>>());
        let low_confidence = aggregate_score < self.config.plan_score_threshold;
        if low_confidence {
            warn!(aggregate_score, threshold = self.config.plan_score_threshold, "plan below confidence threshold");
        }
        info!(method = %method, candidates = candidates.len(), merged = merged.len(), aggregate_score, "plan produced");

        Ok(Planned {
            plan: Plan {
                id: PlanId::new(),
                task_id: request.task_id,
                revision: request.revision,
                method,
                merged_subtasks: merged,
                candidates,
                aggregate_score,
                low_confidence,
                feedback_applied: request.feedback_text(),
                created_at: Utc::now(),
            },
            usage,
        })
    }

    fn base_variables(&self, request: &PlanningRequest) -> Variables {
        let mut vars = Variables::new().with("summary", request.spec.summary.clone());
        if request.spec.has_description() {
            vars.insert("description", request.spec.description.clone());
        } else {
            debug!("empty description, planning from summary alone");
        }
        if let Some(feedback) = request.feedback_text() {
            vars.insert("feedback", feedback);
        }
        vars
    }

    async fn call<C: Contract>(
        &self,
        template: Template,
        vars: &Variables,
    ) -> Result<Generated<C>, PlanningError> {
        let generated = self.client.invoke::<C>(template, vars).await?;
        self.metrics.generation_call(template.as_str(), generated.usage.total());
        Ok(generated)
    }

    async fn classify(&self, base: &Variables, usage: &mut TokenUsage) -> Result<PlanningMethod, PlanningError> {
        let decision = self.call::<ComplexityDecision>(Template::ClassifyComplexity, base).await?;
        *usage += decision.usage;
        let method = decision.value.planning_method();
        debug!(method = %method, answer = %decision.value.method, "complexity classified");
        Ok(method)
    }

    async fn generate(
        &self,
        method: PlanningMethod,
        base: &Variables,
        usage: &mut TokenUsage,
    ) -> Result<Vec<CandidateDraft>, PlanningError> {
        let (template, count) = match method {
            PlanningMethod::Chain => (Template::ChainCandidates, self.config.chain_candidates),
            PlanningMethod::Graph => (Template::GraphCandidates, self.config.graph_candidates),
        };
        let vars = base.clone().with("count", count);
        let batch = self.call::<CandidateBatch>(template, &vars).await?;
        *usage += batch.usage;

        let drafts = batch.value.candidates;
        if drafts.len() != count {
            return Err(PlanningError::SchemaValidation {
                template,
                detail: format!("expected {count} candidates, got {}", drafts.len()),
            });
        }
        Ok(drafts)
    }

    async fn score_all(
        &self,
        drafts: Vec<CandidateDraft>,
        base: &Variables,
        usage: &mut TokenUsage,
    ) -> Result<Vec<CandidateSubtask>, PlanningError> {
        let calls = drafts.iter().map(|draft| {
            let vars = base
                .clone()
                .with("candidate_id", draft.id.clone())
                .with("candidate_description", draft.description.clone());
            async move { self.call::<CandidateScore>(Template::ScoreCandidate, &vars).await }
        });
        let scores = try_join_all(calls).await?;

        Ok(drafts
            .into_iter()
            .zip(scores)
            .map(|(draft, scored)| {
                *usage += scored.usage;
                let rubric = scored.value.rubric();
                CandidateSubtask {
                    id: CandidateId::new(draft.id.trim()),
                    description: draft.description,
                    scores: Some(rubric),
                    total_score: f64::from(rubric.total()),
                    reasoning: scored.value.reasoning,
                    requirements_covered: scored.value.requirements_covered,
                }
            })
            .collect())
    }

    async fn generated_merge(
        &self,
        candidates: &[CandidateSubtask],
        k: usize,
        base: &Variables,
        usage: &mut TokenUsage,
    ) -> Result<Vec<MergedSubtask>, PlanningError> {
        let ids: Vec<CandidateId> = candidates.iter().map(|c| c.id.clone()).collect();
        let vars = base
            .clone()
            .with("candidates", candidates_json(candidates))
            .with("k", k);

        let first = self.call::<MergeProposal>(Template::MergeCandidates, &vars).await?;
        *usage += first.usage;
        let merged = to_subtasks(&first.value, candidates);
        let report = check_coverage(&ids, &merged, k);
        if report.is_valid() {
            return Ok(merged);
        }

        warn!(violation = %report, "merge violated coverage, requesting correction");
        let correction = vars
            .with("violation", report.to_string())
            .with("previous", serde_json::to_value(&first.value).unwrap_or(Value::Null));
        let second = self.call::<MergeProposal>(Template::MergeCorrection, &correction).await?;
        *usage += second.usage;
        let merged = to_subtasks(&second.value, candidates);
        let report = check_coverage(&ids, &merged, k);
        if report.is_valid() {
            Ok(merged)
        } else {
            Err(PlanningError::CoverageViolation(report))
        }
    }
}

fn prescored(draft: CandidateDraft) -> CandidateSubtask {
    CandidateSubtask {
        id: CandidateId::new(draft.id.trim()),
        description: draft.description,
        scores: None,
        total_score: MAX_CANDIDATE_SCORE,
        reasoning: "chain candidate, pre-scored".to_string(),
        requirements_covered: draft.requirements_covered,
    }
}

fn identity_merge(candidates: &[CandidateSubtask]) -> Vec<MergedSubtask> {
    candidates
        .iter()
        .zip(1_u32..)
        .map(|(c, position)| MergedSubtask {
            id: position,
            description: c.description.clone(),
            covered_candidate_ids: vec![c.id.clone()],
            reasoning: "single candidate".to_string(),
            duplicate_justification: None,
            score: c.total_score,
        })
        .collect()
}

fn candidates_json(candidates: &[CandidateSubtask]) -> Value {
    Value::Array(
        candidates
            .iter()
            .map(|c| {
                json!({
                    "id": c.id.as_str(),
                    "description": c.description,
                    "total_score": c.total_score,
                    "requirements_covered": c.requirements_covered,
                })
            })
            .collect(),
    )
}

fn to_subtasks(proposal: &MergeProposal, candidates: &[CandidateSubtask]) -> Vec<MergedSubtask> {
    let scores: HashMap<&str, f64> = candidates.iter().map(|c| (c.id.as_str(), c.total_score)).collect();
    proposal
        .merged_subtasks
        .iter()
        .zip(1_u32..)
        .map(|(draft, position)| {
            let covered: Vec<CandidateId> = draft.merged_from.iter().map(|id| CandidateId::new(id.trim())).collect();
            let member_scores: Vec<f64> = covered
                .iter()
                .filter_map(|id| scores.get(id.as_str()).copied())
                .collect();
            MergedSubtask {
                id: position,
                description: draft.description.clone(),
                covered_candidate_ids: covered,
                reasoning: draft.reasoning.clone(),
                duplicate_justification: draft.duplicate_justification.clone(),
                score: mean(&member_scores),
            }
        })
        .collect()
}

/// Verify an existing plan against its own candidates
#[must_use]
pub fn verify_plan(plan: &Plan, k: usize) -> CoverageReport {
    let ids: Vec<CandidateId> = plan.candidate_ids().cloned().collect();
    check_coverage(&ids, &plan.merged_subtasks, k)
}
