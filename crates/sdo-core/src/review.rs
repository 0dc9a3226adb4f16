//! Review aggregation
//!
//! Scores a change set on completeness, security and standards with one
//! evaluation call per dimension, run concurrently. Static analysis, when
//! configured, is submitted first and polled for a bounded time; its score
//! is blended into the dimensions that use it.

use crate::config::ReviewWeights;
use crate::connectors::{AnalysisResult, StaticAnalysis};
use crate::error::WorkflowError;
use chrono::Utc;
use futures::future::try_join_all;
use sdo_artifact::{
    AnalysisStatus, ChangeSet, DimensionResult, Plan, ReviewDimension, ReviewId, ReviewReport, Task,
};
use sdo_generation::contract::DimensionEvaluation;
use sdo_generation::{GenerationClient, Template, TokenUsage, Variables};
use sdo_kernel::MetricsSink;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Review output plus tokens spent
#[derive(Debug, Clone, PartialEq)]
pub struct Reviewed {
    /// Scored report
    pub report: ReviewReport,
    /// Tokens across the evaluation calls
    pub usage: TokenUsage,
}

/// Evaluation template for a dimension
#[must_use]
pub fn template_for(dimension: ReviewDimension) -> Template {
    match dimension {
        ReviewDimension::Completeness => Template::EvaluateCompleteness,
        ReviewDimension::Security => Template::EvaluateSecurity,
        ReviewDimension::Standards => Template::EvaluateStandards,
    }
}

/// Weighted mean of dimension scores
///
/// Weights of dimensions absent from `results` are ignored. An empty or
/// zero-weight input aggregates to 0.
#[must_use]
pub fn aggregate(results: &[DimensionResult], weights: &ReviewWeights) -> f64 {
    let (sum, total_weight) = results.iter().fold((0.0, 0.0), |(sum, w), r| {
        let weight = weights.weight(r.dimension);
        (sum + r.score * weight, w + weight)
    });
    if total_weight > 0.0 {
        sum / total_weight
    } else {
        0.0
    }
}

/// Build a report from dimension results
#[must_use]
pub fn build_report(
    task: &Task,
    changeset: &ChangeSet,
    dimensions: Vec<DimensionResult>,
    weights: &ReviewWeights,
    threshold: f64,
) -> ReviewReport {
    let aggregate_score = aggregate(&dimensions, weights);
    let critical = dimensions.iter().any(|d| d.critical);
    let mistakes = dimensions
        .iter()
        .flat_map(|d| d.mistakes.iter().map(move |m| format!("{}: {m}", d.dimension)))
        .collect();
    ReviewReport {
        id: ReviewId::new(),
        task_id: task.id,
        changeset_id: changeset.id,
        dimensions,
        aggregate_score,
        threshold,
        passed: aggregate_score >= threshold && !critical,
        mistakes,
        created_at: Utc::now(),
    }
}

fn blend(dimension: ReviewDimension, evaluation: f64, analysis: Option<&Option<AnalysisResult>>) -> (f64, AnalysisStatus) {
    if !dimension.uses_static_analysis() {
        return (evaluation, AnalysisStatus::NotApplicable);
    }
    match analysis {
        None => (evaluation, AnalysisStatus::NotApplicable),
        Some(None) => (evaluation, AnalysisStatus::Unknown),
        Some(Some(result)) => (
            (evaluation + result.score) / 2.0,
            AnalysisStatus::Available(result.score),
        ),
    }
}

/// Scores change sets
pub struct ReviewAggregator {
    client: GenerationClient,
    weights: ReviewWeights,
    threshold: f64,
    analysis: Option<Arc<dyn StaticAnalysis>>,
    analysis_timeout: Duration,
    poll_interval: Duration,
    metrics: Arc<dyn MetricsSink>,
}

impl std::fmt::Debug for ReviewAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReviewAggregator")
            .field("weights", &self.weights)
            .field("threshold", &self.threshold)
            .field("static_analysis", &self.analysis.is_some())
            .finish_non_exhaustive()
    }
}

impl ReviewAggregator {
    /// Aggregator without static analysis
    #[must_use]
    pub fn new(
        client: GenerationClient,
        weights: ReviewWeights,
        threshold: f64,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            client,
            weights,
            threshold,
            analysis: None,
            analysis_timeout: Duration::from_secs(120),
            poll_interval: Duration::from_secs(2),
            metrics,
        }
    }

    /// With a static analysis connector and its bounded wait
    #[must_use]
    pub fn with_static_analysis(
        mut self,
        analysis: Arc<dyn StaticAnalysis>,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        self.analysis = Some(analysis);
        self.analysis_timeout = timeout;
        self.poll_interval = poll_interval;
        self
    }

    /// Pass threshold
    #[inline]
    #[must_use]
    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Score one change set against its plan
    #[instrument(skip_all, fields(task_id = %task.id, attempt = changeset.attempt_number))]
    pub async fn review(
        &self,
        task: &Task,
        plan: &Plan,
        changeset: &ChangeSet,
    ) -> Result<Reviewed, WorkflowError> {
        // Outer Option: connector configured. Inner: result arrived in time.
        let analysis = match &self.analysis {
            Some(connector) => Some(self.await_analysis(connector.as_ref(), changeset).await),
            None => None,
        };

        let mut base = Variables::new()
            .with("summary", task.spec.summary.clone())
            .with("plan", plan.render_steps())
            .with("artifact_ref", changeset.artifact_ref.clone())
            .with("change_summary", changeset.summary.clone());
        if let Some(Some(result)) = &analysis {
            base.insert("analysis_findings", result.findings.join("\n"));
        }

        let calls = ReviewDimension::ALL.iter().map(|&dimension| {
            let vars = base.clone();
            async move {
                let template = template_for(dimension);
                let generated = self.client.invoke::<DimensionEvaluation>(template, &vars).await?;
                self.metrics.generation_call(template.as_str(), generated.usage.total());
                Ok::<_, WorkflowError>((dimension, generated))
            }
        });
        let evaluated = try_join_all(calls).await?;

        let mut usage = TokenUsage::default();
        let dimensions = evaluated
            .into_iter()
            .map(|(dimension, generated)| {
                usage += generated.usage;
                let eval = generated.value;
                let (score, status) = blend(dimension, eval.score, analysis.as_ref());
                debug!(dimension = %dimension, evaluation = eval.score, score, critical = eval.critical, "dimension scored");
                DimensionResult {
                    dimension,
                    score,
                    evaluation_score: eval.score,
                    critical: eval.critical,
                    mistakes: eval.mistakes,
                    reasoning: eval.reasoning,
                    analysis: status,
                }
            })
            .collect();

        let report = build_report(task, changeset, dimensions, &self.weights, self.threshold);
        self.metrics.review_scored(report.aggregate_score, report.passed);
        info!(
            aggregate = report.aggregate_score,
            threshold = report.threshold,
            passed = report.passed,
            "review complete"
        );
        Ok(Reviewed { report, usage })
    }

    async fn await_analysis(&self, connector: &dyn StaticAnalysis, changeset: &ChangeSet) -> Option<AnalysisResult> {
        let handle = match connector.submit(changeset).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!(error = %e, "static analysis submit failed, continuing without it");
                return None;
            }
        };
        let deadline = tokio::time::Instant::now() + self.analysis_timeout;
        loop {
            match connector.poll(&handle).await {
                Ok(Some(result)) => return Some(result),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "static analysis poll failed"),
            }
            if tokio::time::Instant::now() + self.poll_interval > deadline {
                warn!(timeout = ?self.analysis_timeout, "static analysis did not finish, marking unknown");
                return None;
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
