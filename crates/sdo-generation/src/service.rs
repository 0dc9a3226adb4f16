//! Generation service seam

use crate::error::GenerationError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::ops::AddAssign;

/// Template identifiers understood by the generation service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Template {
    /// Chain or graph decision
    ClassifyComplexity,
    /// Short ordered candidate list
    ChainCandidates,
    /// Larger unscored candidate set
    GraphCandidates,
    /// Rubric score for one candidate
    ScoreCandidate,
    /// Group candidates into K subtasks
    MergeCandidates,
    /// Merge retry after a coverage violation
    MergeCorrection,
    /// Review: does the change implement the plan
    EvaluateCompleteness,
    /// Review: security issues
    EvaluateSecurity,
    /// Review: coding standards
    EvaluateStandards,
    /// First development attempt
    DevelopChange,
    /// Development attempt with review feedback
    ReviseChange,
    /// Fix malformed structured output
    SchemaRepair,
}

impl Template {
    /// Stable name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClassifyComplexity => "classify_complexity",
            Self::ChainCandidates => "chain_candidates",
            Self::GraphCandidates => "graph_candidates",
            Self::ScoreCandidate => "score_candidate",
            Self::MergeCandidates => "merge_candidates",
            Self::MergeCorrection => "merge_correction",
            Self::EvaluateCompleteness => "evaluate_completeness",
            Self::EvaluateSecurity => "evaluate_security",
            Self::EvaluateStandards => "evaluate_standards",
            Self::DevelopChange => "develop_change",
            Self::ReviseChange => "revise_change",
            Self::SchemaRepair => "schema_repair",
        }
    }
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured template variables
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Variables(Map<String, Value>);

impl Variables {
    /// Empty set
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    #[must_use]
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    /// Insert or replace
    pub fn insert(&mut self, key: &str, value: impl Into<Value>) {
        self.0.insert(key.to_string(), value.into());
    }

    /// Look up a value
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Look up a string value
    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    /// Serialized size, used for token estimates
    #[must_use]
    pub fn char_len(&self) -> usize {
        Value::Object(self.0.clone()).to_string().len()
    }
}

/// Token accounting for one call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Prompt side
    pub prompt_tokens: u64,
    /// Completion side
    pub completion_tokens: u64,
}

impl TokenUsage {
    /// Create usage
    #[must_use]
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
        }
    }

    /// Rough estimate at four characters per token
    #[must_use]
    pub fn estimate(prompt_chars: usize, completion_chars: usize) -> Self {
        let tokens = |chars: usize| u64::try_from(chars.div_ceil(4)).unwrap_or(u64::MAX);
        Self::new(tokens(prompt_chars), tokens(completion_chars))
    }

    /// Prompt plus completion
    #[inline]
    #[must_use]
    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }

    /// Whether nothing was reported
    #[inline]
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.total() == 0
    }
}

impl AddAssign for TokenUsage {
    fn add_assign(&mut self, rhs: Self) {
        self.prompt_tokens += rhs.prompt_tokens;
        self.completion_tokens += rhs.completion_tokens;
    }
}

/// Raw output body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "body")]
pub enum Payload {
    /// Already structured
    Json(Value),
    /// Free text that should contain a JSON object
    Text(String),
}

impl Payload {
    /// Text form, for repair prompts and token estimates
    #[must_use]
    pub fn as_text(&self) -> String {
        match self {
            Self::Json(v) => v.to_string(),
            Self::Text(s) => s.clone(),
        }
    }
}

/// What the generation service returns
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredOutput {
    /// Body
    pub payload: Payload,
    /// Usage reported by the provider, zero if unknown
    #[serde(default)]
    pub usage: TokenUsage,
}

impl StructuredOutput {
    /// JSON output
    #[must_use]
    pub fn json(value: Value) -> Self {
        Self {
            payload: Payload::Json(value),
            usage: TokenUsage::default(),
        }
    }

    /// Text output
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            payload: Payload::Text(text.into()),
            usage: TokenUsage::default(),
        }
    }

    /// Attach provider usage
    #[must_use]
    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = usage;
        self
    }

    /// Provider usage, or an estimate when none was reported
    #[must_use]
    pub fn usage_or_estimate(&self, variables: &Variables) -> TokenUsage {
        if self.usage.is_zero() {
            TokenUsage::estimate(variables.char_len(), self.payload.as_text().len())
        } else {
            self.usage
        }
    }
}

/// External model provider
#[async_trait]
pub trait GenerationService: Send + Sync {
    /// Render `template` with `variables` and return the model's output
    async fn invoke(
        &self,
        template: Template,
        variables: &Variables,
    ) -> Result<StructuredOutput, GenerationError>;
}
