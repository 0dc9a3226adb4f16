//! Engine configuration
//!
//! Three layers, later wins: built-in defaults, an optional TOML file, and
//! environment overrides. [`EngineConfig::validate`] runs after all three.

use crate::error::ConfigError;
use sdo_artifact::{PlanningMethod, ReviewDimension};
use sdo_generation::RetryPolicy;
use sdo_kernel::TimeoutPolicy;
use sdo_planning::{MergeStrategy, PlanningConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Relative weight of each review dimension
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReviewWeights {
    /// Completeness weight
    pub completeness: f64,
    /// Security weight
    pub security: f64,
    /// Standards weight
    pub standards: f64,
}

impl Default for ReviewWeights {
    fn default() -> Self {
        Self {
            completeness: 1.0,
            security: 1.0,
            standards: 1.0,
        }
    }
}

impl ReviewWeights {
    /// Weight of one dimension
    #[inline]
    #[must_use]
    pub fn weight(&self, dimension: ReviewDimension) -> f64 {
        match dimension {
            ReviewDimension::Completeness => self.completeness,
            ReviewDimension::Security => self.security,
            ReviewDimension::Standards => self.standards,
        }
    }
}

/// `[planning]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlanningSection {
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
}

impl Default for PlanningSection {
    fn default() -> Self {
        let defaults = PlanningConfig::default();
        Self {
            chain_candidates: defaults.chain_candidates,
            graph_candidates: defaults.graph_candidates,
            chain_k: defaults.chain_k,
            graph_k: defaults.graph_k,
            merge_strategy: defaults.merge_strategy,
        }
    }
}

/// `[generation]` section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationSection {
    /// Attempts per call for transient errors
    pub max_attempts: u32,
    /// First backoff delay
    pub base_delay_ms: u64,
    /// Backoff cap
    pub max_delay_ms: u64,
    /// Per-call timeout, 0 disables
    pub call_timeout_secs: u64,
}

impl Default for GenerationSection {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 2_000,
            max_delay_ms: 30_000,
            call_timeout_secs: 120,
        }
    }
}

/// `[persistence]` section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceSection {
    /// Attempts per store call while the store is unavailable
    pub max_attempts: u32,
    /// First backoff delay
    pub base_delay_ms: u64,
    /// Backoff cap
    pub max_delay_ms: u64,
}

impl Default for PersistenceSection {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 100,
            max_delay_ms: 5_000,
        }
    }
}

/// `[static_analysis]` section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StaticAnalysisSection {
    /// Bounded wait for a result
    pub timeout_secs: u64,
    /// Delay between polls
    pub poll_interval_ms: u64,
}

impl Default for StaticAnalysisSection {
    fn default() -> Self {
        Self {
            timeout_secs: 120,
            poll_interval_ms: 2_000,
        }
    }
}

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Development attempts before forced escalation
    pub max_rebuild_attempts: u32,
    /// Review pass mark, 0..=100
    pub review_threshold: f64,
    /// Plan aggregate below this is flagged low-confidence
    pub plan_score_threshold: f64,
    /// Gate timeout
    pub hitl_timeout_secs: u64,
    /// What a gate timeout means
    pub gate_timeout_policy: TimeoutPolicy,
    /// Plan rejections before the task fails
    pub max_plan_revisions: u32,
    /// Concurrent task runs
    pub max_workers: usize,
    /// Single-writer lease TTL
    pub lease_ttl_secs: u64,
    /// Fallback log filter when `RUST_LOG` is unset
    pub log_level: String,
    /// Review dimension weights
    pub review_weights: ReviewWeights,
    /// Planning parameters
    pub planning: PlanningSection,
    /// Generation retry policy
    pub generation: GenerationSection,
    /// Store retry policy
    pub persistence: PersistenceSection,
    /// Static analysis wait
    pub static_analysis: StaticAnalysisSection,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_rebuild_attempts: 3,
            review_threshold: 70.0,
            plan_score_threshold: 7.0,
            hitl_timeout_secs: 30,
            gate_timeout_policy: TimeoutPolicy::Reject,
            max_plan_revisions: 3,
            max_workers: 4,
            lease_ttl_secs: 600,
            log_level: "info".to_string(),
            review_weights: ReviewWeights::default(),
            planning: PlanningSection::default(),
            generation: GenerationSection::default(),
            persistence: PersistenceSection::default(),
            static_analysis: StaticAnalysisSection::default(),
        }
    }
}

fn parse_env<T: FromStr>(key: &'static str, raw: String) -> Result<T, ConfigError> {
    raw.trim()
        .parse()
        .map_err(|_| ConfigError::Env { key, value: raw })
}

impl EngineConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With rebuild attempt limit
    #[inline]
    #[must_use]
    pub fn with_max_rebuild_attempts(mut self, attempts: u32) -> Self {
        self.max_rebuild_attempts = attempts;
        self
    }

    /// With review threshold
    #[inline]
    #[must_use]
    pub fn with_review_threshold(mut self, threshold: f64) -> Self {
        self.review_threshold = threshold;
        self
    }

    /// With gate timeout
    #[inline]
    #[must_use]
    pub fn with_hitl_timeout_secs(mut self, secs: u64) -> Self {
        self.hitl_timeout_secs = secs;
        self
    }

    /// With gate timeout policy
    #[inline]
    #[must_use]
    pub fn with_gate_timeout_policy(mut self, policy: TimeoutPolicy) -> Self {
        self.gate_timeout_policy = policy;
        self
    }

    /// With worker count
    #[inline]
    #[must_use]
    pub fn with_max_workers(mut self, workers: usize) -> Self {
        self.max_workers = workers;
        self
    }

    /// With merge strategy
    #[inline]
    #[must_use]
    pub fn with_merge_strategy(mut self, strategy: MergeStrategy) -> Self {
        self.planning.merge_strategy = strategy;
        self
    }

    /// Zero-delay retries, for tests and the simulator
    #[must_use]
    pub fn without_backoff(mut self) -> Self {
        self.generation.base_delay_ms = 0;
        self.generation.max_delay_ms = 0;
        self.persistence.base_delay_ms = 0;
        self.persistence.max_delay_ms = 0;
        self
    }

    /// Defaults, then `path` if given, then the process environment
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML file; missing keys take defaults
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    /// Parse TOML text
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// Render as TOML
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Apply environment overrides read through `lookup`
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup("MAX_REBUILD_ATTEMPTS") {
            self.max_rebuild_attempts = parse_env("MAX_REBUILD_ATTEMPTS", raw)?;
        }
        if let Some(raw) = lookup("REVIEW_THRESHOLD") {
            self.review_threshold = parse_env("REVIEW_THRESHOLD", raw)?;
        }
        if let Some(raw) = lookup("GOT_SCORE_THRESHOLD") {
            self.plan_score_threshold = parse_env("GOT_SCORE_THRESHOLD", raw)?;
        }
        if let Some(raw) = lookup("HITL_TIMEOUT_SECONDS") {
            self.hitl_timeout_secs = parse_env("HITL_TIMEOUT_SECONDS", raw)?;
        }
        if let Some(raw) = lookup("SDO_MAX_WORKERS") {
            self.max_workers = parse_env("SDO_MAX_WORKERS", raw)?;
        }
        if let Some(raw) = lookup("LOG_LEVEL") {
            self.log_level = raw.trim().to_string();
        }
        Ok(())
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.max_rebuild_attempts == 0 {
            return invalid("max_rebuild_attempts must be at least 1".to_string());
        }
        if !(0.0..=100.0).contains(&self.review_threshold) {
            return invalid(format!("review_threshold {} outside 0..=100", self.review_threshold));
        }
        if !(0.0..=10.0).contains(&self.plan_score_threshold) {
            return invalid(format!(
                "plan_score_threshold {} outside 0..=10",
                self.plan_score_threshold
            ));
        }
        for dimension in ReviewDimension::ALL {
            let w = self.review_weights.weight(dimension);
            if !w.is_finite() || w <= 0.0 {
                return invalid(format!("review weight for {dimension} must be positive, got {w}"));
            }
        }
        if self.hitl_timeout_secs == 0 {
            return invalid("hitl_timeout_secs must be at least 1".to_string());
        }
        // renewed every half TTL while a gate waits
        if self.lease_ttl_secs == 0 {
            return invalid("lease_ttl_secs must be at least 1".to_string());
        }
        if self.max_plan_revisions == 0 {
            return invalid("max_plan_revisions must be at least 1".to_string());
        }
        if self.max_workers == 0 {
            return invalid("max_workers must be at least 1".to_string());
        }
        if self.generation.max_attempts == 0 || self.persistence.max_attempts == 0 {
            return invalid("retry attempts must be at least 1".to_string());
        }
        let planning = self.planning_config();
        for method in [PlanningMethod::Chain, PlanningMethod::Graph] {
            let k = planning.k_for(method);
            let n = planning.candidates_for(method);
            if k == 0 || k > n {
                return invalid(format!(
                    "{method}: merged subtask count {k} must be between 1 and the candidate count {n}"
                ));
            }
        }
        Ok(())
    }

    /// Planning engine parameters
    #[must_use]
    pub fn planning_config(&self) -> PlanningConfig {
        PlanningConfig {
            chain_candidates: self.planning.chain_candidates,
            graph_candidates: self.planning.graph_candidates,
            chain_k: self.planning.chain_k,
            graph_k: self.planning.graph_k,
            merge_strategy: self.planning.merge_strategy,
            plan_score_threshold: self.plan_score_threshold,
        }
    }

    /// Generation retry policy
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.generation.max_attempts,
            base_delay: Duration::from_millis(self.generation.base_delay_ms),
            max_delay: Duration::from_millis(self.generation.max_delay_ms),
            call_timeout: (self.generation.call_timeout_secs > 0)
                .then(|| Duration::from_secs(self.generation.call_timeout_secs)),
        }
    }

    /// Gate timeout
    #[inline]
    #[must_use]
    pub fn hitl_timeout(&self) -> Duration {
        Duration::from_secs(self.hitl_timeout_secs)
    }

    /// Lease TTL
    #[inline]
    #[must_use]
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_rebuild_attempts, 3);
        assert!((config.review_threshold - 70.0).abs() < f64::EPSILON);
        assert_eq!(config.hitl_timeout(), Duration::from_secs(30));
        assert_eq!(config.retry_policy().delay_for(1), Duration::from_secs(2));
    }

    #[test]
    fn env_overrides_win() {
        let env: HashMap<&str, &str> = [
            ("MAX_REBUILD_ATTEMPTS", "5"),
            ("REVIEW_THRESHOLD", "82.5"),
            ("GOT_SCORE_THRESHOLD", "6"),
            ("HITL_TIMEOUT_SECONDS", "90"),
            ("LOG_LEVEL", "debug"),
        ]
        .into_iter()
        .collect();
        let mut config = EngineConfig::default();
        config
            .apply_overrides(|k| env.get(k).map(ToString::to_string))
            .unwrap();
        assert_eq!(config.max_rebuild_attempts, 5);
        assert!((config.review_threshold - 82.5).abs() < f64::EPSILON);
        assert!((config.plan_score_threshold - 6.0).abs() < f64::EPSILON);
        assert_eq!(config.hitl_timeout_secs, 90);
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn bad_env_value_is_reported() {
        let mut config = EngineConfig::default();
        let err = config
            .apply_overrides(|k| (k == "MAX_REBUILD_ATTEMPTS").then(|| "three".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Env { key: "MAX_REBUILD_ATTEMPTS", .. }));
    }

    #[test]
    fn validation_rejects_nonsense() {
        assert!(EngineConfig::default().with_max_rebuild_attempts(0).validate().is_err());
        assert!(EngineConfig::default().with_review_threshold(120.0).validate().is_err());
        assert!(EngineConfig::default().with_max_workers(0).validate().is_err());

        let mut zero_weight = EngineConfig::default();
        zero_weight.review_weights.security = 0.0;
        assert!(zero_weight.validate().is_err());

        let mut no_lease = EngineConfig::default();
        no_lease.lease_ttl_secs = 0;
        assert!(no_lease.validate().is_err());

        let mut big_k = EngineConfig::default();
        big_k.planning.graph_k = 7;
        let err = big_k.validate().unwrap_err().to_string();
        assert!(err.contains("graph"), "{err}");
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
            review_threshold = 75.0
            gate_timeout_policy = "fail"

            [planning]
            merge_strategy = "weighted"

            [review_weights]
            security = 2.0
            "#,
        )
        .unwrap();
        assert!((config.review_threshold - 75.0).abs() < f64::EPSILON);
        assert_eq!(config.gate_timeout_policy, TimeoutPolicy::Fail);
        assert_eq!(config.planning.merge_strategy, MergeStrategy::Weighted);
        assert_eq!(config.planning.graph_k, 4);
        assert!((config.review_weights.completeness - 1.0).abs() < f64::EPSILON);
        assert!((config.review_weights.security - 2.0).abs() < f64::EPSILON);
        assert_eq!(config.max_rebuild_attempts, 3);
    }

    #[test]
    fn rendered_toml_parses_back() {
        let config = EngineConfig::default().with_merge_strategy(MergeStrategy::Weighted);
        let text = config.to_toml().unwrap();
        assert_eq!(EngineConfig::from_toml_str(&text).unwrap(), config);
    }
}
