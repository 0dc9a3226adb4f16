//! Retrying, validating client over a [`GenerationService`]

use crate::contract::{decode, Contract};
use crate::error::GenerationError;
use crate::service::{GenerationService, StructuredOutput, Template, TokenUsage, Variables};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Backoff policy for transient provider errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts per call, including the first
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub base_delay: Duration,
    /// Upper bound on any single delay
    pub max_delay: Duration,
    /// Per-attempt deadline; `None` waits for the provider
    pub call_timeout: Option<Duration>,
}

impl RetryPolicy {
    /// Delay after the given failed attempt (1-based), doubling each time
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.base_delay
            .checked_mul(1_u32 << exp)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// No waiting between attempts
    #[must_use]
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            call_timeout: None,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            call_timeout: Some(Duration::from_secs(120)),
        }
    }
}

/// Validated output plus bookkeeping
#[derive(Debug, Clone, PartialEq)]
pub struct Generated<C> {
    /// Decoded, validated value
    pub value: C,
    /// Tokens spent, including any repair call
    pub usage: TokenUsage,
    /// Provider attempts for the primary call
    pub attempts: u32,
    /// Whether the repair template was needed
    pub repaired: bool,
}

/// Client used by the engine for every generation call
#[derive(Clone)]
pub struct GenerationClient {
    service: Arc<dyn GenerationService>,
    policy: RetryPolicy,
}

impl std::fmt::Debug for GenerationClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationClient")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl GenerationClient {
    /// Wrap a service
    #[must_use]
    pub fn new(service: Arc<dyn GenerationService>, policy: RetryPolicy) -> Self {
        Self { service, policy }
    }

    /// Retry policy in force
    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Call with transient retry, no decoding
    pub async fn invoke_raw(
        &self,
        template: Template,
        variables: &Variables,
    ) -> Result<(StructuredOutput, u32), GenerationError> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match self.policy.call_timeout {
                Some(limit) => tokio::time::timeout(limit, self.service.invoke(template, variables))
                    .await
                    .unwrap_or(Err(GenerationError::Timeout(limit))),
                None => self.service.invoke(template, variables).await,
            };
            match result {
                Ok(output) => {
                    debug!(template = %template, attempt, "generation call succeeded");
                    return Ok((output, attempt));
                }
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let delay = self.policy.delay_for(attempt);
                    warn!(template = %template, attempt, ?delay, error = %e, "transient generation failure, backing off");
                    tokio::time::sleep(delay).await;
                }
                Err(e) if e.is_transient() => {
                    return Err(GenerationError::RetriesExhausted {
                        template,
                        attempts: attempt,
                        last: e.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Call, decode into `C`, and run one repair pass if decoding fails
    pub async fn invoke<C: Contract>(
        &self,
        template: Template,
        variables: &Variables,
    ) -> Result<Generated<C>, GenerationError> {
        let (output, attempts) = self.invoke_raw(template, variables).await?;
        let mut usage = output.usage_or_estimate(variables);

        let first_error = match decode::<C>(&output.payload) {
            Ok(value) => {
                return Ok(Generated {
                    value,
                    usage,
                    attempts,
                    repaired: false,
                })
            }
            Err(e) => e,
        };

        warn!(template = %template, error = %first_error, "output failed validation, attempting repair");
        let repair_vars = Variables::new()
            .with("template", template.as_str())
            .with("output", output.payload.as_text())
            .with("error", first_error.clone());
        let (fixed, _) = self.invoke_raw(Template::SchemaRepair, &repair_vars).await?;
        usage += fixed.usage_or_estimate(&repair_vars);

        decode::<C>(&fixed.payload)
            .map(|value| Generated {
                value,
                usage,
                attempts,
                repaired: true,
            })
            .map_err(|second| GenerationError::SchemaValidation {
                template,
                detail: format!("{first_error}; after repair: {second}"),
            })
    }
}
