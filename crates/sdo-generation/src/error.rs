//! Generation errors

use crate::service::Template;
use std::time::Duration;

/// Errors from the generation layer
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GenerationError {
    /// Network or provider hiccup
    #[error("transient provider error: {0}")]
    Transient(String),

    /// Provider did not answer in time
    #[error("provider timed out after {0:?}")]
    Timeout(Duration),

    /// Provider refused the request; retrying will not help
    #[error("provider rejected request: {0}")]
    Rejected(String),

    /// Output did not match the contract, even after repair
    #[error("schema validation failed for {template}: {detail}")]
    SchemaValidation {
        /// Template whose output was invalid
        template: Template,
        /// What was wrong
        detail: String,
    },

    /// Transient failures outlasted the retry policy
    #[error("{template} failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// Template being called
        template: Template,
        /// Attempts made
        attempts: u32,
        /// Last error seen
        last: String,
    },
}

impl GenerationError {
    /// Whether the call may succeed if repeated
    #[inline]
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout(_))
    }

    /// Whether this is a structural validation failure
    #[inline]
    #[must_use]
    pub fn is_schema(&self) -> bool {
        matches!(self, Self::SchemaValidation { .. })
    }
}
