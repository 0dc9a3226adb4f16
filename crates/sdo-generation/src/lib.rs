//! SDO Generation Layer
//!
//! The engine never trusts model output. Each template has a typed
//! [`Contract`]; the [`GenerationClient`] retries transient provider errors
//! with exponential backoff, decodes into the contract, and gives malformed
//! output exactly one repair pass before failing with
//! [`GenerationError::SchemaValidation`].
//!
//! # Example
//!
//! ```rust,ignore
//! use sdo_generation::{contract::DimensionEvaluation, GenerationClient, RetryPolicy, Template, Variables};
//!
//! let client = GenerationClient::new(service, RetryPolicy::default());
//! let eval = client
//!     .invoke::<DimensionEvaluation>(Template::EvaluateSecurity, &Variables::new().with("diff", diff))
//!     .await?;
//! println!("security score {}", eval.value.score);
//! ```

#![warn(unreachable_pub)]

pub mod client;
pub mod contract;
pub mod error;
pub mod repair;
pub mod scripted;
pub mod service;

pub use client::{GenerationClient, Generated, RetryPolicy};
pub use contract::{decode, Contract};
pub use error::GenerationError;
pub use scripted::{RecordedCall, Responder, ScriptedGenerationService};
pub use service::{GenerationService, Payload, StructuredOutput, Template, TokenUsage, Variables};
