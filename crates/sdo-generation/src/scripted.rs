//! Deterministic, offline generation backend
//!
//! Responses are queued per template and consumed in order. When a queue is
//! empty the optional responder is consulted. Every call is recorded so
//! callers can assert which variables reached the model.

use crate::error::GenerationError;
use crate::service::{GenerationService, StructuredOutput, Template, Variables};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

/// Fallback used when no response is queued
pub type Responder =
    Arc<dyn Fn(Template, &Variables) -> Result<StructuredOutput, GenerationError> + Send + Sync>;

/// One recorded call
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    /// Template
    pub template: Template,
    /// Variables as sent
    pub variables: Variables,
}

/// Scripted generation service
#[derive(Default)]
pub struct ScriptedGenerationService {
    queues: Mutex<HashMap<Template, VecDeque<Result<StructuredOutput, GenerationError>>>>,
    responder: Option<Responder>,
    calls: Mutex<Vec<RecordedCall>>,
    latency: Option<Duration>,
}

impl std::fmt::Debug for ScriptedGenerationService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedGenerationService")
            .field("calls", &self.calls.lock().len())
            .field("latency", &self.latency)
            .finish_non_exhaustive()
    }
}

impl ScriptedGenerationService {
    /// Empty script
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer unqueued calls with `responder`
    #[must_use]
    pub fn with_responder(mut self, responder: Responder) -> Self {
        self.responder = Some(responder);
        self
    }

    /// Sleep before every answer
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Queue a result
    pub fn push(&self, template: Template, result: Result<StructuredOutput, GenerationError>) {
        self.queues.lock().entry(template).or_default().push_back(result);
    }

    /// Queue a JSON answer
    pub fn push_json(&self, template: Template, value: Value) {
        self.push(template, Ok(StructuredOutput::json(value)));
    }

    /// Queue a text answer
    pub fn push_text(&self, template: Template, text: &str) {
        self.push(template, Ok(StructuredOutput::text(text)));
    }

    /// Queue a failure
    pub fn push_err(&self, template: Template, error: GenerationError) {
        self.push(template, Err(error));
    }

    /// Every call so far
    #[must_use]
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    /// Variables of every call to one template
    #[must_use]
    pub fn calls_for(&self, template: Template) -> Vec<Variables> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.template == template)
            .map(|c| c.variables.clone())
            .collect()
    }

    /// Number of calls to one template
    #[must_use]
    pub fn call_count(&self, template: Template) -> usize {
        self.calls.lock().iter().filter(|c| c.template == template).count()
    }

    /// Queued responses not yet consumed
    #[must_use]
    pub fn pending(&self, template: Template) -> usize {
        self.queues.lock().get(&template).map_or(0, VecDeque::len)
    }
}

#[async_trait]
impl GenerationService for ScriptedGenerationService {
    async fn invoke(
        &self,
        template: Template,
        variables: &Variables,
    ) -> Result<StructuredOutput, GenerationError> {
        self.calls.lock().push(RecordedCall {
            template,
            variables: variables.clone(),
        });
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let queued = self
            .queues
            .lock()
            .get_mut(&template)
            .and_then(VecDeque::pop_front);
        match (queued, &self.responder) {
            (Some(result), _) => result,
            (None, Some(responder)) => responder(template, variables),
            (None, None) => Err(GenerationError::Rejected(format!(
                "no scripted response for {template}"
            ))),
        }
    }
}
