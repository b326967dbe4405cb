//! Model engine abstraction.
//!
//! The controller composes three model calls per decision step: planning,
//! grounding, and (for risky actions) judgment. Transport, provider wire
//! formats, and retry policy live behind this trait so multiple vendors can
//! plug in.

use std::collections::VecDeque;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;

use crate::errors::AgentError;

/// Prompt bundle for one model invocation.
#[derive(Debug, Clone)]
pub struct ModelQuery {
    pub system_prompt: String,
    pub query: String,
    /// Base64 PNG attached to multimodal calls.
    pub screenshot_base64: Option<String>,
}

impl ModelQuery {
    pub fn new(system_prompt: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            query: query.into(),
            screenshot_base64: None,
        }
    }

    pub fn with_screenshot(mut self, screenshot_base64: Option<String>) -> Self {
        self.screenshot_base64 = screenshot_base64;
        self
    }
}

/// Abstraction over multimodal model backends.
///
/// Implementations are expected to retry transient transport failures
/// internally; an `Err` from any method means retries are exhausted and the
/// task must terminate.
#[async_trait]
pub trait ModelEngine: Send + Sync {
    /// Planning mode: free-text reasoning over the screenshot and history.
    async fn generate_plan(&self, query: &ModelQuery) -> Result<String, AgentError>;

    /// Grounding mode: a structured choice given the planning output.
    async fn generate_grounding(
        &self,
        query: &ModelQuery,
        planning_output: &str,
    ) -> Result<String, AgentError>;

    /// Judgment mode: a severity assessment of the proposed action.
    async fn generate_judgment(
        &self,
        query: &ModelQuery,
        planning_output: &str,
        grounding_output: &str,
    ) -> Result<String, AgentError>;
}

/// Deserialize the JSON object embedded in a model reply into `T`.
///
/// Replies rarely arrive as bare JSON; the object is usually wrapped in
/// prose, a markdown fence, or both. Rather than stripping wrappers, every
/// `{` in the reply is offered to a streaming deserializer until one yields
/// an object that matches the expected shape. Errors distinguish "no JSON
/// object at all" from "an object that lacks the expected fields" so the
/// judge's reprompt reminders can stay accurate.
pub fn parse_reply<T: DeserializeOwned>(raw: &str) -> Result<T, AgentError> {
    let mut saw_object = false;
    for (start, _) in raw.match_indices('{') {
        let mut values = serde_json::Deserializer::from_str(&raw[start..])
            .into_iter::<serde_json::Value>();
        let Some(Ok(value)) = values.next() else {
            continue;
        };
        if !value.is_object() {
            continue;
        }
        saw_object = true;
        if let Ok(parsed) = serde_json::from_value(value) {
            return Ok(parsed);
        }
    }
    Err(if saw_object {
        AgentError::malformed("reply JSON is missing the expected fields")
    } else {
        AgentError::malformed("reply contains no JSON object")
    })
}

/// Deterministic engine used for tests and offline development.
///
/// Outputs are scripted per mode and consumed front to back; when a queue
/// runs dry the engine falls back to a safe terminate decision.
#[derive(Debug, Default)]
pub struct MockModelEngine {
    plans: Mutex<VecDeque<String>>,
    groundings: Mutex<VecDeque<String>>,
    judgments: Mutex<VecDeque<String>>,
    seen_queries: Mutex<Vec<String>>,
}

impl MockModelEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_plan(&self, output: impl Into<String>) -> &Self {
        self.plans.lock().push_back(output.into());
        self
    }

    pub fn push_grounding(&self, output: impl Into<String>) -> &Self {
        self.groundings.lock().push_back(output.into());
        self
    }

    pub fn push_judgment(&self, output: impl Into<String>) -> &Self {
        self.judgments.lock().push_back(output.into());
        self
    }

    /// Query texts seen so far, in call order.
    pub fn seen_queries(&self) -> Vec<String> {
        self.seen_queries.lock().clone()
    }
}

#[async_trait]
impl ModelEngine for MockModelEngine {
    async fn generate_plan(&self, query: &ModelQuery) -> Result<String, AgentError> {
        self.seen_queries.lock().push(query.query.clone());
        Ok(self
            .plans
            .lock()
            .pop_front()
            .unwrap_or_else(|| "The task appears complete.".to_string()))
    }

    async fn generate_grounding(
        &self,
        query: &ModelQuery,
        _planning_output: &str,
    ) -> Result<String, AgentError> {
        self.seen_queries.lock().push(query.query.clone());
        Ok(self.groundings.lock().pop_front().unwrap_or_else(|| {
            r#"{"element": null, "action": "TERMINATE", "value": null, "explanation": "No further scripted steps."}"#
                .to_string()
        }))
    }

    async fn generate_judgment(
        &self,
        query: &ModelQuery,
        _planning_output: &str,
        _grounding_output: &str,
    ) -> Result<String, AgentError> {
        self.seen_queries.lock().push(query.query.clone());
        Ok(self.judgments.lock().pop_front().unwrap_or_else(|| {
            r#"{"severity": "SAFE", "explanation": "Routine interaction."}"#.to_string()
        }))
    }
}
