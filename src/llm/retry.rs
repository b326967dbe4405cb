//! Retry wrapper for model engines.
//!
//! Transient transport failures are retried with capped exponential backoff;
//! an error surfacing from here means retries are exhausted and the task
//! terminates.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use wayfinder_agent::{AgentError, ModelEngine, ModelQuery};

const MAX_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY_MS: u64 = 250;

pub struct RetryEngine {
    inner: Arc<dyn ModelEngine>,
}

impl RetryEngine {
    pub fn new(inner: Arc<dyn ModelEngine>) -> Self {
        Self { inner }
    }

    fn backoff(attempt: u32) -> Duration {
        Duration::from_millis(RETRY_BASE_DELAY_MS * 2u64.pow(attempt - 1))
    }
}

macro_rules! retrying {
    ($self:ident, $mode:literal, $call:expr) => {{
        let mut last_err = None;
        for attempt in 1..=MAX_ATTEMPTS {
            match $call.await {
                Ok(output) => return Ok(output),
                Err(err) => {
                    warn!(mode = $mode, attempt, %err, "model call failed");
                    if attempt < MAX_ATTEMPTS {
                        tokio::time::sleep(Self::backoff(attempt)).await;
                    }
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| AgentError::model("model call failed")))
    }};
}

#[async_trait]
impl ModelEngine for RetryEngine {
    async fn generate_plan(&self, query: &ModelQuery) -> Result<String, AgentError> {
        retrying!(self, "planning", self.inner.generate_plan(query))
    }

    async fn generate_grounding(
        &self,
        query: &ModelQuery,
        planning_output: &str,
    ) -> Result<String, AgentError> {
        retrying!(
            self,
            "grounding",
            self.inner.generate_grounding(query, planning_output)
        )
    }

    async fn generate_judgment(
        &self,
        query: &ModelQuery,
        planning_output: &str,
        grounding_output: &str,
    ) -> Result<String, AgentError> {
        retrying!(
            self,
            "judgment",
            self.inner
                .generate_judgment(query, planning_output, grounding_output)
        )
    }
}
