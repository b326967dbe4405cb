//! Automated safety review of proposed actions.
//!
//! Before a CLICK or PRESS_ENTER is dispatched (and monitor mode is not
//! already on), the model is consulted a third time in judgment mode. The
//! judged severity is compared against the configured threshold to decide
//! whether a human must approve the action.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::errors::AgentError;
use crate::model::{parse_reply, ModelEngine, ModelQuery};
use crate::prompt;

/// Ordinal risk rating. Variant order is the comparison order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Safe,
    Low,
    Medium,
    High,
    Catastrophic,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Safe => "SAFE",
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Catastrophic => "CATASTROPHIC",
        }
    }
}

impl FromStr for Severity {
    type Err = AgentError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "SAFE" => Ok(Self::Safe),
            "LOW" => Ok(Self::Low),
            "MEDIUM" => Ok(Self::Medium),
            "HIGH" => Ok(Self::High),
            "CATASTROPHIC" => Ok(Self::Catastrophic),
            other => Err(AgentError::Config(format!(
                "unknown severity name '{other}'"
            ))),
        }
    }
}

/// Parsed judgment-mode response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeVerdict {
    pub severity: Severity,
    pub explanation: String,
}

impl JudgeVerdict {
    /// Whether this verdict crosses the escalation threshold.
    pub fn escalates(&self, threshold: Severity) -> bool {
        self.severity >= threshold
    }
}

#[derive(Debug, Deserialize)]
struct RawVerdict {
    severity: Option<String>,
    explanation: Option<String>,
}

/// Parse a raw judgment response into a verdict.
pub fn parse_verdict(raw: &str) -> Result<JudgeVerdict, AgentError> {
    let parsed: RawVerdict = parse_reply(raw)?;
    let severity = parsed
        .severity
        .ok_or_else(|| AgentError::malformed("judgment response missing severity"))?
        .parse::<Severity>()
        .map_err(|err| AgentError::malformed(format!("judgment severity invalid: {err}")))?;
    Ok(JudgeVerdict {
        severity,
        explanation: parsed.explanation.unwrap_or_default(),
    })
}

/// Number of attempts to obtain a well-formed judgment response.
pub const MAX_JUDGE_ATTEMPTS: u32 = 3;

/// Invoke judgment mode, retrying with a terser reminder when the response
/// does not parse. Exhausting all attempts is a terminal error.
pub async fn assess(
    engine: &dyn ModelEngine,
    query: &ModelQuery,
    planning_output: &str,
    grounding_output: &str,
) -> Result<JudgeVerdict, AgentError> {
    let mut query = query.clone();
    for attempt in 1..=MAX_JUDGE_ATTEMPTS {
        let raw = engine
            .generate_judgment(&query, planning_output, grounding_output)
            .await?;
        match parse_verdict(&raw) {
            Ok(verdict) => return Ok(verdict),
            Err(err) if attempt < MAX_JUDGE_ATTEMPTS => {
                warn!(attempt, %err, "judgment response malformed, reprompting");
                query.query.push_str(prompt::judge_retry_reminder(attempt));
            }
            Err(err) => {
                return Err(AgentError::malformed(format!(
                    "judgment unparseable after {MAX_JUDGE_ATTEMPTS} attempts: {err}"
                )))
            }
        }
    }
    unreachable!("judge attempt loop always returns")
}
