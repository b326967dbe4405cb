//! Append-only journal of attempted actions and model predictions for one
//! task. Handed off by value to the export subsystem at termination.

use serde::{Deserialize, Serialize};

use crate::action::NoopKind;

/// One attempted (or refused) action.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionRecord {
    /// URL observed immediately before the action.
    pub url: String,
    /// Human-readable description, e.g. `clicked 'Login'`.
    pub description: String,
    pub success: bool,
    /// Set when the action was decided upon but not performed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub noop: Option<NoopKind>,
    /// Model's one-sentence rationale.
    pub explanation: String,
}

/// Raw model outputs for one decision attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PredictionRecord {
    pub planning_output: String,
    pub grounding_output: String,
    /// Descriptor of the chosen element, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub element: Option<String>,
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    pub explanation: String,
}

/// Ordered action and prediction histories for a task.
#[derive(Debug, Default)]
pub struct TaskJournal {
    actions: Vec<ActionRecord>,
    predictions: Vec<PredictionRecord>,
}

impl TaskJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_action(&mut self, record: ActionRecord) {
        self.actions.push(record);
    }

    pub fn record_prediction(&mut self, record: PredictionRecord) {
        self.predictions.push(record);
    }

    pub fn actions(&self) -> &[ActionRecord] {
        &self.actions
    }

    pub fn predictions(&self) -> &[PredictionRecord] {
        &self.predictions
    }

    /// Number of actions recorded so far; used as the action index for
    /// screenshot association.
    pub fn action_count(&self) -> u32 {
        self.actions.len() as u32
    }

    /// Descriptions of prior actions, oldest first, for prompt assembly.
    pub fn action_descriptions(&self) -> Vec<String> {
        self.actions.iter().map(|a| a.description.clone()).collect()
    }

    /// Hand both histories off by value at task end.
    pub fn into_parts(self) -> (Vec<ActionRecord>, Vec<PredictionRecord>) {
        (self.actions, self.predictions)
    }
}
