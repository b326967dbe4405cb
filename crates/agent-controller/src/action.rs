//! Action vocabulary shared by the decision pipeline and the wire protocol.

use serde::{Deserialize, Serialize};

use crate::protocol::InteractiveElement;

/// The fixed set of interactions the agent may perform on a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionKind {
    Click,
    Type,
    Select,
    ScrollUp,
    ScrollDown,
    PressEnter,
    Terminate,
    None,
}

impl ActionKind {
    /// Actions that cannot be dispatched without a target element.
    pub fn requires_element(&self) -> bool {
        matches!(self, Self::Click | Self::Type | Self::Select)
    }

    /// Actions that may unload the current page.
    pub fn may_cause_navigation(&self) -> bool {
        matches!(self, Self::Click | Self::PressEnter)
    }

    /// Parse the model's action name, case-insensitively.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_uppercase().as_str() {
            "CLICK" => Some(Self::Click),
            "TYPE" => Some(Self::Type),
            "SELECT" => Some(Self::Select),
            "SCROLL_UP" => Some(Self::ScrollUp),
            "SCROLL_DOWN" => Some(Self::ScrollDown),
            "PRESS_ENTER" => Some(Self::PressEnter),
            "TERMINATE" => Some(Self::Terminate),
            "NONE" => Some(Self::None),
            _ => Option::None,
        }
    }

    /// Name used on the wire and in prediction records.
    pub fn wire_name(&self) -> &'static str {
        match self {
            Self::Click => "CLICK",
            Self::Type => "TYPE",
            Self::Select => "SELECT",
            Self::ScrollUp => "SCROLL_UP",
            Self::ScrollDown => "SCROLL_DOWN",
            Self::PressEnter => "PRESS_ENTER",
            Self::Terminate => "TERMINATE",
            Self::None => "NONE",
        }
    }

    /// Verb used when describing the action to a human.
    pub fn verb(&self) -> &'static str {
        match self {
            Self::Click => "clicked",
            Self::Type => "typed",
            Self::Select => "selected",
            Self::ScrollUp => "scrolled up",
            Self::ScrollDown => "scrolled down",
            Self::PressEnter => "pressed Enter",
            Self::Terminate => "terminated the task",
            Self::None => "did nothing",
        }
    }
}

/// Why a decided-upon action was not performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoopKind {
    InvalidElement,
    ActionIncompatibleWithNoneOfAbove,
    AiSelectedNoneAction,
    AiSelectedNonsensicalScroll,
}

/// An action the model has committed to but the helper has not yet confirmed.
///
/// Present exactly while the controller is waiting on the monitor or on the
/// helper, plus the narrow window between commit and dispatch.
#[derive(Debug, Clone)]
pub struct PendingAction {
    /// Index into the helper's element list used to target the action.
    /// `None` for element-free actions.
    pub element_index: Option<usize>,
    /// Snapshot of the chosen element, kept for highlighting and for the
    /// human-readable description even when the index was cleared.
    pub element: Option<InteractiveElement>,
    pub action: ActionKind,
    pub value: Option<String>,
    /// Model's one-sentence rationale for the action.
    pub explanation: String,
}

impl PendingAction {
    /// Human-readable one-liner used for history entries and prompts.
    pub fn describe(&self) -> String {
        let target = self
            .element
            .as_ref()
            .map(|el| el.description.clone())
            .unwrap_or_default();
        match self.action {
            ActionKind::Click => format!("clicked '{}'", target),
            ActionKind::Select => match &self.value {
                Some(value) => format!("selected '{}' in '{}'", value, target),
                Option::None => format!("selected an option in '{}'", target),
            },
            ActionKind::Type => match &self.value {
                Some(value) => format!("typed '{}' into '{}'", value, target),
                Option::None => format!("typed into '{}'", target),
            },
            ActionKind::PressEnter if !target.is_empty() => {
                format!("pressed Enter on '{}'", target)
            }
            other => other.verb().to_string(),
        }
    }
}
