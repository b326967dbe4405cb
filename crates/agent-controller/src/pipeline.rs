//! Pure decision logic: candidate filtering, grounding-response parsing, and
//! outcome classification.
//!
//! The async orchestration (screenshots, model calls, dispatch) lives in the
//! controller; everything here is synchronous and directly testable.

use serde::Deserialize;
use tracing::debug;

use crate::action::{ActionKind, NoopKind, PendingAction};
use crate::model::parse_reply;
use crate::options;
use crate::protocol::{InteractiveElement, ViewportInfo};

/// Indices of elements that are actually visible.
///
/// The helper reports center (0,0) for elements that are not really visible;
/// those are dropped and the survivors are re-lettered by candidate position.
pub fn filter_candidates(elements: &[InteractiveElement]) -> Vec<usize> {
    elements
        .iter()
        .enumerate()
        .filter(|(_, el)| el.center_coords != (0, 0))
        .map(|(idx, _)| idx)
        .collect()
}

/// The model's element selection, as parsed from the grounding response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElementChoice {
    /// A letter that decoded to a candidate position.
    Option(usize),
    /// The model explicitly declined every choice.
    NoneOfTheAbove,
    /// A string that is neither a letter nor the decline phrase.
    Invalid(String),
    /// No element field in the response.
    Missing,
}

/// Structured grounding output.
#[derive(Debug, Clone)]
pub struct GroundingChoice {
    pub element: ElementChoice,
    pub action: Option<ActionKind>,
    pub value: Option<String>,
    pub explanation: String,
}

#[derive(Debug, Deserialize)]
struct RawGrounding {
    element: Option<String>,
    action: Option<String>,
    value: Option<serde_json::Value>,
    explanation: Option<String>,
}

/// Parse the raw grounding response. Never fails: malformed pieces surface as
/// `Invalid`/`Missing`/`None` so the classifier can turn them into noops.
pub fn parse_grounding(raw: &str) -> GroundingChoice {
    let parsed: RawGrounding = match parse_reply(raw) {
        Ok(parsed) => parsed,
        Err(err) => {
            debug!(%err, "grounding response unusable");
            return GroundingChoice {
                element: ElementChoice::Missing,
                action: None,
                value: None,
                explanation: String::new(),
            };
        }
    };

    let element = match parsed.element {
        None => ElementChoice::Missing,
        Some(raw_element) => {
            let trimmed = raw_element.trim();
            if trimmed.is_empty() {
                ElementChoice::Missing
            } else if trimmed.eq_ignore_ascii_case("none of the above")
                || trimmed.eq_ignore_ascii_case("none")
            {
                ElementChoice::NoneOfTheAbove
            } else {
                match options::parse_option_name(trimmed) {
                    Some(pos) => ElementChoice::Option(pos),
                    None => ElementChoice::Invalid(trimmed.to_string()),
                }
            }
        }
    };

    let value = parsed.value.and_then(|v| match v {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) => Some(s),
        other => Some(other.to_string()),
    });

    GroundingChoice {
        element,
        action: parsed.action.as_deref().and_then(ActionKind::parse),
        value,
        explanation: parsed.explanation.unwrap_or_default(),
    }
}

/// Keywords whose presence in a NONE explanation suggests the page is still
/// loading.
pub const LOADING_KEYWORDS: [&str; 4] = ["still", "loading", "wait", "finished"];

/// Total occurrences of the loading keywords in `text`.
pub fn loading_keyword_hits(text: &str) -> usize {
    let lowered = text.to_ascii_lowercase();
    LOADING_KEYWORDS
        .iter()
        .map(|keyword| lowered.matches(keyword).count())
        .sum()
}

/// What the reprompting loop should do with one grounding attempt.
#[derive(Debug, Clone)]
pub enum DecisionOutcome {
    /// Task finished successfully.
    Terminate { explanation: String },
    /// Page appears to still be loading: pause and fetch fresh state without
    /// counting a noop.
    LoadingWait { explanation: String },
    /// Decided-upon but not performable; reprompt.
    Noop { kind: NoopKind, explanation: String },
    /// Commit the action.
    Commit {
        pending: PendingAction,
        might_navigate: bool,
    },
}

/// Classify one grounding attempt against the current page state.
pub fn classify(
    choice: &GroundingChoice,
    elements: &[InteractiveElement],
    candidates: &[usize],
    viewport: &ViewportInfo,
) -> DecisionOutcome {
    let explanation = choice.explanation.clone();

    let Some(action) = choice.action else {
        // Unparseable or missing action: the model effectively chose nothing.
        return DecisionOutcome::Noop {
            kind: NoopKind::AiSelectedNoneAction,
            explanation,
        };
    };

    if action == ActionKind::Terminate {
        return DecisionOutcome::Terminate { explanation };
    }

    if action == ActionKind::None {
        let hits = loading_keyword_hits(&explanation);
        if hits >= 2 {
            return DecisionOutcome::LoadingWait { explanation };
        }
        if hits == 1 {
            debug!("single loading keyword in NONE explanation; treating as plain noop");
        }
        return DecisionOutcome::Noop {
            kind: NoopKind::AiSelectedNoneAction,
            explanation,
        };
    }

    // Resolve the element choice to an index into the helper's element list.
    let resolved = match &choice.element {
        ElementChoice::Option(pos) => candidates.get(*pos).copied(),
        _ => None,
    };

    if action.requires_element() {
        match &choice.element {
            ElementChoice::NoneOfTheAbove => {
                return DecisionOutcome::Noop {
                    kind: NoopKind::ActionIncompatibleWithNoneOfAbove,
                    explanation,
                }
            }
            ElementChoice::Option(_) if resolved.is_some() => {}
            _ => {
                return DecisionOutcome::Noop {
                    kind: NoopKind::InvalidElement,
                    explanation,
                }
            }
        }
    }

    if action == ActionKind::ScrollUp && viewport.at_top()
        || action == ActionKind::ScrollDown && viewport.at_bottom()
    {
        return DecisionOutcome::Noop {
            kind: NoopKind::AiSelectedNonsensicalScroll,
            explanation,
        };
    }

    // PRESS_ENTER keeps a validly chosen element so the keypress can be
    // targeted and the candidate highlighted; scrolls drop stray choices.
    let keep_element = action.requires_element() || action == ActionKind::PressEnter;
    let element_index = if keep_element { resolved } else { None };
    let element = element_index.and_then(|idx| elements.get(idx).cloned());

    let pending = PendingAction {
        element_index,
        element,
        action,
        value: choice.value.clone(),
        explanation,
    };
    DecisionOutcome::Commit {
        might_navigate: action.may_cause_navigation(),
        pending,
    }
}
