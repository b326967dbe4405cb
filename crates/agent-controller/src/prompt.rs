//! Prompt templates and query assembly for the three model modes.

use crate::options;
use crate::protocol::{InteractiveElement, ViewportInfo};

/// System prompt for planning mode.
pub const PLANNING_SYSTEM_PROMPT: &str = r#"You are a web agent operating a live browser on behalf of a user. Each step you receive the user's task, the actions performed so far, a screenshot of the current page, and a list of interactive elements.

Reason step by step about the state of the page and what single interaction would make the most progress toward the task. Consider whether the task is already complete, whether the page is still loading, and whether the needed element is visible or requires scrolling.

Respond with your reasoning in plain text. Do not pick an option letter yet; that happens in a follow-up turn."#;

/// System prompt for grounding mode.
pub const GROUNDING_SYSTEM_PROMPT: &str = r#"You previously reasoned about the next step. Now commit to exactly one interaction.

Respond with a JSON object of this shape:
{"element": "<option letter or 'none of the above'>", "action": "<CLICK | TYPE | SELECT | SCROLL_UP | SCROLL_DOWN | PRESS_ENTER | TERMINATE | NONE>", "value": "<text for TYPE/SELECT, else null>", "explanation": "<one sentence>"}

Rules:
- CLICK, TYPE and SELECT need an element letter from the choice list.
- SCROLL_UP, SCROLL_DOWN and PRESS_ENTER take no element.
- TERMINATE means the task is finished.
- NONE means no sensible interaction exists right now.
- The explanation must be a single sentence."#;

/// System prompt for judgment mode.
pub const JUDGMENT_SYSTEM_PROMPT: &str = r#"You are reviewing an action a web agent is about to perform, shown outlined in the screenshot. Judge how much harm the action could cause if it were a mistake: consider purchases, deletions, sending messages, changing account state, and other hard-to-undo effects.

Respond with a JSON object: {"severity": "<SAFE | LOW | MEDIUM | HIGH | CATASTROPHIC>", "explanation": "<one sentence>"}"#;

/// Terser reminders appended when a judgment response fails to parse.
const JUDGE_RETRY_REMINDERS: [&str; 2] = [
    "\n\nYour previous reply could not be parsed. Reply with only the JSON object containing the severity and explanation fields.",
    "\n\nJSON only: {\"severity\": ..., \"explanation\": ...}",
];

/// Reminder for the given failed attempt (1-based).
pub fn judge_retry_reminder(failed_attempt: u32) -> &'static str {
    let idx = (failed_attempt as usize - 1).min(JUDGE_RETRY_REMINDERS.len() - 1);
    JUDGE_RETRY_REMINDERS[idx]
}

/// Render the candidate elements as lettered choices.
///
/// `candidates` carries indices into `elements`; letters are assigned by
/// candidate position, so the letter the model picks maps back through the
/// candidate list.
pub fn format_choices(elements: &[InteractiveElement], candidates: &[usize]) -> String {
    let mut out = String::new();
    for (pos, &element_idx) in candidates.iter().enumerate() {
        let Some(element) = elements.get(element_idx) else {
            continue;
        };
        let letter = match options::option_name(pos) {
            Ok(letter) => letter,
            Err(_) => break,
        };
        out.push_str(&format!(
            "{}. {} ({})\n",
            letter,
            element.description,
            element.tag_head.trim()
        ));
    }
    out
}

/// Warning prepended to the query after a human monitor rejected the
/// previous proposal. Only the latest rejection is kept.
pub fn rejection_notice(feedback: Option<&str>) -> String {
    let mut notice = String::from(
        "WARNING: your previous proposed action was rejected by the human monitor. \
         Choose a different approach.\n",
    );
    if let Some(feedback) = feedback {
        if !feedback.trim().is_empty() {
            notice.push_str(&format!("Monitor feedback: {}\n", feedback.trim()));
        }
    }
    notice.push('\n');
    notice
}

/// Assemble the decision query shared by the planning and grounding calls.
pub fn build_decision_query(
    task_spec: &str,
    prior_actions: &[String],
    elements: &[InteractiveElement],
    candidates: &[usize],
    viewport: &ViewportInfo,
    url: &str,
) -> String {
    let mut query = String::new();

    query.push_str("## Task\n");
    query.push_str(task_spec);
    query.push('\n');

    query.push_str(&format!("\n## Current Page\nURL: {url}\n"));
    if viewport.is_scrollable() {
        // Scroll hint only when the page actually scrolls.
        query.push_str(&format!(
            "The page is scrolled {}% of the way down.\n",
            viewport.scroll_percent()
        ));
    }

    if !prior_actions.is_empty() {
        query.push_str("\n## Previous Actions\n");
        for (idx, desc) in prior_actions.iter().enumerate() {
            query.push_str(&format!("{}. {}\n", idx + 1, desc));
        }
    }

    query.push_str("\n## Choices\n");
    if candidates.is_empty() {
        query.push_str("(no interactive elements visible)\n");
    } else {
        query.push_str(&format_choices(elements, candidates));
    }

    query
}
