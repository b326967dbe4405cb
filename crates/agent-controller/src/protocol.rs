//! Wire contracts for the three conduits the controller mediates.
//!
//! Message tags are SCREAMING_SNAKE_CASE and payload fields camelCase so the
//! JSON on the wire matches what the panel and page helper speak.

use serde::{Deserialize, Serialize};

use crate::action::ActionKind;
use crate::judge::Severity;

/// One interactive element as reported by the page helper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InteractiveElement {
    /// Human-readable description of the element.
    pub description: String,
    /// Excerpt of the opening tag, e.g. `<button class="primary"`.
    pub tag_head: String,
    pub tag_name: String,
    /// Center coordinates in CSS pixels; (0,0) means not really visible.
    pub center_coords: (i32, i32),
    /// Opaque identifier the helper uses to target the element on action
    /// requests.
    pub element_id: String,
}

/// Viewport details accompanying a page state. All values in CSS pixels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewportInfo {
    pub width: i32,
    pub height: i32,
    pub scroll_x: i32,
    pub scroll_y: i32,
    pub page_scroll_height: i32,
}

impl ViewportInfo {
    /// Whether the page extends beyond one viewport.
    pub fn is_scrollable(&self) -> bool {
        self.page_scroll_height > self.height
    }

    /// Vertical scroll position as a percentage of the scrollable range.
    pub fn scroll_percent(&self) -> i32 {
        let scrollable = self.page_scroll_height - self.height;
        if scrollable <= 0 {
            return 100;
        }
        ((self.scroll_y as f64 / scrollable as f64) * 100.0).round() as i32
    }

    pub fn at_top(&self) -> bool {
        self.scroll_y <= 0
    }

    /// Within 1 px of the bottom of the page.
    pub fn at_bottom(&self) -> bool {
        self.scroll_y + self.height >= self.page_scroll_height - 1
    }
}

/// Summary of a committed action shown to the panel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub element_index: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub element_description: Option<String>,
    pub action: ActionKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    pub explanation: String,
}

/// Messages the panel sends to the controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE", rename_all_fields = "camelCase")]
pub enum PanelMessage {
    StartTask { task_specification: String },
    KillTask,
    MonitorApproved,
    MonitorRejected {
        #[serde(default)]
        feedback: Option<String>,
    },
    KeepAlive,
    ExportUnaffiliatedLogs,
}

/// Messages the controller sends to the panel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE", rename_all_fields = "camelCase")]
pub enum PanelOutbound {
    AgentControllerReady,
    TaskStarted {
        task_id: String,
        success: bool,
        task_spec: String,
    },
    ActionCandidate {
        action_info: ActionInfo,
    },
    AutoMonitorEscalation {
        severity: Severity,
        explanation: String,
    },
    TaskHistoryEntry {
        action_desc: String,
        success: bool,
        explanation: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        action_info: Option<ActionInfo>,
    },
    Notification {
        msg: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<String>,
    },
    TaskEnded {
        task_id: String,
        details: String,
    },
    HistoryExport {
        /// Base64 of the archive bytes.
        zip_bytes: String,
        file_name: String,
    },
    Error {
        msg: String,
    },
}

/// Messages the page helper sends to the controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE", rename_all_fields = "camelCase")]
pub enum HelperMessage {
    Ready,
    PageState {
        interactive_elements: Vec<InteractiveElement>,
        viewport_info: ViewportInfo,
        url: String,
    },
    ActionDone {
        success: bool,
        #[serde(default)]
        result: Option<String>,
    },
    Terminal {
        error: String,
    },
}

/// Messages the controller sends to the page helper.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE", rename_all_fields = "camelCase")]
pub enum HelperCommand {
    ReqPageState {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is_monitor_retry: Option<bool>,
    },
    ReqAction {
        action: ActionKind,
        #[serde(skip_serializing_if = "Option::is_none")]
        element_index: Option<usize>,
        #[serde(skip_serializing_if = "Option::is_none")]
        value: Option<String>,
    },
    HighlightCandidateElem {
        element_index: usize,
        prompting_index_for_action: u32,
    },
}

/// Keyboard shortcuts routed into the controller by the host runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyCommand {
    AbortTask,
    ApprovePending,
    RejectPending,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panel_message_wire_shape() {
        let msg: PanelMessage =
            serde_json::from_str(r#"{"type":"START_TASK","taskSpecification":"buy milk"}"#)
                .unwrap();
        match msg {
            PanelMessage::StartTask { task_specification } => {
                assert_eq!(task_specification, "buy milk")
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_helper_command_wire_shape() {
        let cmd = HelperCommand::ReqAction {
            action: ActionKind::Click,
            element_index: Some(3),
            value: None,
        };
        let json = serde_json::to_string(&cmd).unwrap();
        assert!(json.contains("\"type\":\"REQ_ACTION\""));
        assert!(json.contains("\"action\":\"CLICK\""));
        assert!(json.contains("\"elementIndex\":3"));
        assert!(!json.contains("value"));
    }

    #[test]
    fn test_scroll_percent() {
        let viewport = ViewportInfo {
            width: 1024,
            height: 768,
            scroll_x: 0,
            scroll_y: 616,
            page_scroll_height: 2000,
        };
        assert_eq!(viewport.scroll_percent(), 50);
        assert!(!viewport.at_top());
        assert!(!viewport.at_bottom());
    }

    #[test]
    fn test_at_bottom_within_one_pixel() {
        let viewport = ViewportInfo {
            width: 1024,
            height: 768,
            scroll_x: 0,
            scroll_y: 1231,
            page_scroll_height: 2000,
        };
        assert!(viewport.at_bottom());
    }

    #[test]
    fn test_unscrollable_page() {
        let viewport = ViewportInfo {
            width: 1024,
            height: 768,
            scroll_x: 0,
            scroll_y: 0,
            page_scroll_height: 768,
        };
        assert!(!viewport.is_scrollable());
        assert_eq!(viewport.scroll_percent(), 100);
        assert!(viewport.at_top());
        assert!(viewport.at_bottom());
    }
}
