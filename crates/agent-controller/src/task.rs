//! Per-task session state owned exclusively by the controller.

use std::sync::Arc;

use wayfinder_core_types::{TabId, TaskId};

use crate::action::PendingAction;
use crate::config::AgentConfig;
use crate::guard::TaskCounters;
use crate::pipeline;
use crate::protocol::{InteractiveElement, ViewportInfo};
use crate::records::TaskJournal;
use crate::screenshot::ScreenshotCoordinator;
use crate::stores::ScreenshotStore;

/// The page state a decision round operates on.
#[derive(Debug, Clone)]
pub struct PageContext {
    pub elements: Vec<InteractiveElement>,
    /// Indices of visible elements, in element-list order.
    pub candidates: Vec<usize>,
    pub viewport: ViewportInfo,
    pub url: String,
}

impl PageContext {
    pub fn new(elements: Vec<InteractiveElement>, viewport: ViewportInfo, url: String) -> Self {
        let candidates = pipeline::filter_candidates(&elements);
        Self {
            elements,
            candidates,
            viewport,
            url,
        }
    }
}

/// Latest human-monitor rejection; injected into the next decision query and
/// then discarded (only the latest rejection is kept).
#[derive(Debug, Clone)]
pub struct RejectionNote {
    pub feedback: Option<String>,
}

/// Mutable state of one running task.
#[derive(Debug)]
pub struct TaskSession {
    pub id: TaskId,
    pub spec: String,
    pub start_url: Option<String>,
    /// Tab the task is bound to; rebound on navigation.
    pub tab: TabId,
    /// Configuration snapshot taken at task start.
    pub config: AgentConfig,
    pub counters: TaskCounters,
    pub journal: TaskJournal,
    pub pending: Option<PendingAction>,
    /// Whether the committed action may unload the page.
    pub might_navigate: bool,
    /// Auto-monitor elevation for the current pending action; distinct from
    /// the user's persistent monitor preference.
    pub monitor_elevated: bool,
    pub rejection: Option<RejectionNote>,
    pub page: Option<PageContext>,
    pub screenshots: ScreenshotCoordinator,
    /// Raw model outputs of the latest decision attempt, kept for the judge.
    pub last_planning_output: String,
    pub last_grounding_output: String,
}

impl TaskSession {
    pub fn new(
        spec: String,
        tab: TabId,
        start_url: Option<String>,
        config: AgentConfig,
        screenshot_store: Arc<ScreenshotStore>,
    ) -> Self {
        Self {
            id: TaskId::new(),
            spec,
            start_url,
            tab,
            config,
            counters: TaskCounters::default(),
            journal: TaskJournal::new(),
            pending: None,
            might_navigate: false,
            monitor_elevated: false,
            rejection: None,
            page: None,
            screenshots: ScreenshotCoordinator::new(screenshot_store),
            last_planning_output: String::new(),
            last_grounding_output: String::new(),
        }
    }

    /// Whether a committed action must wait for human approval.
    pub fn monitor_active(&self) -> bool {
        self.config.monitor_mode || self.monitor_elevated
    }
}
