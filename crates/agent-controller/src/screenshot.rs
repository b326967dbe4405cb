//! Screenshot coordination for one task.
//!
//! The "initial" capture happens once per page-state round and is shared
//! across reprompt iterations of that round; "targeted" captures follow a
//! highlight and are preferred by the judge. Every capture is persisted to
//! the shared store keyed by the current action index and the count of prior
//! prompting screenshots for that action.

use std::sync::Arc;

use chrono::Utc;

use wayfinder_core_types::{TabId, TaskId};

use crate::errors::AgentError;
use crate::host::BrowserHost;
use crate::stores::{ScreenshotKind, ScreenshotRecord, ScreenshotStore};

#[derive(Debug)]
pub struct ScreenshotCoordinator {
    store: Arc<ScreenshotStore>,
    /// Cached initial capture for the current page-state round.
    round_capture: Option<String>,
    /// Prompting screenshots taken for the current action so far.
    prompting_count: u32,
}

impl ScreenshotCoordinator {
    pub fn new(store: Arc<ScreenshotStore>) -> Self {
        Self {
            store,
            round_capture: None,
            prompting_count: 0,
        }
    }

    /// Number of prompting screenshots taken for the current action.
    pub fn prompting_count(&self) -> u32 {
        self.prompting_count
    }

    /// Begin a new page-state round: the cached capture is stale.
    pub fn begin_round(&mut self) {
        self.round_capture = None;
    }

    /// A new action starts; the prompting counter restarts with it.
    pub fn begin_action(&mut self) {
        self.round_capture = None;
        self.prompting_count = 0;
    }

    /// The initial capture for this round, capturing (and persisting) it on
    /// first use and reusing it for later reprompt iterations.
    pub async fn initial(
        &mut self,
        host: &dyn BrowserHost,
        task_id: &TaskId,
        tab: TabId,
        num_prior_actions: u32,
    ) -> Result<String, AgentError> {
        if let Some(cached) = &self.round_capture {
            return Ok(cached.clone());
        }
        let capture = host.capture_screenshot(tab).await?;
        self.record(task_id, num_prior_actions, ScreenshotKind::Initial, &capture);
        self.prompting_count += 1;
        self.round_capture = Some(capture.clone());
        Ok(capture)
    }

    /// Capture the highlighted candidate. Always a fresh capture.
    pub async fn targeted(
        &mut self,
        host: &dyn BrowserHost,
        task_id: &TaskId,
        tab: TabId,
        num_prior_actions: u32,
    ) -> Result<String, AgentError> {
        let capture = host.capture_screenshot(tab).await?;
        self.record(task_id, num_prior_actions, ScreenshotKind::Targeted, &capture);
        Ok(capture)
    }

    fn record(
        &self,
        task_id: &TaskId,
        num_prior_actions: u32,
        screenshot_type: ScreenshotKind,
        base64_png: &str,
    ) {
        self.store.append(ScreenshotRecord {
            task_id: task_id.clone(),
            num_prior_actions,
            num_prior_screenshots_for_prompts: self.prompting_count,
            screenshot_type,
            timestamp: Utc::now(),
            base64_png: base64_png.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use wayfinder_core_types::TabInfo;

    use crate::host::HelperPort;

    struct CountingHost {
        captures: AtomicU32,
    }

    #[async_trait]
    impl BrowserHost for CountingHost {
        async fn inject_helper(&self, _tab: TabId) -> Result<Box<dyn HelperPort>, AgentError> {
            Err(AgentError::internal("not used"))
        }

        async fn active_tab(&self) -> Result<TabInfo, AgentError> {
            Ok(TabInfo::new(TabId(1)))
        }

        async fn capture_screenshot(&self, _tab: TabId) -> Result<String, AgentError> {
            let n = self.captures.fetch_add(1, Ordering::SeqCst);
            Ok(format!("capture-{n}"))
        }
    }

    #[tokio::test]
    async fn test_initial_shared_within_round() {
        let store = Arc::new(ScreenshotStore::new());
        let host = CountingHost {
            captures: AtomicU32::new(0),
        };
        let task = TaskId::new();
        let mut coordinator = ScreenshotCoordinator::new(store.clone());

        let first = coordinator.initial(&host, &task, TabId(1), 0).await.unwrap();
        let second = coordinator.initial(&host, &task, TabId(1), 0).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(store.snapshot_for(&task).len(), 1);

        coordinator.begin_round();
        let third = coordinator.initial(&host, &task, TabId(1), 0).await.unwrap();
        assert_ne!(first, third);
        assert_eq!(store.snapshot_for(&task).len(), 2);
    }

    #[tokio::test]
    async fn test_prompting_counter_resets_per_action() {
        let store = Arc::new(ScreenshotStore::new());
        let host = CountingHost {
            captures: AtomicU32::new(0),
        };
        let task = TaskId::new();
        let mut coordinator = ScreenshotCoordinator::new(store.clone());

        coordinator.initial(&host, &task, TabId(1), 0).await.unwrap();
        coordinator.begin_round();
        coordinator.initial(&host, &task, TabId(1), 0).await.unwrap();
        assert_eq!(coordinator.prompting_count(), 2);

        coordinator.begin_action();
        assert_eq!(coordinator.prompting_count(), 0);
    }

    #[tokio::test]
    async fn test_targeted_records_with_current_counts() {
        let store = Arc::new(ScreenshotStore::new());
        let host = CountingHost {
            captures: AtomicU32::new(0),
        };
        let task = TaskId::new();
        let mut coordinator = ScreenshotCoordinator::new(store.clone());

        coordinator.initial(&host, &task, TabId(1), 2).await.unwrap();
        coordinator.targeted(&host, &task, TabId(1), 2).await.unwrap();

        let records = store.snapshot_for(&task);
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].screenshot_type, ScreenshotKind::Targeted);
        assert_eq!(records[1].num_prior_actions, 2);
        assert_eq!(records[1].num_prior_screenshots_for_prompts, 1);
    }
}
