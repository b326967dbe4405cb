//! Shared append-only stores for logs and screenshots, plus the process-wide
//! current-task holder that tags records with the running task.
//!
//! Writes are fire-and-forget; readers get point-in-time snapshots. Both
//! stores outlive individual tasks so the export subsystem can collect
//! records at termination.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

use wayfinder_core_types::TaskId;

static CURRENT_TASK: Lazy<RwLock<Option<TaskId>>> = Lazy::new(|| RwLock::new(None));

/// Tag subsequent log records with this task id.
pub fn set_current_task(task_id: Option<TaskId>) {
    *CURRENT_TASK.write() = task_id;
}

/// The task id log records are currently tagged with.
pub fn current_task() -> Option<TaskId> {
    CURRENT_TASK.read().clone()
}

/// Render a timestamp without a trailing zone marker, per the log contract.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%.3f").to_string()
}

/// One persisted log record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    pub timestamp: DateTime<Utc>,
    /// Logger name (the tracing target).
    pub logger: String,
    pub level: String,
    pub message: String,
}

impl LogRecord {
    /// Line format used in the exported log file.
    pub fn format_line(&self) -> String {
        format!(
            "{} {:5} {} - {}",
            format_timestamp(&self.timestamp),
            self.level,
            self.logger,
            self.message
        )
    }
}

/// Append-only log store shared across the process.
#[derive(Debug, Default)]
pub struct LogStore {
    records: Mutex<Vec<LogRecord>>,
}

impl LogStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, record: LogRecord) {
        self.records.lock().push(record);
    }

    /// Records for the given task (or untagged records when `task_id` is
    /// `None`), sorted by timestamp.
    pub fn snapshot_for(&self, task_id: Option<&TaskId>) -> Vec<LogRecord> {
        let mut records: Vec<LogRecord> = self
            .records
            .lock()
            .iter()
            .filter(|rec| rec.task_id.as_ref() == task_id)
            .cloned()
            .collect();
        records.sort_by_key(|rec| rec.timestamp);
        records
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

/// Capture type of a screenshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScreenshotKind {
    /// Taken once per page-state round, before prompting.
    Initial,
    /// Taken after the candidate element was highlighted.
    Targeted,
}

impl ScreenshotKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::Targeted => "targeted",
        }
    }
}

/// One persisted screenshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScreenshotRecord {
    pub task_id: TaskId,
    /// Actions completed before this capture; associates the capture with
    /// the upcoming action.
    pub num_prior_actions: u32,
    /// Prompting screenshots already taken for the current action.
    pub num_prior_screenshots_for_prompts: u32,
    pub screenshot_type: ScreenshotKind,
    pub timestamp: DateTime<Utc>,
    pub base64_png: String,
}

impl ScreenshotRecord {
    /// File name inside the exported `screenshots/` folder.
    pub fn file_name(&self) -> String {
        format!(
            "action{:03}_prompt{:02}_{}_{}.png",
            self.num_prior_actions,
            self.num_prior_screenshots_for_prompts,
            self.screenshot_type.as_str(),
            self.timestamp.format("%Y%m%d-%H%M%S%.3f")
        )
    }
}

/// Append-only screenshot store shared across the process.
#[derive(Debug, Default)]
pub struct ScreenshotStore {
    records: Mutex<Vec<ScreenshotRecord>>,
}

impl ScreenshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, record: ScreenshotRecord) {
        self.records.lock().push(record);
    }

    pub fn snapshot_for(&self, task_id: &TaskId) -> Vec<ScreenshotRecord> {
        self.records
            .lock()
            .iter()
            .filter(|rec| &rec.task_id == task_id)
            .cloned()
            .collect()
    }
}

/// Tracing layer that feeds the log store.
///
/// Every event is appended as a [`LogRecord`] tagged with the process-wide
/// current task id, so records written between tasks stay unaffiliated.
pub struct TaskLogLayer {
    store: Arc<LogStore>,
}

impl TaskLogLayer {
    pub fn new(store: Arc<LogStore>) -> Self {
        Self { store }
    }
}

impl<S: Subscriber> Layer<S> for TaskLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        self.store.append(LogRecord {
            task_id: current_task(),
            timestamp: Utc::now(),
            logger: event.metadata().target().to_string(),
            level: event.metadata().level().to_string(),
            message: visitor.finish(),
        });
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: Vec<String>,
}

impl MessageVisitor {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else if self.message.is_empty() {
            self.fields.join(" ")
        } else {
            format!("{} {}", self.message, self.fields.join(" "))
        }
    }
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.push(format!("{}={}", field.name(), value));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.fields.push(format!("{}={:?}", field.name(), value));
        }
    }
}
