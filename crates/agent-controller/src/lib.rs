//! Wayfinder agent controller.
//!
//! A finite-state machine that drives a live browser session to accomplish a
//! natural-language task: it captures rendered page state, consults a
//! multimodal model for the next interaction, and dispatches that interaction
//! back to the page, with an optional two-tier safety review (automated judge
//! plus human monitor) in front of risky actions.

pub mod action;
pub mod config;
pub mod controller;
pub mod errors;
pub mod export;
pub mod guard;
pub mod host;
pub mod judge;
pub mod model;
pub mod options;
pub mod pipeline;
pub mod prompt;
pub mod protocol;
pub mod records;
pub mod screenshot;
pub mod state;
pub mod stores;
pub mod task;

pub use action::{ActionKind, NoopKind, PendingAction};
pub use config::{AgentConfig, AiProviderType, ConfigEffect, EngineFactory};
pub use controller::AgentController;
pub use errors::AgentError;
pub use export::{HistoryExporter, TaskSummary};
pub use guard::{LimitBreach, LimitSet, TaskCounters};
pub use host::{BrowserHost, HelperPort, PanelPort, PortError};
pub use judge::{JudgeVerdict, Severity};
pub use model::{MockModelEngine, ModelEngine, ModelQuery};
pub use protocol::{
    ActionInfo, HelperCommand, HelperMessage, InteractiveElement, KeyCommand, PanelMessage,
    PanelOutbound, ViewportInfo,
};
pub use records::{ActionRecord, PredictionRecord, TaskJournal};
pub use state::{next_phase, FsmEvent, Phase};
pub use stores::{
    current_task, set_current_task, LogRecord, LogStore, ScreenshotKind, ScreenshotRecord,
    ScreenshotStore, TaskLogLayer,
};
pub use task::{PageContext, RejectionNote, TaskSession};
