//! Seams to the host runtime: the panel port, the page-helper port, and the
//! browser facilities (helper injection, tab queries, screenshot capture).
//!
//! Port loss is information: a send that fails because the far side went away
//! normally means page navigation, and is surfaced as
//! [`PortError::Disconnected`] so the controller can tell it apart from
//! programmer error.

use async_trait::async_trait;
use thiserror::Error;

use wayfinder_core_types::{TabId, TabInfo};

use crate::errors::AgentError;
use crate::protocol::{HelperCommand, PanelOutbound};

/// Failure modes of a port send.
#[derive(Debug, Error)]
pub enum PortError {
    /// The far side of the port has gone away (expected during navigation).
    #[error("port disconnected")]
    Disconnected,

    /// Anything else; unexpected and terminal for the task.
    #[error("port send failed: {0}")]
    Send(String),
}

/// Conduit to the UI panel.
#[async_trait]
pub trait PanelPort: Send + Sync {
    async fn send(&self, message: PanelOutbound) -> Result<(), PortError>;
}

/// Conduit to the in-page helper.
#[async_trait]
pub trait HelperPort: Send + Sync {
    async fn send(&self, command: HelperCommand) -> Result<(), PortError>;

    /// Tear the connection down; further sends fail with `Disconnected`.
    async fn close(&self);
}

/// Browser facilities the controller needs from the host runtime.
#[async_trait]
pub trait BrowserHost: Send + Sync {
    /// Inject the data-gathering/action-performing helper into `tab` and
    /// return a port to it. The helper announces itself with a READY message
    /// once it is up.
    async fn inject_helper(&self, tab: TabId) -> Result<Box<dyn HelperPort>, AgentError>;

    /// Snapshot of the currently active tab.
    async fn active_tab(&self) -> Result<TabInfo, AgentError>;

    /// Capture the visible viewport of `tab` as a base64 PNG.
    async fn capture_screenshot(&self, tab: TabId) -> Result<String, AgentError>;
}
