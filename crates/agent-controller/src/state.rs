//! Controller state machine.
//!
//! The transition table here is the single source of truth for which state
//! changes are legal. Handlers never assign a phase directly; they go through
//! [`next_phase`] and abort the task when it returns `None`.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle phase of the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    /// No task in flight. Initial and terminal state.
    Idle,
    /// Helper injected, waiting for its READY message.
    WaitingForContentScriptInit,
    /// Page state in hand, decision pipeline running.
    Active,
    /// Fresh page state requested from the helper.
    WaitingForPageState,
    /// A proposed action awaits human approval.
    WaitingForMonitorResponse,
    /// An action request was dispatched to the helper.
    WaitingForAction,
    /// A helper send failed with the disconnect diagnostic; waiting for the
    /// disconnect event before re-injecting.
    PendingReconnect,
}

/// Events that drive phase transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsmEvent {
    StartTaskAccepted,
    HelperReady,
    PageStateReceived,
    DecisionNeedsFreshState,
    DecisionNeedsHumanReview,
    DecisionCommitted,
    MonitorApproved,
    MonitorRejected,
    ActionDoneSameTab,
    ActionDoneNavigated,
    HelperDisconnectedDuringAction,
    HelperSendDisconnected,
    HelperDisconnectEvent,
    TaskEnded,
}

impl fmt::Display for FsmEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Look up the successor phase for `(from, event)`.
///
/// `None` means the pair is absent from the transition table; the caller must
/// treat that as a bug and abort the task with a diagnostic.
pub fn next_phase(from: Phase, event: FsmEvent) -> Option<Phase> {
    use FsmEvent::*;
    use Phase::*;

    // Task end is legal from any phase and always lands in Idle.
    if event == TaskEnded {
        return Some(Idle);
    }
    // A helper send failing with the disconnect diagnostic is legal from any
    // non-idle phase.
    if event == HelperSendDisconnected {
        return if from == Idle {
            None
        } else {
            Some(PendingReconnect)
        };
    }

    match (from, event) {
        (Idle, StartTaskAccepted) => Some(WaitingForContentScriptInit),
        (WaitingForContentScriptInit, HelperReady) => Some(WaitingForPageState),
        (WaitingForPageState, PageStateReceived) => Some(Active),
        (Active, DecisionNeedsFreshState) => Some(WaitingForPageState),
        (Active, DecisionNeedsHumanReview) => Some(WaitingForMonitorResponse),
        (Active, DecisionCommitted) => Some(WaitingForAction),
        (WaitingForMonitorResponse, MonitorApproved) => Some(WaitingForAction),
        (WaitingForMonitorResponse, MonitorRejected) => Some(WaitingForPageState),
        (WaitingForAction, ActionDoneSameTab) => Some(WaitingForPageState),
        (WaitingForAction, ActionDoneNavigated) => Some(WaitingForContentScriptInit),
        (WaitingForAction, HelperDisconnectedDuringAction) => Some(WaitingForContentScriptInit),
        (PendingReconnect, HelperDisconnectEvent) => Some(WaitingForContentScriptInit),
        _ => None,
    }
}
