//! The agent controller: a long-running finite-state machine that owns a
//! task's lifecycle and mediates the page helper, the UI panel, and the
//! model engine.
//!
//! Every externally initiated handler acquires the single controller mutex
//! for the duration of its logical step, so a state transition and its
//! consequent outbound message always happen in one critical section. The
//! termination signal is the sole field read without the mutex; long
//! operations re-check it after each suspension point and return early.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use wayfinder_core_types::TaskId;

use crate::action::{ActionKind, NoopKind, PendingAction};
use crate::config::{AgentConfig, ConfigEffect, EngineFactory};
use crate::errors::AgentError;
use crate::export::{HistoryExporter, TaskSummary};
use crate::guard;
use crate::host::{BrowserHost, HelperPort, PanelPort, PortError};
use crate::judge;
use crate::model::{ModelEngine, ModelQuery};
use crate::pipeline::{self, DecisionOutcome};
use crate::prompt;
use crate::protocol::{
    ActionInfo, HelperCommand, HelperMessage, KeyCommand, PanelMessage, PanelOutbound,
};
use crate::records::{ActionRecord, PredictionRecord};
use crate::state::{next_phase, FsmEvent, Phase};
use crate::stores::{set_current_task, LogStore, ScreenshotStore};
use crate::task::{PageContext, RejectionNote, TaskSession};

/// Grace period after an action that might navigate, before querying the tab.
const NAV_GRACE: Duration = Duration::from_millis(500);
/// Pause before re-requesting page state when the page reports as loading.
const LOAD_WAIT: Duration = Duration::from_secs(5);
/// Best-effort wait for the highlight outline to render: roughly one
/// animation frame plus a fixed render delay.
const HIGHLIGHT_WAIT: Duration = Duration::from_millis(17 + 300);

const ABORT_REASON: &str = "task aborted by user";

/// Everything behind the controller mutex.
struct ControllerInner {
    phase: Phase,
    config: AgentConfig,
    engine: Option<Arc<dyn ModelEngine>>,
    panel: Option<PanelSlot>,
    helper: Option<Box<dyn HelperPort>>,
    session: Option<TaskSession>,
}

/// The held panel port plus the id of the connection it came from, so a
/// stale connection's cleanup cannot clobber a newer panel.
struct PanelSlot {
    id: u64,
    port: Arc<dyn PanelPort>,
}

/// Outcome of a send on the helper port.
enum HelperSendOutcome {
    Sent,
    /// The port reported the disconnect diagnostic; the controller switched
    /// to `PendingReconnect` and awaits the disconnect event.
    Reconnecting,
    Failed(String),
}

/// Apply a transition from the table; a miss is a bug in the caller.
fn advance(phase: &mut Phase, event: FsmEvent) -> Result<(), AgentError> {
    match next_phase(*phase, event) {
        Some(next) => {
            debug!(from = ?*phase, to = ?next, event = %event, "state transition");
            *phase = next;
            Ok(())
        }
        None => Err(AgentError::IllegalTransition {
            from: *phase,
            event: event.to_string(),
        }),
    }
}

pub struct AgentController {
    inner: Mutex<ControllerInner>,
    /// Abort signal; written lock-free, re-checked under the mutex.
    termination: AtomicBool,
    next_panel_id: AtomicU64,
    host: Arc<dyn BrowserHost>,
    factory: Arc<dyn EngineFactory>,
    screenshot_store: Arc<ScreenshotStore>,
    exporter: HistoryExporter,
}

impl AgentController {
    pub fn new(
        host: Arc<dyn BrowserHost>,
        factory: Arc<dyn EngineFactory>,
        config: AgentConfig,
        logs: Arc<LogStore>,
        screenshots: Arc<ScreenshotStore>,
        build_tag: impl Into<String>,
    ) -> Self {
        Self {
            inner: Mutex::new(ControllerInner {
                phase: Phase::Idle,
                config,
                engine: None,
                panel: None,
                helper: None,
                session: None,
            }),
            termination: AtomicBool::new(false),
            next_panel_id: AtomicU64::new(0),
            host,
            factory,
            screenshot_store: screenshots.clone(),
            exporter: HistoryExporter::new(logs, screenshots, build_tag.into()),
        }
    }

    /// Set the abort signal. Safe to call from any context; the running step
    /// notices at its next suspension check.
    pub fn request_abort(&self) {
        self.termination.store(true, Ordering::SeqCst);
    }

    fn aborted(&self) -> bool {
        self.termination.load(Ordering::SeqCst)
    }

    /// Current phase (primarily for tests and diagnostics).
    pub async fn phase(&self) -> Phase {
        self.inner.lock().await.phase
    }

    /// Id of the running task, if any.
    pub async fn task_id(&self) -> Option<TaskId> {
        self.inner.lock().await.session.as_ref().map(|s| s.id.clone())
    }

    /// Whether a pending action is currently held.
    pub async fn has_pending_action(&self) -> bool {
        self.inner
            .lock()
            .await
            .session
            .as_ref()
            .is_some_and(|s| s.pending.is_some())
    }

    /// Attach a panel port and greet it. At most one panel is held at a
    /// time: a newcomer may take the slot only while no task is running (a
    /// dead panel frees the slot through [`Self::detach_panel`] first).
    /// Returns a connection id for the later detach, or `None` when the
    /// attach was refused.
    pub async fn attach_panel(&self, panel: Arc<dyn PanelPort>) -> Option<u64> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        if inner.panel.is_some() && inner.phase != Phase::Idle {
            warn!("panel attach refused: a panel is held and a task is running");
            return None;
        }
        let id = self.next_panel_id.fetch_add(1, Ordering::SeqCst);
        inner.panel = Some(PanelSlot { id, port: panel });
        self.send_panel_best_effort(inner, PanelOutbound::AgentControllerReady)
            .await;
        Some(id)
    }

    /// Release the panel slot, but only if it is still held by the
    /// connection identified by `id`: a disconnecting panel must not wipe
    /// out a replacement that attached after it.
    pub async fn detach_panel(&self, id: u64) {
        let mut guard = self.inner.lock().await;
        match guard.panel.as_ref() {
            Some(slot) if slot.id == id => guard.panel = None,
            _ => debug!(id, "stale panel detach ignored"),
        }
    }

    /// Entry point for all panel messages.
    pub async fn handle_panel_message(&self, message: PanelMessage) {
        // The abort signal is set before taking the mutex so an in-flight
        // decision step can bail at its next suspension check instead of
        // waiting for us.
        if matches!(message, PanelMessage::KillTask) {
            self.request_abort();
        }

        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        match message {
            PanelMessage::StartTask { task_specification } => {
                self.start_task(inner, task_specification).await;
            }
            PanelMessage::KillTask => {
                self.terminate_locked(inner, ABORT_REASON, false).await;
            }
            PanelMessage::MonitorApproved => {
                if inner.phase != Phase::WaitingForMonitorResponse {
                    let reason = AgentError::InvalidState {
                        state: inner.phase,
                        message: "MONITOR_APPROVED".to_string(),
                    };
                    self.terminate_locked(inner, &reason.to_string(), true).await;
                    return;
                }
                self.approve_pending(inner).await;
            }
            PanelMessage::MonitorRejected { feedback } => {
                if inner.phase != Phase::WaitingForMonitorResponse {
                    let reason = AgentError::InvalidState {
                        state: inner.phase,
                        message: "MONITOR_REJECTED".to_string(),
                    };
                    self.terminate_locked(inner, &reason.to_string(), true).await;
                    return;
                }
                self.reject_pending(inner, feedback).await;
            }
            PanelMessage::KeepAlive => {
                // Keep-alive ticks exist to stop the host runtime from
                // reclaiming the controller; nothing to do.
                debug!("keep-alive tick");
            }
            PanelMessage::ExportUnaffiliatedLogs => {
                match self.exporter.export_unaffiliated() {
                    Ok((bytes, file_name)) => {
                        let message = PanelOutbound::HistoryExport {
                            zip_bytes: BASE64.encode(&bytes),
                            file_name,
                        };
                        self.send_panel_best_effort(inner, message).await;
                    }
                    Err(err) => {
                        warn!(%err, "unaffiliated log export failed");
                        self.send_panel_best_effort(
                            inner,
                            PanelOutbound::Error {
                                msg: format!("Log export failed: {err}"),
                            },
                        )
                        .await;
                    }
                }
            }
        }
    }

    /// Entry point for all page-helper messages.
    pub async fn handle_helper_message(&self, message: HelperMessage) {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        if inner.session.is_none() {
            debug!("helper message after task end ignored");
            return;
        }
        if self.aborted() {
            self.terminate_locked(inner, ABORT_REASON, false).await;
            return;
        }

        match (inner.phase, message) {
            (Phase::WaitingForContentScriptInit, HelperMessage::Ready) => {
                if let Err(err) = advance(&mut inner.phase, FsmEvent::HelperReady) {
                    self.terminate_locked(inner, &err.to_string(), true).await;
                    return;
                }
                self.request_page_state(inner, None).await;
            }
            (
                Phase::WaitingForPageState,
                HelperMessage::PageState {
                    interactive_elements,
                    viewport_info,
                    url,
                },
            ) => {
                if let Err(err) = advance(&mut inner.phase, FsmEvent::PageStateReceived) {
                    self.terminate_locked(inner, &err.to_string(), true).await;
                    return;
                }
                if let Some(session) = inner.session.as_mut() {
                    if session.start_url.is_none() {
                        session.start_url = Some(url.clone());
                    }
                    session.page = Some(PageContext::new(interactive_elements, viewport_info, url));
                    session.screenshots.begin_round();
                }
                self.run_decision_round(inner).await;
            }
            (Phase::WaitingForAction, HelperMessage::ActionDone { success, result }) => {
                debug!(success, ?result, "helper reported action done");
                self.complete_action(inner, success).await;
            }
            (_, HelperMessage::Terminal { error }) => {
                self.terminate_locked(
                    inner,
                    &format!("page helper reported terminal error: {error}"),
                    true,
                )
                .await;
            }
            (phase, message) => {
                let reason = AgentError::InvalidState {
                    state: phase,
                    message: format!("{message:?}"),
                };
                self.terminate_locked(inner, &reason.to_string(), true).await;
            }
        }
    }

    /// The helper port disconnected. During `WAITING_FOR_ACTION` this is
    /// treated as navigation; during `PENDING_RECONNECT` it completes the
    /// reconnect handshake. Anywhere else mid-task it is a bug.
    pub async fn handle_helper_disconnect(&self) {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        if inner.session.is_none() {
            debug!("helper disconnect after task end ignored");
            return;
        }
        if self.aborted() {
            self.terminate_locked(inner, ABORT_REASON, false).await;
            return;
        }

        match inner.phase {
            Phase::WaitingForAction => self.navigation_after_disconnect(inner).await,
            Phase::PendingReconnect => {
                inner.helper = None;
                if let Err(err) = advance(&mut inner.phase, FsmEvent::HelperDisconnectEvent) {
                    self.terminate_locked(inner, &err.to_string(), true).await;
                    return;
                }
                self.reinject_helper(inner).await;
            }
            phase => {
                let reason = AgentError::InvalidState {
                    state: phase,
                    message: "helper disconnect".to_string(),
                };
                self.terminate_locked(inner, &reason.to_string(), true).await;
            }
        }
    }

    /// Keyboard shortcuts route to the same handlers as panel messages, but
    /// are ignored (not terminal) when the mode or state does not match.
    pub async fn handle_key_command(&self, command: KeyCommand) {
        match command {
            KeyCommand::AbortTask => {
                self.request_abort();
                let mut guard = self.inner.lock().await;
                let inner = &mut *guard;
                self.terminate_locked(inner, ABORT_REASON, false).await;
            }
            KeyCommand::ApprovePending | KeyCommand::RejectPending => {
                let mut guard = self.inner.lock().await;
                let inner = &mut *guard;
                let monitor_on = inner
                    .session
                    .as_ref()
                    .is_some_and(|s| s.monitor_active());
                if !monitor_on || inner.phase != Phase::WaitingForMonitorResponse {
                    debug!(?command, "key command ignored outside monitor wait");
                    return;
                }
                if command == KeyCommand::ApprovePending {
                    self.approve_pending(inner).await;
                } else {
                    self.reject_pending(inner, None).await;
                }
            }
        }
    }

    /// Apply a live configuration update. Provider changes rebuild the model
    /// engine with the stored API key; a running task keeps its snapshot.
    pub async fn handle_config_update(&self, key: &str, value: &serde_json::Value) {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        if inner.config.apply_update(key, value) == ConfigEffect::EngineRebuildRequired {
            match self.build_engine(&inner.config) {
                Ok(engine) => {
                    info!(provider = %inner.config.ai_provider, "model engine rebuilt");
                    inner.engine = Some(engine);
                }
                Err(err) => {
                    warn!(%err, "model engine rebuild failed");
                    inner.engine = None;
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Task lifecycle
    // ------------------------------------------------------------------

    async fn start_task(&self, inner: &mut ControllerInner, spec: String) {
        if !inner.config.eula_accepted {
            self.reject_start(inner, &spec, "the EULA has not been accepted")
                .await;
            return;
        }
        if inner.phase != Phase::Idle || inner.session.is_some() {
            self.reject_start(inner, &spec, "a task is already running")
                .await;
            return;
        }
        if spec.trim().is_empty() {
            self.reject_start(inner, &spec, "the task specification is empty")
                .await;
            return;
        }
        if inner.engine.is_none() {
            match self.build_engine(&inner.config) {
                Ok(engine) => inner.engine = Some(engine),
                Err(err) => {
                    self.reject_start(inner, &spec, &err.to_string()).await;
                    return;
                }
            }
        }

        let tab = match self.host.active_tab().await {
            Ok(tab) => tab,
            Err(err) => {
                self.reject_start(inner, &spec, &format!("no active tab: {err}"))
                    .await;
                return;
            }
        };

        let session = TaskSession::new(
            spec.clone(),
            tab.id,
            tab.url.clone(),
            inner.config.clone(),
            self.screenshot_store.clone(),
        );
        let task_id = session.id.clone();
        set_current_task(Some(task_id.clone()));
        inner.session = Some(session);

        match self.host.inject_helper(tab.id).await {
            Ok(helper) => {
                inner.helper = Some(helper);
                // Always legal from Idle.
                let _ = advance(&mut inner.phase, FsmEvent::StartTaskAccepted);
                info!(task_id = %task_id, tab = %tab.id, "task started");
                self.send_panel_best_effort(
                    inner,
                    PanelOutbound::TaskStarted {
                        task_id: task_id.to_string(),
                        success: true,
                        task_spec: spec,
                    },
                )
                .await;
            }
            Err(err) => {
                inner.session = None;
                set_current_task(None);
                self.reject_start(inner, &spec, &format!("helper injection failed: {err}"))
                    .await;
            }
        }
    }

    async fn reject_start(&self, inner: &ControllerInner, spec: &str, reason: &str) {
        warn!(reason, "task start rejected");
        self.send_panel_best_effort(
            inner,
            PanelOutbound::TaskStarted {
                task_id: String::new(),
                success: false,
                task_spec: spec.to_string(),
            },
        )
        .await;
        self.send_panel_best_effort(
            inner,
            PanelOutbound::Error {
                msg: format!("Could not start task: {reason}"),
            },
        )
        .await;
    }

    /// Idempotent task teardown. Every exit path funnels through here: it
    /// exports the histories, notifies the panel, releases the helper port,
    /// and resets to `IDLE`.
    async fn terminate_locked(&self, inner: &mut ControllerInner, reason: &str, is_error: bool) {
        let Some(session) = inner.session.take() else {
            // Nothing running; still clear a stale abort signal.
            self.termination.store(false, Ordering::SeqCst);
            return;
        };

        info!(
            task_id = %session.id,
            reason,
            counters = %session.counters,
            "task ended"
        );

        let TaskSession {
            id,
            spec,
            start_url,
            counters,
            journal,
            ..
        } = session;
        let (actions, predictions) = journal.into_parts();
        let summary = TaskSummary {
            task_id: id.clone(),
            spec,
            start_url,
            counters,
            termination_reason: reason.to_string(),
            actions,
            predictions,
        };

        // The export is attempted on every termination; failures only log.
        match self.exporter.export_task(&summary) {
            Ok((bytes, file_name)) => {
                self.send_panel_best_effort(
                    inner,
                    PanelOutbound::HistoryExport {
                        zip_bytes: BASE64.encode(&bytes),
                        file_name,
                    },
                )
                .await;
            }
            Err(err) => warn!(%err, "history export failed"),
        }

        if let Some(helper) = inner.helper.take() {
            helper.close().await;
        }

        if is_error {
            self.send_panel_best_effort(
                inner,
                PanelOutbound::Error {
                    msg: reason.to_string(),
                },
            )
            .await;
        }
        self.send_panel_best_effort(
            inner,
            PanelOutbound::TaskEnded {
                task_id: id.to_string(),
                details: reason.to_string(),
            },
        )
        .await;

        let _ = advance(&mut inner.phase, FsmEvent::TaskEnded);
        set_current_task(None);
        self.termination.store(false, Ordering::SeqCst);
    }

    // ------------------------------------------------------------------
    // Decision pipeline orchestration
    // ------------------------------------------------------------------

    /// One decision round over the current page state: reprompt until an
    /// action commits, the model terminates, the page needs refreshing, or a
    /// limit aborts the task.
    async fn run_decision_round(&self, inner: &mut ControllerInner) {
        let Some(engine) = inner.engine.clone() else {
            self.terminate_locked(inner, "no model engine available", true)
                .await;
            return;
        };

        loop {
            if self.aborted() {
                self.terminate_locked(inner, ABORT_REASON, false).await;
                return;
            }

            // Assemble the query and the (round-shared) initial screenshot.
            let (query_text, screenshot, page) = {
                let Some(session) = inner.session.as_mut() else {
                    return;
                };
                let Some(page) = session.page.clone() else {
                    self.terminate_locked(inner, "decision round without page state", true)
                        .await;
                    return;
                };

                let mut query = String::new();
                if let Some(rejection) = session.rejection.take() {
                    query.push_str(&prompt::rejection_notice(rejection.feedback.as_deref()));
                }
                query.push_str(&prompt::build_decision_query(
                    &session.spec,
                    &session.journal.action_descriptions(),
                    &page.elements,
                    &page.candidates,
                    &page.viewport,
                    &page.url,
                ));

                let num_prior_actions = session.journal.action_count();
                let screenshot = match session
                    .screenshots
                    .initial(self.host.as_ref(), &session.id, session.tab, num_prior_actions)
                    .await
                {
                    Ok(capture) => Some(capture),
                    Err(err) => {
                        warn!(%err, "initial screenshot capture failed; prompting without vision");
                        None
                    }
                };
                (query, screenshot, page)
            };

            if self.aborted() {
                self.terminate_locked(inner, ABORT_REASON, false).await;
                return;
            }

            let planning_query = ModelQuery::new(prompt::PLANNING_SYSTEM_PROMPT, &query_text)
                .with_screenshot(screenshot.clone());
            let planning = match engine.generate_plan(&planning_query).await {
                Ok(output) => output,
                Err(err) => {
                    self.terminate_locked(inner, &format!("planning call failed: {err}"), true)
                        .await;
                    return;
                }
            };
            if self.aborted() {
                self.terminate_locked(inner, ABORT_REASON, false).await;
                return;
            }

            let grounding_query = ModelQuery::new(prompt::GROUNDING_SYSTEM_PROMPT, &query_text)
                .with_screenshot(screenshot.clone());
            let grounding = match engine.generate_grounding(&grounding_query, &planning).await {
                Ok(output) => output,
                Err(err) => {
                    self.terminate_locked(inner, &format!("grounding call failed: {err}"), true)
                        .await;
                    return;
                }
            };
            if self.aborted() {
                self.terminate_locked(inner, ABORT_REASON, false).await;
                return;
            }

            let choice = pipeline::parse_grounding(&grounding);
            let outcome = pipeline::classify(&choice, &page.elements, &page.candidates, &page.viewport);

            {
                let Some(session) = inner.session.as_mut() else {
                    return;
                };
                session.last_planning_output = planning.clone();
                session.last_grounding_output = grounding.clone();
                let element = match &choice.element {
                    pipeline::ElementChoice::Option(pos) => page
                        .candidates
                        .get(*pos)
                        .and_then(|idx| page.elements.get(*idx))
                        .map(|el| el.description.clone()),
                    _ => None,
                };
                session.journal.record_prediction(PredictionRecord {
                    planning_output: planning,
                    grounding_output: grounding,
                    element,
                    action: choice
                        .action
                        .map(|a| a.wire_name().to_string())
                        .unwrap_or_else(|| "UNPARSED".to_string()),
                    value: choice.value.clone(),
                    explanation: choice.explanation.clone(),
                });
            }

            match outcome {
                DecisionOutcome::Terminate { explanation } => {
                    let description = ActionKind::Terminate.verb().to_string();
                    if let Some(session) = inner.session.as_mut() {
                        session.journal.record_action(ActionRecord {
                            url: page.url.clone(),
                            description: description.clone(),
                            success: true,
                            noop: None,
                            explanation: explanation.clone(),
                        });
                    }
                    self.send_panel_best_effort(
                        inner,
                        PanelOutbound::TaskHistoryEntry {
                            action_desc: description,
                            success: true,
                            explanation,
                            action_info: None,
                        },
                    )
                    .await;
                    self.terminate_locked(inner, "model judged the task complete", false)
                        .await;
                    return;
                }
                DecisionOutcome::LoadingWait { explanation } => {
                    info!(explanation, "page reported as loading; waiting for it to settle");
                    sleep(LOAD_WAIT).await;
                    if self.aborted() {
                        self.terminate_locked(inner, ABORT_REASON, false).await;
                        return;
                    }
                    if let Some(session) = inner.session.as_mut() {
                        session.page = None;
                        session.screenshots.begin_round();
                    }
                    if let Err(err) = advance(&mut inner.phase, FsmEvent::DecisionNeedsFreshState) {
                        self.terminate_locked(inner, &err.to_string(), true).await;
                        return;
                    }
                    self.request_page_state(inner, None).await;
                    return;
                }
                DecisionOutcome::Noop { kind, explanation } => {
                    let description = noop_description(kind);
                    let (counters, limits) = {
                        let Some(session) = inner.session.as_mut() else {
                            return;
                        };
                        session.journal.record_action(ActionRecord {
                            url: page.url.clone(),
                            description: description.to_string(),
                            success: false,
                            noop: Some(kind),
                            explanation: explanation.clone(),
                        });
                        session.counters.record_noop();
                        (session.counters, session.config.limits)
                    };
                    self.send_panel_best_effort(
                        inner,
                        PanelOutbound::Notification {
                            msg: format!("Proposed action was not performed: {description}"),
                            details: Some(explanation),
                        },
                    )
                    .await;
                    if let Some(breach) = guard::check_after_noop(&counters, &limits) {
                        self.terminate_locked(inner, &breach.reason(), true).await;
                        return;
                    }
                    // Reprompt against the same page state.
                    continue;
                }
                DecisionOutcome::Commit {
                    pending,
                    might_navigate,
                } => {
                    self.commit_and_review(inner, engine.clone(), pending, might_navigate, screenshot)
                        .await;
                    return;
                }
            }
        }
    }

    /// After the model commits: announce the candidate, highlight the target,
    /// run the safety review, and dispatch (or hand off to the monitor).
    async fn commit_and_review(
        &self,
        inner: &mut ControllerInner,
        engine: Arc<dyn ModelEngine>,
        pending: PendingAction,
        might_navigate: bool,
        initial_screenshot: Option<String>,
    ) {
        let (task_id, tab, prompting_index, threshold, monitor_active, planning, grounding) = {
            let Some(session) = inner.session.as_mut() else {
                return;
            };
            session.pending = Some(pending.clone());
            session.might_navigate = might_navigate;
            (
                session.id.clone(),
                session.tab,
                session.screenshots.prompting_count(),
                session.config.auto_monitor_threshold,
                session.monitor_active(),
                session.last_planning_output.clone(),
                session.last_grounding_output.clone(),
            )
        };

        let action_info = ActionInfo {
            element_index: pending.element_index,
            element_description: pending.element.as_ref().map(|el| el.description.clone()),
            action: pending.action,
            value: pending.value.clone(),
            explanation: pending.explanation.clone(),
        };
        self.send_panel_best_effort(inner, PanelOutbound::ActionCandidate { action_info })
            .await;

        // Highlight the target when the action is element-indexed (including
        // a targeted press-Enter) and prefer the highlighted capture for the
        // judge.
        let mut review_screenshot = initial_screenshot;
        if let Some(element_index) = pending.element_index {
            match self
                .send_helper(
                    inner,
                    HelperCommand::HighlightCandidateElem {
                        element_index,
                        prompting_index_for_action: prompting_index,
                    },
                )
                .await
            {
                HelperSendOutcome::Sent => {
                    sleep(HIGHLIGHT_WAIT).await;
                    if self.aborted() {
                        self.terminate_locked(inner, ABORT_REASON, false).await;
                        return;
                    }
                    if let Some(session) = inner.session.as_mut() {
                        let num_prior_actions = session.journal.action_count();
                        match session
                            .screenshots
                            .targeted(self.host.as_ref(), &task_id, tab, num_prior_actions)
                            .await
                        {
                            Ok(capture) => review_screenshot = Some(capture),
                            Err(err) => {
                                warn!(%err, "targeted screenshot capture failed")
                            }
                        }
                    }
                }
                HelperSendOutcome::Reconnecting => return,
                HelperSendOutcome::Failed(err) => {
                    self.terminate_locked(inner, &format!("highlight failed: {err}"), true)
                        .await;
                    return;
                }
            }
        }

        if monitor_active {
            if let Err(err) = advance(&mut inner.phase, FsmEvent::DecisionNeedsHumanReview) {
                self.terminate_locked(inner, &err.to_string(), true).await;
                return;
            }
            if inner.panel.is_none() {
                let reason = AgentError::PanelMissing(
                    "an action awaits approval but no panel is attached".to_string(),
                );
                self.terminate_locked(inner, &reason.to_string(), true).await;
            }
            return;
        }

        if pending.action.may_cause_navigation() {
            let judge_query = ModelQuery::new(
                prompt::JUDGMENT_SYSTEM_PROMPT,
                format!(
                    "Proposed action: {}\nRationale: {}",
                    pending.describe(),
                    pending.explanation
                ),
            )
            .with_screenshot(review_screenshot);

            let verdict =
                match judge::assess(engine.as_ref(), &judge_query, &planning, &grounding).await {
                    Ok(verdict) => verdict,
                    Err(err) => {
                        self.terminate_locked(inner, &format!("auto-monitor failed: {err}"), true)
                            .await;
                        return;
                    }
                };
            if self.aborted() {
                self.terminate_locked(inner, ABORT_REASON, false).await;
                return;
            }

            if verdict.escalates(threshold) {
                info!(severity = %verdict.severity.as_str(), "auto-monitor escalated to human review");
                if let Some(session) = inner.session.as_mut() {
                    // Temporary elevation, cleared on the next approve/reject.
                    session.monitor_elevated = true;
                }
                if let Err(err) = advance(&mut inner.phase, FsmEvent::DecisionNeedsHumanReview) {
                    self.terminate_locked(inner, &err.to_string(), true).await;
                    return;
                }
                if inner.panel.is_none() {
                    let reason = AgentError::PanelMissing(
                        "auto-monitor escalation requires a panel".to_string(),
                    );
                    self.terminate_locked(inner, &reason.to_string(), true).await;
                    return;
                }
                self.send_panel_best_effort(
                    inner,
                    PanelOutbound::AutoMonitorEscalation {
                        severity: verdict.severity,
                        explanation: verdict.explanation,
                    },
                )
                .await;
                return;
            }
        }

        self.dispatch_pending(inner, FsmEvent::DecisionCommitted).await;
    }

    /// Send the pending action to the helper and enter `WAITING_FOR_ACTION`.
    async fn dispatch_pending(&self, inner: &mut ControllerInner, event: FsmEvent) {
        let Some(pending) = inner.session.as_ref().and_then(|s| s.pending.clone()) else {
            self.terminate_locked(inner, "dispatch without a pending action", true)
                .await;
            return;
        };
        if let Err(err) = advance(&mut inner.phase, event) {
            self.terminate_locked(inner, &err.to_string(), true).await;
            return;
        }
        let command = HelperCommand::ReqAction {
            action: pending.action,
            element_index: pending.element_index,
            value: pending.value,
        };
        match self.send_helper(inner, command).await {
            HelperSendOutcome::Sent | HelperSendOutcome::Reconnecting => {}
            HelperSendOutcome::Failed(err) => {
                self.terminate_locked(inner, &format!("action dispatch failed: {err}"), true)
                    .await;
            }
        }
    }

    // ------------------------------------------------------------------
    // Action completion & navigation detection
    // ------------------------------------------------------------------

    /// Helper confirmed the action. Detect navigation via tab-id inequality
    /// and either refresh the page state or re-inject into the new tab.
    async fn complete_action(&self, inner: &mut ControllerInner, success: bool) {
        let might_navigate = inner
            .session
            .as_ref()
            .map(|s| s.might_navigate)
            .unwrap_or(false);
        if might_navigate {
            sleep(NAV_GRACE).await;
            if self.aborted() {
                self.terminate_locked(inner, ABORT_REASON, false).await;
                return;
            }
        }

        let tab = match self.host.active_tab().await {
            Ok(tab) => tab,
            Err(err) => {
                self.terminate_locked(inner, &format!("active tab query failed: {err}"), true)
                    .await;
                return;
            }
        };

        let navigated = {
            let Some(session) = inner.session.as_ref() else {
                return;
            };
            tab.id != session.tab
        };
        if navigated && !might_navigate {
            let reason = AgentError::TabSwitched(format!("active tab became {}", tab.id));
            self.terminate_locked(inner, &reason.to_string(), true).await;
            return;
        }

        let Some(entry) = self.finish_pending(inner, success, navigated.then(|| tab.title.clone()).flatten()) else {
            self.terminate_locked(inner, "action completed with no pending action", true)
                .await;
            return;
        };
        self.send_panel_best_effort(inner, entry.message).await;
        if let Some(breach) = entry.breach {
            self.terminate_locked(inner, &breach.reason(), true).await;
            return;
        }

        if navigated {
            if let Some(old) = inner.helper.take() {
                old.close().await;
            }
            if let Some(session) = inner.session.as_mut() {
                session.tab = tab.id;
            }
            if let Err(err) = advance(&mut inner.phase, FsmEvent::ActionDoneNavigated) {
                self.terminate_locked(inner, &err.to_string(), true).await;
                return;
            }
            self.reinject_helper(inner).await;
        } else {
            if let Err(err) = advance(&mut inner.phase, FsmEvent::ActionDoneSameTab) {
                self.terminate_locked(inner, &err.to_string(), true).await;
                return;
            }
            self.request_page_state(inner, None).await;
        }
    }

    /// Helper vanished while an action was in flight; normally this means the
    /// page navigated. The pending action is recorded as succeeded iff
    /// navigation was anticipated.
    async fn navigation_after_disconnect(&self, inner: &mut ControllerInner) {
        inner.helper = None;
        sleep(NAV_GRACE).await;
        if self.aborted() {
            self.terminate_locked(inner, ABORT_REASON, false).await;
            return;
        }

        let tab = match self.host.active_tab().await {
            Ok(tab) => tab,
            Err(err) => {
                self.terminate_locked(inner, &format!("active tab query failed: {err}"), true)
                    .await;
                return;
            }
        };

        let anticipated = inner
            .session
            .as_ref()
            .map(|s| s.might_navigate)
            .unwrap_or(false);
        let Some(entry) = self.finish_pending(inner, anticipated, tab.title.clone()) else {
            self.terminate_locked(inner, "helper disconnected with no pending action", true)
                .await;
            return;
        };
        if let Some(session) = inner.session.as_mut() {
            session.tab = tab.id;
        }
        self.send_panel_best_effort(inner, entry.message).await;
        if let Some(breach) = entry.breach {
            self.terminate_locked(inner, &breach.reason(), true).await;
            return;
        }

        if let Err(err) = advance(&mut inner.phase, FsmEvent::HelperDisconnectedDuringAction) {
            self.terminate_locked(inner, &err.to_string(), true).await;
            return;
        }
        self.reinject_helper(inner).await;
    }

    /// Clear the pending action, append its record, update counters, and
    /// prepare the panel history entry plus any limit breach.
    fn finish_pending(
        &self,
        inner: &mut ControllerInner,
        success: bool,
        new_tab_title: Option<String>,
    ) -> Option<FinishedAction> {
        let session = inner.session.as_mut()?;
        let pending = session.pending.take()?;

        let mut description = pending.describe();
        if let Some(title) = new_tab_title {
            description.push_str(&format!(" (navigated to '{title}')"));
        }
        let url = session
            .page
            .as_ref()
            .map(|p| p.url.clone())
            .unwrap_or_default();

        session.journal.record_action(ActionRecord {
            url,
            description: description.clone(),
            success,
            noop: None,
            explanation: pending.explanation.clone(),
        });
        if success {
            session.counters.record_success();
        } else {
            session.counters.record_failure();
        }
        session.might_navigate = false;
        session.page = None;
        session.screenshots.begin_action();

        let breach = guard::check_after_action(&session.counters, &session.config.limits);
        let action_info = ActionInfo {
            element_index: pending.element_index,
            element_description: pending.element.as_ref().map(|el| el.description.clone()),
            action: pending.action,
            value: pending.value.clone(),
            explanation: pending.explanation.clone(),
        };
        Some(FinishedAction {
            message: PanelOutbound::TaskHistoryEntry {
                action_desc: description,
                success,
                explanation: pending.explanation,
                action_info: Some(action_info),
            },
            breach,
        })
    }

    // ------------------------------------------------------------------
    // Human monitor handshake
    // ------------------------------------------------------------------

    async fn approve_pending(&self, inner: &mut ControllerInner) {
        if let Some(session) = inner.session.as_mut() {
            // Approve consumes any temporary auto-monitor elevation.
            session.monitor_elevated = false;
        }
        self.dispatch_pending(inner, FsmEvent::MonitorApproved).await;
    }

    async fn reject_pending(&self, inner: &mut ControllerInner, feedback: Option<String>) {
        if let Some(session) = inner.session.as_mut() {
            session.monitor_elevated = false;
            session.pending = None;
            session.might_navigate = false;
            session.rejection = Some(RejectionNote { feedback });
            session.page = None;
            session.screenshots.begin_round();
        }
        if let Err(err) = advance(&mut inner.phase, FsmEvent::MonitorRejected) {
            self.terminate_locked(inner, &err.to_string(), true).await;
            return;
        }
        self.request_page_state(inner, Some(true)).await;
    }

    // ------------------------------------------------------------------
    // Port plumbing
    // ------------------------------------------------------------------

    async fn request_page_state(&self, inner: &mut ControllerInner, is_monitor_retry: Option<bool>) {
        match self
            .send_helper(inner, HelperCommand::ReqPageState { is_monitor_retry })
            .await
        {
            HelperSendOutcome::Sent | HelperSendOutcome::Reconnecting => {}
            HelperSendOutcome::Failed(err) => {
                self.terminate_locked(inner, &format!("page state request failed: {err}"), true)
                    .await;
            }
        }
    }

    /// Send on the helper port, converting the disconnect diagnostic into the
    /// `PENDING_RECONNECT` handshake.
    async fn send_helper(
        &self,
        inner: &mut ControllerInner,
        command: HelperCommand,
    ) -> HelperSendOutcome {
        let Some(helper) = inner.helper.as_ref() else {
            return HelperSendOutcome::Failed("no helper port held".to_string());
        };
        match helper.send(command).await {
            Ok(()) => HelperSendOutcome::Sent,
            Err(PortError::Disconnected) => {
                debug!("helper send hit the disconnect diagnostic; awaiting disconnect event");
                inner.helper = None;
                if let Some(session) = inner.session.as_mut() {
                    session.pending = None;
                    session.might_navigate = false;
                }
                match advance(&mut inner.phase, FsmEvent::HelperSendDisconnected) {
                    Ok(()) => HelperSendOutcome::Reconnecting,
                    Err(err) => HelperSendOutcome::Failed(err.to_string()),
                }
            }
            Err(PortError::Send(err)) => HelperSendOutcome::Failed(err),
        }
    }

    /// Inject a fresh helper into the session's (possibly rebound) tab.
    async fn reinject_helper(&self, inner: &mut ControllerInner) {
        let Some(tab) = inner.session.as_ref().map(|s| s.tab) else {
            return;
        };
        match self.host.inject_helper(tab).await {
            Ok(helper) => {
                debug!(tab = %tab, "helper re-injected");
                inner.helper = Some(helper);
            }
            Err(err) => {
                self.terminate_locked(inner, &format!("helper re-injection failed: {err}"), true)
                    .await;
            }
        }
    }

    async fn send_panel_best_effort(&self, inner: &ControllerInner, message: PanelOutbound) {
        let Some(slot) = inner.panel.as_ref() else {
            debug!("no panel attached; dropping outbound message");
            return;
        };
        if let Err(err) = slot.port.send(message).await {
            warn!(%err, "panel send failed");
        }
    }

    fn build_engine(&self, config: &AgentConfig) -> Result<Arc<dyn ModelEngine>, AgentError> {
        let provider = config.ai_provider;
        let api_key = config.api_key_for(provider).ok_or_else(|| {
            AgentError::Config(format!("no API key stored for provider '{provider}'"))
        })?;
        self.factory.build(provider, api_key)
    }
}

struct FinishedAction {
    message: PanelOutbound,
    breach: Option<guard::LimitBreach>,
}

fn noop_description(kind: NoopKind) -> &'static str {
    match kind {
        NoopKind::InvalidElement => "model chose an invalid element",
        NoopKind::ActionIncompatibleWithNoneOfAbove => {
            "model chose 'none of the above' for an action that needs an element"
        }
        NoopKind::AiSelectedNoneAction => "model chose not to act",
        NoopKind::AiSelectedNonsensicalScroll => "model chose a scroll that cannot move the page",
    }
}
