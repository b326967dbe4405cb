//! Shared scaffolding for controller integration tests: a recording panel, a
//! scriptable browser host, and a static engine factory around the mock
//! model engine.

use std::io::{Cursor, Read};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use parking_lot::Mutex;

use wayfinder_agent::{
    AgentConfig, AgentController, AgentError, AiProviderType, BrowserHost, EngineFactory,
    HelperCommand, HelperPort, InteractiveElement, LimitSet, LogStore, MockModelEngine,
    ModelEngine, PanelOutbound, PanelPort, PortError, ScreenshotStore, Severity, ViewportInfo,
};
use wayfinder_core_types::{TabId, TabInfo};

/// Panel port that records everything the controller sends.
#[derive(Default)]
pub struct RecordingPanel {
    sent: Mutex<Vec<PanelOutbound>>,
}

impl RecordingPanel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sent(&self) -> Vec<PanelOutbound> {
        self.sent.lock().clone()
    }

    pub fn task_ended(&self) -> bool {
        self.sent()
            .iter()
            .any(|msg| matches!(msg, PanelOutbound::TaskEnded { .. }))
    }

    pub fn notifications(&self) -> Vec<String> {
        self.sent()
            .iter()
            .filter_map(|msg| match msg {
                PanelOutbound::Notification { msg, .. } => Some(msg.clone()),
                _ => None,
            })
            .collect()
    }

    /// Parse `result.json` out of the exported history archive.
    pub fn exported_result(&self) -> Option<serde_json::Value> {
        let zip_base64 = self.sent().iter().rev().find_map(|msg| match msg {
            PanelOutbound::HistoryExport { zip_bytes, .. } => Some(zip_bytes.clone()),
            _ => None,
        })?;
        let bytes = BASE64.decode(zip_base64).ok()?;
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).ok()?;
        let mut text = String::new();
        archive
            .by_name("result.json")
            .ok()?
            .read_to_string(&mut text)
            .ok()?;
        serde_json::from_str(&text).ok()
    }
}

#[async_trait]
impl PanelPort for RecordingPanel {
    async fn send(&self, message: PanelOutbound) -> Result<(), PortError> {
        self.sent.lock().push(message);
        Ok(())
    }
}

/// Helper port handed out by [`ScriptedHost`]; records commands and can be
/// made to fail with the disconnect diagnostic.
pub struct ScriptedHelper {
    commands: Arc<Mutex<Vec<HelperCommand>>>,
    disconnected: Arc<Mutex<bool>>,
}

#[async_trait]
impl HelperPort for ScriptedHelper {
    async fn send(&self, command: HelperCommand) -> Result<(), PortError> {
        if *self.disconnected.lock() {
            return Err(PortError::Disconnected);
        }
        self.commands.lock().push(command);
        Ok(())
    }

    async fn close(&self) {}
}

/// Browser host with a settable active tab and shared helper command log.
pub struct ScriptedHost {
    active: Mutex<TabInfo>,
    commands: Arc<Mutex<Vec<HelperCommand>>>,
    disconnected: Arc<Mutex<bool>>,
    injections: AtomicU32,
}

impl ScriptedHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            active: Mutex::new(
                TabInfo::new(TabId(1))
                    .with_title("Example")
                    .with_url("https://example.com"),
            ),
            commands: Arc::new(Mutex::new(Vec::new())),
            disconnected: Arc::new(Mutex::new(false)),
            injections: AtomicU32::new(0),
        })
    }

    pub fn set_active_tab(&self, tab: TabInfo) {
        *self.active.lock() = tab;
    }

    /// Make subsequent helper sends fail with the disconnect diagnostic.
    pub fn break_helper(&self) {
        *self.disconnected.lock() = true;
    }

    pub fn repair_helper(&self) {
        *self.disconnected.lock() = false;
    }

    pub fn helper_commands(&self) -> Vec<HelperCommand> {
        self.commands.lock().clone()
    }

    pub fn action_requests(&self) -> Vec<HelperCommand> {
        self.helper_commands()
            .into_iter()
            .filter(|cmd| matches!(cmd, HelperCommand::ReqAction { .. }))
            .collect()
    }

    pub fn page_state_requests(&self) -> usize {
        self.helper_commands()
            .iter()
            .filter(|cmd| matches!(cmd, HelperCommand::ReqPageState { .. }))
            .count()
    }

    pub fn injections(&self) -> u32 {
        self.injections.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrowserHost for ScriptedHost {
    async fn inject_helper(&self, _tab: TabId) -> Result<Box<dyn HelperPort>, AgentError> {
        self.injections.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedHelper {
            commands: self.commands.clone(),
            disconnected: self.disconnected.clone(),
        }))
    }

    async fn active_tab(&self) -> Result<TabInfo, AgentError> {
        Ok(self.active.lock().clone())
    }

    async fn capture_screenshot(&self, _tab: TabId) -> Result<String, AgentError> {
        Ok(BASE64.encode(b"screenshot"))
    }
}

/// Factory that always hands out the same mock engine.
pub struct StaticFactory {
    engine: Arc<MockModelEngine>,
}

impl EngineFactory for StaticFactory {
    fn build(
        &self,
        _provider: AiProviderType,
        _api_key: &str,
    ) -> Result<Arc<dyn ModelEngine>, AgentError> {
        Ok(self.engine.clone())
    }
}

pub fn test_config() -> AgentConfig {
    let mut config = AgentConfig {
        limits: LimitSet {
            max_ops: 10,
            max_noops: 3,
            max_failures: 3,
            max_failure_or_noop_streak: 3,
        },
        monitor_mode: false,
        auto_monitor_threshold: Severity::Medium,
        ai_provider: AiProviderType::Anthropic,
        eula_accepted: true,
        api_keys: Default::default(),
    };
    config
        .api_keys
        .insert("anthropicApiKey".to_string(), "test-key".to_string());
    config
}

pub struct Harness {
    pub controller: Arc<AgentController>,
    pub panel: Arc<RecordingPanel>,
    pub host: Arc<ScriptedHost>,
    pub engine: Arc<MockModelEngine>,
}

pub fn harness_with_config(config: AgentConfig) -> Harness {
    let engine = Arc::new(MockModelEngine::new());
    let host = ScriptedHost::new();
    let controller = Arc::new(AgentController::new(
        host.clone() as Arc<dyn BrowserHost>,
        Arc::new(StaticFactory {
            engine: engine.clone(),
        }),
        config,
        Arc::new(LogStore::new()),
        Arc::new(ScreenshotStore::new()),
        "0.1.0-test",
    ));
    Harness {
        controller,
        panel: RecordingPanel::new(),
        host,
        engine,
    }
}

pub fn harness() -> Harness {
    harness_with_config(test_config())
}

pub fn login_button() -> InteractiveElement {
    InteractiveElement {
        description: "Login".to_string(),
        tag_head: "<button ".to_string(),
        tag_name: "button".to_string(),
        center_coords: (50, 80),
        element_id: "el-login".to_string(),
    }
}

pub fn flat_viewport() -> ViewportInfo {
    ViewportInfo {
        width: 1024,
        height: 768,
        scroll_x: 0,
        scroll_y: 0,
        page_scroll_height: 768,
    }
}

pub const CLICK_A: &str =
    r#"{"element": "A", "action": "CLICK", "value": null, "explanation": "Clicking login"}"#;
pub const TERMINATE: &str =
    r#"{"element": null, "action": "TERMINATE", "value": null, "explanation": "Task complete"}"#;
pub const JUDGE_SAFE: &str = r#"{"severity": "SAFE", "explanation": "Routine interaction."}"#;
