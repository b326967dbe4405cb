//! WebSocket bridge between the controller and the browser extension.
//!
//! Three endpoints, one conduit each:
//! - `/panel`: the UI panel. Messages in both directions are the panel wire
//!   contract; attaching greets the panel with `AGENT_CONTROLLER_READY`.
//! - `/helper`: the in-page helper. A connection registers itself as the
//!   live helper port; closing it surfaces as a helper disconnect.
//! - `/host`: the extension's background shim, which services browser
//!   requests (helper injection, active-tab queries, screenshot capture)
//!   over a small id-matched request/reply protocol.
//!
//! The bridge is transport only; it owns no task state.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, Mutex, Notify};
use tokio::time::timeout;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

use wayfinder_core_types::{TabId, TabInfo};

use wayfinder_agent::{
    AgentController, AgentError, BrowserHost, HelperCommand, HelperMessage, HelperPort,
    PanelMessage, PanelOutbound, PanelPort, PortError,
};

/// How long to wait for the extension shim to answer a browser request.
const HOST_CALL_TIMEOUT: Duration = Duration::from_secs(10);
/// How long to wait for an injected helper to open its socket.
const HELPER_ATTACH_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Clone)]
pub struct BridgeState {
    pub controller: Arc<AgentController>,
    pub host: Arc<WsBrowserHost>,
}

pub fn router(state: BridgeState) -> Router {
    Router::new()
        .route("/panel", get(panel_ws))
        .route("/helper", get(helper_ws))
        .route("/host", get(host_ws))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: BridgeState) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "bridge listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

/// Spawn a writer task that drains `rx` into the socket sink.
fn spawn_writer(
    mut sink: futures_util::stream::SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<String>,
) {
    tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });
}

// ----------------------------------------------------------------------
// Panel conduit
// ----------------------------------------------------------------------

async fn panel_ws(ws: WebSocketUpgrade, State(state): State<BridgeState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| panel_session(socket, state))
}

async fn panel_session(socket: WebSocket, state: BridgeState) {
    let (sink, mut stream) = socket.split();
    let (tx, rx) = mpsc::channel::<String>(64);
    spawn_writer(sink, rx);

    // A live panel mid-task keeps its slot; a refused newcomer is closed.
    let Some(panel_id) = state
        .controller
        .attach_panel(Arc::new(ChannelPanelPort { tx }))
        .await
    else {
        info!("panel connection refused: another panel is active");
        return;
    };
    info!(panel_id, "panel connected");

    while let Some(Ok(message)) = stream.next().await {
        if let Message::Text(text) = message {
            match serde_json::from_str::<PanelMessage>(&text) {
                Ok(message) => state.controller.handle_panel_message(message).await,
                Err(err) => warn!(%err, "undecodable panel message"),
            }
        }
    }

    info!(panel_id, "panel disconnected");
    state.controller.detach_panel(panel_id).await;
}

struct ChannelPanelPort {
    tx: mpsc::Sender<String>,
}

#[async_trait]
impl PanelPort for ChannelPanelPort {
    async fn send(&self, message: PanelOutbound) -> Result<(), PortError> {
        let text =
            serde_json::to_string(&message).map_err(|err| PortError::Send(err.to_string()))?;
        self.tx
            .send(text)
            .await
            .map_err(|_| PortError::Disconnected)
    }
}

// ----------------------------------------------------------------------
// Helper conduit
// ----------------------------------------------------------------------

async fn helper_ws(ws: WebSocketUpgrade, State(state): State<BridgeState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| helper_session(socket, state))
}

async fn helper_session(socket: WebSocket, state: BridgeState) {
    let (sink, mut stream) = socket.split();
    let (tx, rx) = mpsc::channel::<String>(64);
    spawn_writer(sink, rx);

    debug!("helper connected");
    state.host.register_helper(tx).await;

    while let Some(Ok(message)) = stream.next().await {
        if let Message::Text(text) = message {
            match serde_json::from_str::<HelperMessage>(&text) {
                Ok(message) => state.controller.handle_helper_message(message).await,
                Err(err) => warn!(%err, "undecodable helper message"),
            }
        }
    }

    debug!("helper disconnected");
    state.host.unregister_helper().await;
    state.controller.handle_helper_disconnect().await;
}

// ----------------------------------------------------------------------
// Host conduit (browser facilities)
// ----------------------------------------------------------------------

async fn host_ws(ws: WebSocketUpgrade, State(state): State<BridgeState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| host_session(socket, state))
}

async fn host_session(socket: WebSocket, state: BridgeState) {
    let (sink, mut stream) = socket.split();
    let (tx, rx) = mpsc::channel::<String>(64);
    spawn_writer(sink, rx);

    info!("host shim connected");
    state.host.register_host(tx).await;

    while let Some(Ok(message)) = stream.next().await {
        if let Message::Text(text) = message {
            match serde_json::from_str::<HostReply>(&text) {
                Ok(reply) => state.host.complete(reply).await,
                Err(err) => warn!(%err, "undecodable host reply"),
            }
        }
    }

    info!("host shim disconnected");
    state.host.clear_host().await;
}

/// Browser requests sent to the extension shim.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE", rename_all_fields = "camelCase")]
enum HostCommand {
    InjectHelper { id: u64, tab_id: i64 },
    ActiveTab { id: u64 },
    CaptureScreenshot { id: u64, tab_id: i64 },
}

impl HostCommand {
    fn with_id(kind: HostCall, id: u64) -> Self {
        match kind {
            HostCall::InjectHelper { tab_id } => Self::InjectHelper { id, tab_id },
            HostCall::ActiveTab => Self::ActiveTab { id },
            HostCall::CaptureScreenshot { tab_id } => Self::CaptureScreenshot { id, tab_id },
        }
    }
}

enum HostCall {
    InjectHelper { tab_id: i64 },
    ActiveTab,
    CaptureScreenshot { tab_id: i64 },
}

/// Replies from the extension shim, matched to requests by id.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HostReply {
    id: u64,
    #[serde(default)]
    result: serde_json::Value,
    #[serde(default)]
    error: Option<String>,
}

/// [`BrowserHost`] backed by the `/host` WebSocket.
#[derive(Default)]
pub struct WsBrowserHost {
    host_conn: Mutex<Option<mpsc::Sender<String>>>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Result<serde_json::Value, String>>>>,
    next_id: AtomicU64,
    helper_slot: Mutex<Option<mpsc::Sender<String>>>,
    helper_notify: Notify,
}

impl WsBrowserHost {
    pub fn new() -> Self {
        Self::default()
    }

    async fn register_host(&self, tx: mpsc::Sender<String>) {
        *self.host_conn.lock().await = Some(tx);
    }

    async fn clear_host(&self) {
        *self.host_conn.lock().await = None;
        // Outstanding calls will fail when their reply never arrives.
    }

    async fn register_helper(&self, tx: mpsc::Sender<String>) {
        *self.helper_slot.lock().await = Some(tx);
        self.helper_notify.notify_waiters();
    }

    async fn unregister_helper(&self) {
        *self.helper_slot.lock().await = None;
    }

    async fn complete(&self, reply: HostReply) {
        let Some(sender) = self.pending.lock().await.remove(&reply.id) else {
            debug!(id = reply.id, "host reply with no pending call");
            return;
        };
        let outcome = match reply.error {
            Some(error) => Err(error),
            None => Ok(reply.result),
        };
        let _ = sender.send(outcome);
    }

    async fn call(&self, kind: HostCall) -> Result<serde_json::Value, AgentError> {
        let tx = self
            .host_conn
            .lock()
            .await
            .clone()
            .ok_or_else(|| AgentError::internal("extension host shim is not connected"))?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.lock().await.insert(id, reply_tx);

        let command = HostCommand::with_id(kind, id);
        let text = serde_json::to_string(&command)
            .map_err(|err| AgentError::internal(format!("host command encode failed: {err}")))?;
        if tx.send(text).await.is_err() {
            self.pending.lock().await.remove(&id);
            return Err(AgentError::internal("extension host shim went away"));
        }

        match timeout(HOST_CALL_TIMEOUT, reply_rx).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(error))) => Err(AgentError::internal(format!("host call failed: {error}"))),
            Ok(Err(_)) | Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(AgentError::internal("host call timed out"))
            }
        }
    }
}

#[async_trait]
impl BrowserHost for WsBrowserHost {
    async fn inject_helper(&self, tab: TabId) -> Result<Box<dyn HelperPort>, AgentError> {
        self.call(HostCall::InjectHelper { tab_id: tab.0 }).await?;

        // The helper announces itself by opening /helper; wait for it. The
        // notified future is created before the slot check so a registration
        // landing in between is not missed.
        let attach = async {
            loop {
                let notified = self.helper_notify.notified();
                if let Some(tx) = self.helper_slot.lock().await.clone() {
                    return tx;
                }
                notified.await;
            }
        };
        let tx = timeout(HELPER_ATTACH_TIMEOUT, attach)
            .await
            .map_err(|_| AgentError::internal("injected helper never connected"))?;
        Ok(Box::new(WsHelperPort {
            tx,
            closed: AtomicBool::new(false),
        }))
    }

    async fn active_tab(&self) -> Result<TabInfo, AgentError> {
        let value = self.call(HostCall::ActiveTab).await?;
        serde_json::from_value(value)
            .map_err(|err| AgentError::internal(format!("active tab reply invalid: {err}")))
    }

    async fn capture_screenshot(&self, tab: TabId) -> Result<String, AgentError> {
        let value = self.call(HostCall::CaptureScreenshot { tab_id: tab.0 }).await?;
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| AgentError::internal("screenshot reply was not a string"))
    }
}

struct WsHelperPort {
    tx: mpsc::Sender<String>,
    closed: AtomicBool,
}

#[async_trait]
impl HelperPort for WsHelperPort {
    async fn send(&self, command: HelperCommand) -> Result<(), PortError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PortError::Disconnected);
        }
        let text =
            serde_json::to_string(&command).map_err(|err| PortError::Send(err.to_string()))?;
        self.tx
            .send(text)
            .await
            .map_err(|_| PortError::Disconnected)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_command_wire_shape() {
        let command = HostCommand::with_id(HostCall::InjectHelper { tab_id: 7 }, 3);
        let json = serde_json::to_string(&command).unwrap();
        assert!(json.contains("\"type\":\"INJECT_HELPER\""));
        assert!(json.contains("\"tabId\":7"));
        assert!(json.contains("\"id\":3"));
    }

    #[tokio::test]
    async fn test_host_call_without_shim_fails() {
        let host = WsBrowserHost::new();
        assert!(host.active_tab().await.is_err());
    }

    #[tokio::test]
    async fn test_host_reply_completes_call() {
        let host = Arc::new(WsBrowserHost::new());
        let (tx, mut rx) = mpsc::channel::<String>(8);
        host.register_host(tx).await;

        let caller = host.clone();
        let call = tokio::spawn(async move { caller.active_tab().await });

        // Service the request like the extension shim would.
        let request = rx.recv().await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&request).unwrap();
        assert_eq!(value["type"], "ACTIVE_TAB");
        let id = value["id"].as_u64().unwrap();
        host.complete(HostReply {
            id,
            result: serde_json::json!({"id": 42, "title": "Example", "url": "https://example.com"}),
            error: None,
        })
        .await;

        let tab = call.await.unwrap().unwrap();
        assert_eq!(tab.id, TabId(42));
        assert_eq!(tab.title.as_deref(), Some("Example"));
    }

    #[tokio::test]
    async fn test_closed_helper_port_reports_disconnected() {
        let (tx, _rx) = mpsc::channel::<String>(1);
        let port = WsHelperPort {
            tx,
            closed: AtomicBool::new(false),
        };
        port.close().await;
        let err = port
            .send(HelperCommand::ReqPageState {
                is_monitor_retry: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PortError::Disconnected));
    }
}
