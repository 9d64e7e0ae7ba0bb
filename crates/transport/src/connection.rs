//! Connection Manager (C6): the Manager's resilient relay session.
//!
//! The real signaling stack (Sora/WebRTC) is an external collaborator; this
//! multiplexes the Manager's two logical data channels (`ctrl_label`,
//! `state_label`) over a single reconnecting WebSocket, using a small
//! `{"label":..,"msg":..}` envelope in place of a real data-channel API.
//! State machine: IDLE -> CONNECTING -> CONNECTED -> DISCONNECTED -> IDLE,
//! with a TIMEOUT edge back from CONNECTING to IDLE.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Notify};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::dc_manager::DataChannelManager;
use crate::CtrlCallback;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const RECONNECT_BACKOFF: Duration = Duration::from_secs(2);
const POST_DISCONNECT_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub signaling_url: String,
    pub channel_id: String,
    pub ctrl_label: String,
    pub state_label: String,
    pub metadata: Option<serde_json::Value>,
}

pub type WsSender = mpsc::UnboundedSender<Message>;
type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Serialize)]
struct JoinEnvelope<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    channel_id: &'a str,
    ctrl_label: &'a str,
    state_label: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    metadata: &'a Option<serde_json::Value>,
}

#[derive(serde::Deserialize)]
struct Envelope {
    label: Option<String>,
    msg: serde_json::Value,
}

/// Owns the relay session lifecycle for the Manager.
pub struct ConnectionManager {
    config: ConnectionConfig,
    dc_manager: Arc<DataChannelManager<WsSender>>,
    connection_alive: watch::Sender<bool>,
    connection_alive_rx: watch::Receiver<bool>,
    stop: Arc<Notify>,
    stopped: Arc<AtomicBool>,
    /// Invoked for every frame the relay accepts (ctrl, hb, estop); the
    /// message handler on the other end is responsible for the C7 dispatch.
    message_callback: CtrlCallback,
}

impl ConnectionManager {
    pub fn new(
        config: ConnectionConfig,
        dc_manager: Arc<DataChannelManager<WsSender>>,
        message_callback: CtrlCallback,
    ) -> Self {
        let (connection_alive, connection_alive_rx) = watch::channel(false);
        Self {
            config,
            dc_manager,
            connection_alive,
            connection_alive_rx,
            stop: Arc::new(Notify::new()),
            stopped: Arc::new(AtomicBool::new(false)),
            message_callback,
        }
    }

    pub fn connection_alive(&self) -> watch::Receiver<bool> {
        self.connection_alive_rx.clone()
    }

    pub fn is_connected(&self) -> bool {
        *self.connection_alive_rx.borrow()
    }

    /// Send a payload on `label` if the current connection is ready for it.
    /// Never raises; returns `false` on any failure so the publisher can
    /// treat the tick as dropped.
    pub fn send_data(&self, label: &str, payload: &[u8]) -> bool {
        if !self.dc_manager.is_ready(label) {
            return false;
        }
        let Some(handle) = self.dc_manager.get_connection() else {
            return false;
        };
        let Ok(text) = std::str::from_utf8(payload) else {
            return false;
        };
        let Ok(parsed) = serde_json::from_str::<serde_json::Value>(text) else {
            return false;
        };
        let frame = serde_json::json!({ "label": label, "msg": parsed });
        let Ok(encoded) = serde_json::to_string(&frame) else {
            return false;
        };
        handle.sender.send(Message::Text(encoded.into())).is_ok()
    }

    /// Run the reconnect loop until `shutdown()` is called. Intended to be
    /// spawned as its own task.
    pub async fn run(self: Arc<Self>) {
        loop {
            if self.stopped.load(Ordering::SeqCst) {
                return;
            }

            match self.connect_once().await {
                Ok(stream) => {
                    let _ = self.connection_alive.send(true);
                    info!(url = %self.config.signaling_url, "relay connected");

                    self.serve_until_disconnect(stream).await;

                    let _ = self.connection_alive.send(false);
                    self.dc_manager.detach();

                    if self.stopped.load(Ordering::SeqCst) {
                        return;
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(POST_DISCONNECT_BACKOFF) => {}
                        _ = self.stop.notified() => return,
                    }
                }
                Err(e) => {
                    warn!(error = %e, "relay connect failed");
                    tokio::select! {
                        _ = tokio::time::sleep(RECONNECT_BACKOFF) => {}
                        _ = self.stop.notified() => return,
                    }
                }
            }
        }
    }

    async fn connect_once(&self) -> Result<WsStream, crate::TransportError> {
        let connect_fut = connect_async(&self.config.signaling_url);
        let (stream, _resp) = tokio::time::timeout(CONNECT_TIMEOUT, connect_fut)
            .await
            .map_err(|_| crate::TransportError::Timeout)?
            .map_err(crate::TransportError::WebSocket)?;

        Ok(stream)
    }

    async fn serve_until_disconnect(&self, stream: WsStream) {
        let (mut write, mut read) = stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let generation = self.dc_manager.attach(tx.clone());

        let join = JoinEnvelope {
            kind: "join",
            channel_id: &self.config.channel_id,
            ctrl_label: &self.config.ctrl_label,
            state_label: &self.config.state_label,
            metadata: &self.config.metadata,
        };
        if let Ok(json) = serde_json::to_string(&join) {
            let _ = write.send(Message::Text(json.into())).await;
        }

        self.dc_manager.mark_ready(&self.config.ctrl_label);
        self.dc_manager.mark_ready(&self.config.state_label);

        loop {
            tokio::select! {
                outgoing = rx.recv() => {
                    match outgoing {
                        Some(msg) => {
                            if write.send(msg).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                incoming = read.next() => {
                    match incoming {
                        Some(Ok(Message::Text(text))) => {
                            self.handle_incoming(&text, generation);
                        }
                        Some(Ok(Message::Ping(data))) => {
                            let _ = write.send(Message::Pong(data)).await;
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(e)) => {
                            warn!(error = %e, "relay read error");
                            break;
                        }
                        _ => {}
                    }
                }
                _ = self.stop.notified() => {
                    let _ = write.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    }

    fn handle_incoming(&self, text: &str, generation: u64) {
        if !self.dc_manager.is_current(generation) {
            debug!("dropping frame from stale connection generation");
            return;
        }
        let Ok(envelope) = serde_json::from_str::<Envelope>(text) else {
            warn!("relay frame was not valid JSON envelope; dropping");
            return;
        };
        let label = envelope.label.as_deref().unwrap_or("");
        let kind = envelope
            .msg
            .get("type")
            .or_else(|| envelope.msg.get("t"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_lowercase());

        match kind.as_deref() {
            Some("hb") | Some("estop") => (self.message_callback)(envelope.msg),
            Some("cmd") | Some("ctrl") if label == self.config.ctrl_label => {
                (self.message_callback)(envelope.msg)
            }
            _ => debug!(label, "ignoring non-ctrl relay frame"),
        }
    }

    /// Signal every loop to stop and wait is not required; callers join
    /// the spawned task handle for the 1s grace period.
    pub fn shutdown(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.stop.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_data_fails_when_not_ready() {
        let dcm = Arc::new(DataChannelManager::<WsSender>::new(&["#ctrl", "#state"]));
        let cm = ConnectionManager::new(
            ConnectionConfig {
                signaling_url: "ws://localhost:1".to_string(),
                channel_id: "room".to_string(),
                ctrl_label: "#ctrl".to_string(),
                state_label: "#state".to_string(),
                metadata: None,
            },
            dcm,
            Arc::new(|_| {}),
        );
        assert!(!cm.send_data("#state", b"{}"));
        assert!(!cm.is_connected());
    }
}
