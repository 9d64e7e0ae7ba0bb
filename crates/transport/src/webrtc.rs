//! WebRTC-data-channel ctrl transport (C13, WebRTC variant).
//!
//! The real Sora/WebRTC signaling stack is an external collaborator (see
//! the project spec's scope notes); this opens a single reconnecting
//! WebSocket standing in for a `recvonly` ctrl data channel and applies
//! the same accept/drop rule a real data-channel callback would.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::{is_ctrl_frame, is_state_frame, CtrlCallback, StateCallback, TransportError};

#[derive(Debug, Clone)]
pub struct WebRtcConfig {
    pub signaling_url: String,
    pub channel_id: String,
    pub ctrl_label: String,
    /// Label of the Manager's state channel. Only joined (and only routed
    /// to `on_state`) when non-empty — a Bridge running the direct ctrl
    /// path alone has no use for it.
    pub state_label: String,
    pub metadata: Option<serde_json::Value>,
    pub connect_timeout: Duration,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            signaling_url: String::new(),
            channel_id: "sora".to_string(),
            ctrl_label: "#ctrl".to_string(),
            state_label: String::new(),
            metadata: None,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Serialize)]
struct JoinEnvelope<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    channel_id: &'a str,
    ctrl_label: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    state_label: Option<&'a str>,
    direction: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    metadata: &'a Option<serde_json::Value>,
}

/// Inbound WebRTC-data-channel receiver, used directly by the Bridge when
/// it is not relaying through the Manager. Carries the direct ctrl-label
/// subscription and, when `on_state` is registered, a second relayed
/// subscription to the Manager's state label.
pub struct WebRtcCtrlTransport {
    config: WebRtcConfig,
    ctrl_callback: Option<CtrlCallback>,
    state_callback: Option<StateCallback>,
    closed: Arc<AtomicBool>,
    stop: Arc<Notify>,
    task: Option<JoinHandle<()>>,
}

impl WebRtcCtrlTransport {
    pub fn new(config: WebRtcConfig) -> Self {
        Self {
            config,
            ctrl_callback: None,
            state_callback: None,
            closed: Arc::new(AtomicBool::new(false)),
            stop: Arc::new(Notify::new()),
            task: None,
        }
    }

    pub fn on_ctrl(&mut self, callback: CtrlCallback) {
        self.ctrl_callback = Some(callback);
    }

    /// Register a callback for relayed Manager `state` payloads. Only
    /// meaningful when `config.state_label` is non-empty.
    pub fn on_state(&mut self, callback: StateCallback) {
        self.state_callback = Some(callback);
    }

    pub async fn connect(&mut self) -> Result<(), TransportError> {
        if self.config.signaling_url.is_empty() {
            return Err(TransportError::Connection(
                "signaling_urls must not be empty".to_string(),
            ));
        }

        info!(
            url = %self.config.signaling_url,
            channel = %self.config.channel_id,
            ctrl_label = %self.config.ctrl_label,
            "connecting to WebRTC relay"
        );

        let connect_fut = connect_async(&self.config.signaling_url);
        let (stream, _resp) = tokio::time::timeout(self.config.connect_timeout, connect_fut)
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(TransportError::WebSocket)?;

        let (mut write, mut read) = stream.split();

        let state_label = (!self.config.state_label.is_empty()).then_some(self.config.state_label.as_str());
        let join = JoinEnvelope {
            kind: "join",
            channel_id: &self.config.channel_id,
            ctrl_label: &self.config.ctrl_label,
            state_label,
            direction: "recvonly",
            metadata: &self.config.metadata,
        };
        if let Ok(json) = serde_json::to_string(&join) {
            use futures_util::SinkExt;
            let _ = write.send(Message::Text(json.into())).await;
        }

        let ctrl_callback = self.ctrl_callback.clone();
        let state_callback = self.state_callback.clone();
        let ctrl_label = self.config.ctrl_label.clone();
        let closed = self.closed.clone();
        let stop = self.stop.clone();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = read.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                handle_frame(&text, &ctrl_label, ctrl_callback.as_ref(), state_callback.as_ref());
                            }
                            Some(Ok(Message::Close(_))) | None => break,
                            Some(Err(e)) => {
                                warn!(error = %e, "WebRTC relay read error");
                                break;
                            }
                            _ => {}
                        }
                    }
                    _ = stop.notified() => break,
                }
            }
            closed.store(true, Ordering::SeqCst);
        });

        self.task = Some(task);
        Ok(())
    }

    pub async fn close(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop.notify_waiters();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

fn handle_frame(
    text: &str,
    ctrl_label: &str,
    ctrl_callback: Option<&CtrlCallback>,
    state_callback: Option<&StateCallback>,
) {
    let Ok(payload) = serde_json::from_str::<serde_json::Value>(text) else {
        warn!("ctrl message invalid JSON; dropping");
        return;
    };

    let kind = payload
        .get("type")
        .or_else(|| payload.get("t"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_lowercase());

    if kind.as_deref() == Some("hb") {
        debug!("heartbeat received");
        return;
    }
    if is_state_frame(&payload) {
        if let Some(cb) = state_callback {
            cb(payload);
        }
        return;
    }
    if !is_ctrl_frame(&payload) {
        debug!(?kind, "ignoring non-ctrl payload");
        return;
    }

    debug!(label = ctrl_label, "recv ctrl");
    if let Some(cb) = ctrl_callback {
        cb(payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_rejects_empty_url() {
        let mut t = WebRtcCtrlTransport::new(WebRtcConfig::default());
        assert!(t.connect().await.is_err());
    }
}
