//! Transport layer: the Manager's resilient relay session (C5/C6) and the
//! Bridge's direct ctrl receivers over WebRTC or MQTT (C13).
//!
//! The real WebRTC/MQTT signaling stacks are external collaborators (see
//! the project spec's scope notes); what lives here is the reconnection
//! shape and the uniform message taxonomy around them, not a signaling
//! protocol implementation.

pub mod connection;
pub mod dc_manager;
pub mod mqtt;
pub mod webrtc;

use std::sync::Arc;

use thiserror::Error;

/// Callback invoked with a decoded ctrl payload. Must not panic; transport
/// code logs and suppresses any callback error it can observe, but a Rust
/// callback that panics will still unwind, so keep it infallible in practice.
pub type CtrlCallback = Arc<dyn Fn(serde_json::Value) + Send + Sync>;

/// Callback invoked with a decoded Manager `state` payload received on the
/// state label/topic, the relayed path a Bridge uses instead of (or
/// alongside) a direct ctrl subscription.
pub type StateCallback = Arc<dyn Fn(serde_json::Value) + Send + Sync>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("connect timed out")]
    Timeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("mqtt error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Normalise a raw inbound frame's type tag and decide whether it is a
/// ctrl frame this transport should forward. Shared between the WebRTC
/// and MQTT variants so the accept/drop rule can't drift between them.
pub fn is_ctrl_frame(value: &serde_json::Value) -> bool {
    let kind = value
        .get("type")
        .or_else(|| value.get("t"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_lowercase());

    matches!(kind.as_deref(), Some("cmd") | Some("ctrl"))
}

/// Same normalisation as [`is_ctrl_frame`], for frames arriving on the
/// state label/topic: only a `state` payload carries a `last_ctrl`/`status`
/// worth relaying to the subscriber, heartbeats and anything else are noise.
pub fn is_state_frame(value: &serde_json::Value) -> bool {
    let kind = value
        .get("type")
        .or_else(|| value.get("t"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_lowercase());

    kind.as_deref() == Some("state")
}
