//! Shared wire and domain types for the teleop control plane.
//!
//! These are the message shapes that cross a transport boundary (Manager
//! <-> UI, Manager <-> Bridge) plus the small domain structs both sides
//! need a common vocabulary for. Component-local state (the vehicle model,
//! the control store) lives in its owning crate, not here.

use serde::{Deserialize, Serialize};

/// Decoded control intent, after preset resolution and clamping.
///
/// Built by the message handler from an inbound ctrl frame; stored
/// verbatim by the control state store until superseded.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControlSnapshot {
    pub seq: u32,
    pub throttle: f64,
    pub steer: f64,
    pub brake: f64,
    /// Monotonic instant the snapshot was accepted, in seconds.
    pub received_at: f64,
    /// Wall-clock timestamp (ms) the sender attached, if any.
    pub client_ts_ms: Option<i64>,
    /// Wall-clock timestamp (ms) at ingress, if known.
    pub manager_recv_ms: Option<i64>,
}

impl ControlSnapshot {
    /// Age of this snapshot relative to a later monotonic instant, in seconds.
    pub fn age(&self, now_mono: f64) -> f64 {
        (now_mono - self.received_at).max(0.0)
    }
}

/// Mode tag carried on a control frame; informational only at this layer.
pub const DEFAULT_MODE: &str = "arcade";

/// Planar pose as carried on the wire: x (lateral), y (forward), heading (rad).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct WirePose {
    pub x: f64,
    pub y: f64,
    pub heading: f64,
}

/// Planar velocity as carried on the wire.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct WireVelocity {
    pub linear: f64,
    pub angular: f64,
}

/// Physics step metadata attached to every state payload.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct StepInfo {
    pub dt_sec: f64,
}

/// Degraded-mode status block.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusBlock {
    pub ok: bool,
    pub msg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hb_age_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ctrl_latency_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estop: Option<bool>,
}

/// The last accepted control snapshot, echoed back for UI display.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastCtrlBlock {
    pub seq: u32,
    pub mode: String,
    pub command: CommandTriple,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sent_at_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manager_recv_at_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<i64>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CommandTriple {
    pub throttle: f64,
    pub steer: f64,
    pub brake: f64,
}

/// Emitted once per newly observed control `seq`, then omitted until the next.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineBlock {
    pub seq: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ui_sent: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mgr_recv: Option<i64>,
}

/// The wire object published by the Manager's state loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatePayload {
    #[serde(rename = "type")]
    pub kind: String,
    pub seq: u32,
    pub sent_at_ms: i64,
    pub pose: WirePose,
    pub velocity: WireVelocity,
    pub status: StatusBlock,
    pub step: StepInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_ctrl: Option<LastCtrlBlock>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeline: Option<TimelineBlock>,
}

/// Heartbeat frame, sent in either direction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatFrame {
    #[serde(rename = "type")]
    pub kind: String,
    pub role: String,
    pub t: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl HeartbeatFrame {
    pub fn server(t_ms: i64, label: impl Into<String>) -> Self {
        Self {
            kind: "hb".to_string(),
            role: "server".to_string(),
            t: t_ms,
            label: Some(label.into()),
        }
    }
}

/// Raw inbound ctrl frame before clamping/preset resolution, mirroring the
/// two accepted shapes: a named preset, or explicit throttle/steer/brake.
#[derive(Debug, Clone, Deserialize)]
pub struct RawCtrlFrame {
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default, rename = "t")]
    pub t_alias: Option<serde_json::Value>,
    #[serde(default)]
    pub seq: Option<serde_json::Value>,
    #[serde(default)]
    pub command: Option<serde_json::Value>,
    #[serde(default)]
    pub cmd: Option<RawCmdFields>,
    #[serde(default)]
    pub sent_at_ms: Option<i64>,
    #[serde(default)]
    pub ts: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawCmdFields {
    #[serde(default)]
    pub throttle: Option<f64>,
    #[serde(default)]
    pub steer: Option<f64>,
    #[serde(default)]
    pub brake: Option<f64>,
    #[serde(default)]
    pub mode: Option<String>,
}

impl RawCtrlFrame {
    /// Normalised message type: prefers `type`, falls back to `t`, lowercased.
    pub fn normalised_type(&self) -> Option<String> {
        if let Some(k) = &self.kind {
            return Some(k.to_lowercase());
        }
        match &self.t_alias {
            Some(serde_json::Value::String(s)) => Some(s.to_lowercase()),
            _ => None,
        }
    }
}

/// Clamp a value into `[lo, hi]`.
pub fn clamp(v: f64, lo: f64, hi: f64) -> f64 {
    v.max(lo).min(hi)
}

/// Wrap an angle (radians) into `(-pi, pi]`.
pub fn wrap_angle(mut a: f64) -> f64 {
    use std::f64::consts::PI;
    let tau = 2.0 * PI;
    while a > PI {
        a -= tau;
    }
    while a <= -PI {
        a += tau;
    }
    a
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp() {
        assert_eq!(clamp(5.0, -1.0, 1.0), 1.0);
        assert_eq!(clamp(-5.0, -1.0, 1.0), -1.0);
        assert_eq!(clamp(0.3, -1.0, 1.0), 0.3);
    }

    #[test]
    fn test_wrap_angle_idempotent() {
        use std::f64::consts::PI;
        let vals = [0.0, 1.0, PI, -PI + 0.001, -0.5];
        for v in vals {
            let wrapped = wrap_angle(v);
            assert!(wrapped > -PI && wrapped <= PI, "{wrapped} out of range");
            assert!((wrap_angle(wrapped) - wrapped).abs() < 1e-12);
        }
    }

    #[test]
    fn test_wrap_angle_crosses_pi() {
        use std::f64::consts::PI;
        let wrapped = wrap_angle(PI + 0.1);
        assert!(wrapped < -PI + 0.2 && wrapped > -PI);
    }

    #[test]
    fn test_control_snapshot_age() {
        let snap = ControlSnapshot {
            seq: 1,
            throttle: 0.5,
            steer: 0.0,
            brake: 0.0,
            received_at: 10.0,
            client_ts_ms: None,
            manager_recv_ms: None,
        };
        assert!((snap.age(10.5) - 0.5).abs() < 1e-9);
        assert_eq!(snap.age(9.0), 0.0);
    }

    #[test]
    fn test_raw_ctrl_frame_preset_deserialize() {
        let json = r#"{"type":"ctrl","seq":1,"command":"UP","sent_at_ms":123}"#;
        let frame: RawCtrlFrame = serde_json::from_str(json).unwrap();
        assert_eq!(frame.normalised_type().as_deref(), Some("ctrl"));
        assert_eq!(frame.sent_at_ms, Some(123));
    }

    #[test]
    fn test_raw_ctrl_frame_explicit_deserialize() {
        let json = r#"{"type":"ctrl","seq":2,"cmd":{"throttle":0.5,"steer":-0.2,"brake":0.0}}"#;
        let frame: RawCtrlFrame = serde_json::from_str(json).unwrap();
        let cmd = frame.cmd.unwrap();
        assert_eq!(cmd.throttle, Some(0.5));
        assert_eq!(cmd.steer, Some(-0.2));
    }

    #[test]
    fn test_state_payload_roundtrip() {
        let payload = StatePayload {
            kind: "state".to_string(),
            seq: 7,
            sent_at_ms: 1000,
            pose: WirePose {
                x: 1.0,
                y: 2.0,
                heading: 0.1,
            },
            velocity: WireVelocity {
                linear: 0.3,
                angular: 0.0,
            },
            status: StatusBlock {
                ok: true,
                msg: "ok".to_string(),
                hb_age_ms: None,
                ctrl_latency_ms: None,
                estop: None,
            },
            step: StepInfo { dt_sec: 1.0 / 60.0 },
            last_ctrl: None,
            timeline: None,
        };
        let json = serde_json::to_string(&payload).unwrap();
        let back: StatePayload = serde_json::from_str(&json).unwrap();
        assert_eq!(back.seq, 7);
        assert_eq!(back.pose.x, 1.0);
    }
}
