//! Message Handler (C7).
//!
//! Dispatches a decoded inbound frame (ctrl label filtering already done by
//! the transport layer) to the vehicle model, control store, heartbeat
//! state, or estop latch.

use std::sync::{Arc, Mutex};

use manager_control::{resolve_preset, ControlState, EstopState, HeartbeatState, StatsTracker};
use serde_json::Value;
use tracing::warn;
use types::{clamp, ControlSnapshot};
use vehicle::VehicleModel;

pub struct HandlerDeps {
    pub vehicle: Arc<Mutex<VehicleModel>>,
    pub control_state: Arc<ControlState>,
    pub heartbeat_state: Arc<HeartbeatState>,
    pub estop_state: Arc<EstopState>,
    pub stats: Arc<StatsTracker>,
}

pub struct MessageHandler {
    deps: HandlerDeps,
}

impl MessageHandler {
    pub fn new(deps: HandlerDeps) -> Self {
        Self { deps }
    }

    /// Handle one decoded frame. `now_mono` is the monotonic clock in
    /// seconds (for control-age math); `now_wall_ms` is wall time in ms
    /// (for timestamps and latency).
    pub fn handle(&self, payload: Value, now_mono: f64, now_wall_ms: i64) {
        if !payload.is_object() {
            warn!("dropping non-object frame");
            return;
        }

        let kind = payload
            .get("type")
            .or_else(|| payload.get("t"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_lowercase());

        match kind.as_deref() {
            Some("cmd") | Some("ctrl") => self.handle_ctrl(&payload, now_mono, now_wall_ms),
            Some("hb") => {
                self.deps.heartbeat_state.mark_from_ui(now_wall_ms as f64 / 1000.0);
            }
            Some("estop") => {
                self.deps.vehicle.lock().unwrap().estop();
                self.deps.estop_state.trigger();
            }
            _ => warn!(?kind, "ignoring unrecognised frame type"),
        }
    }

    fn handle_ctrl(&self, payload: &Value, now_mono: f64, now_wall_ms: i64) {
        let Some(seq) = payload.get("seq").and_then(|v| v.as_u64()) else {
            warn!("ctrl frame missing integer seq; dropping");
            self.deps.stats.inc_ctrl_drop();
            return;
        };
        let seq = seq as u32;

        let resolved = if let Some(command) = payload.get("command").and_then(|v| v.as_str()) {
            match resolve_preset(command) {
                Some(triple) => Some(triple),
                None => {
                    warn!(command, "unknown command preset; dropping");
                    self.deps.stats.inc_ctrl_drop();
                    return;
                }
            }
        } else {
            let cmd = payload.get("cmd");
            let throttle = cmd
                .and_then(|c| c.get("throttle"))
                .and_then(|v| v.as_f64())
                .unwrap_or(0.0);
            let steer = cmd
                .and_then(|c| c.get("steer"))
                .and_then(|v| v.as_f64())
                .unwrap_or(0.0);
            let brake = cmd
                .and_then(|c| c.get("brake"))
                .and_then(|v| v.as_f64())
                .unwrap_or(0.0);
            Some((
                clamp(throttle, -1.0, 1.0),
                clamp(steer, -1.0, 1.0),
                clamp(brake, 0.0, 1.0),
            ))
        };

        let Some((throttle, steer, brake)) = resolved else {
            return;
        };

        let client_ts_ms = payload
            .get("sent_at_ms")
            .or_else(|| payload.get("ts"))
            .or_else(|| payload.get("t"))
            .and_then(|v| v.as_i64());

        let latency_ms = client_ts_ms.map(|ts| now_wall_ms - ts);

        let snapshot = ControlSnapshot {
            seq,
            throttle,
            steer,
            brake,
            received_at: now_mono,
            client_ts_ms,
            manager_recv_ms: Some(now_wall_ms),
        };

        let accepted =
            self.deps
                .control_state
                .update_if_new(snapshot, latency_ms, now_wall_ms as f64 / 1000.0);

        if accepted {
            self.deps.stats.inc_ctrl_recv();
        } else {
            self.deps.stats.inc_ctrl_drop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn deps() -> HandlerDeps {
        HandlerDeps {
            vehicle: Arc::new(Mutex::new(VehicleModel::new())),
            control_state: Arc::new(ControlState::new()),
            heartbeat_state: Arc::new(HeartbeatState::new()),
            estop_state: Arc::new(EstopState::new()),
            stats: Arc::new(StatsTracker::new()),
        }
    }

    #[test]
    fn test_ctrl_preset_accepted() {
        let deps = deps();
        let handler = MessageHandler::new(deps);
        handler.handle(json!({"type":"ctrl","seq":1,"command":"UP"}), 0.0, 1000);
        let snap = handler.deps.control_state.last().unwrap();
        assert_eq!(snap.seq, 1);
        assert_eq!(snap.throttle, 0.9);
        assert_eq!(handler.deps.stats.snapshot(), (1, 0, 0));
    }

    #[test]
    fn test_ctrl_unknown_preset_dropped() {
        let deps = deps();
        let handler = MessageHandler::new(deps);
        handler.handle(json!({"type":"ctrl","seq":1,"command":"NOPE"}), 0.0, 1000);
        assert!(handler.deps.control_state.last().is_none());
        assert_eq!(handler.deps.stats.snapshot(), (0, 1, 0));
    }

    #[test]
    fn test_ctrl_explicit_command_clamped() {
        let deps = deps();
        let handler = MessageHandler::new(deps);
        handler.handle(
            json!({"type":"ctrl","seq":1,"cmd":{"throttle":5.0,"steer":-9.0,"brake":2.0}}),
            0.0,
            1000,
        );
        let snap = handler.deps.control_state.last().unwrap();
        assert_eq!(snap.throttle, 1.0);
        assert_eq!(snap.steer, -1.0);
        assert_eq!(snap.brake, 1.0);
    }

    #[test]
    fn test_ctrl_missing_seq_dropped() {
        let deps = deps();
        let handler = MessageHandler::new(deps);
        handler.handle(json!({"type":"ctrl","command":"UP"}), 0.0, 1000);
        assert!(handler.deps.control_state.last().is_none());
        assert_eq!(handler.deps.stats.snapshot(), (0, 1, 0));
    }

    #[test]
    fn test_hb_marks_heartbeat() {
        let deps = deps();
        let handler = MessageHandler::new(deps);
        handler.handle(json!({"type":"hb","role":"client"}), 0.0, 5000);
        assert_eq!(handler.deps.heartbeat_state.last_from_ui(), Some(5.0));
    }

    #[test]
    fn test_estop_latches_and_zeroes_vehicle() {
        let deps = deps();
        let handler = MessageHandler::new(deps);
        handler.handle(json!({"type":"ctrl","seq":1,"command":"UP"}), 0.0, 1000);
        let ctrl = handler.deps.control_state.last().unwrap();
        handler.deps.vehicle.lock().unwrap().step(Some(&ctrl), 1.0 / 60.0, 0.1);

        handler.handle(json!({"type":"estop"}), 1.0, 2000);
        assert!(handler.deps.estop_state.is_triggered());
        let snap = handler.deps.vehicle.lock().unwrap().snapshot();
        assert_eq!(snap.vx, 0.0);
        assert_eq!(snap.wz, 0.0);
    }

    #[test]
    fn test_ignores_unknown_type() {
        let deps = deps();
        let handler = MessageHandler::new(deps);
        handler.handle(json!({"type":"whatever"}), 0.0, 0);
        assert_eq!(handler.deps.stats.snapshot(), (0, 0, 0));
    }
}
