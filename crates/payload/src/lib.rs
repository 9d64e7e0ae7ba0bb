//! State payload builder.
//!
//! Turns a vehicle snapshot plus ambient liveness info into the wire
//! `StatePayload`, applying idle coalescing so a quiet session doesn't
//! spam subscribers at the full state rate.

use types::{
    CommandTriple, LastCtrlBlock, StatePayload, StatusBlock, StepInfo, TimelineBlock, WirePose,
    WireVelocity,
};
use vehicle::VehicleSnapshot;

/// Once control input has been stale this long, the publisher coalesces
/// state sends down to at most one every `IDLE_STATE_INTERVAL_SEC`.
pub const IDLE_STATE_INTERVAL_SEC: f64 = 5.0;
/// Heartbeat age past which status degrades to `ok=false`.
pub const HEARTBEAT_IDLE_SEC: f64 = 5.0;

const SEQ_WRAP: u32 = 1 << 31;

/// Everything the builder needs about the current control snapshot, kept
/// separate from `types::ControlSnapshot` so the builder doesn't need to
/// reach across a second lock to learn mode/latency.
#[derive(Debug, Clone, Copy)]
pub struct CtrlContext {
    pub seq: u32,
    pub mode: &'static str,
    pub command: CommandTriple,
    pub sent_at_ms: Option<i64>,
    pub manager_recv_at_ms: Option<i64>,
    pub latency_ms: Option<i64>,
}

#[derive(Default)]
pub struct StatePayloadBuilder {
    state_seq: u32,
    last_idle_emit: Option<f64>,
    last_timeline_seq: Option<u32>,
}

impl StatePayloadBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset sequencing so a fresh session starts at `state_seq = 1`.
    pub fn reset(&mut self) {
        self.state_seq = 0;
        self.last_idle_emit = None;
        self.last_timeline_seq = None;
    }

    fn next_state_seq(&mut self) -> u32 {
        self.state_seq = (self.state_seq + 1) % SEQ_WRAP;
        self.state_seq
    }

    /// Build the next payload, or `None` if this tick is coalesced away.
    #[allow(clippy::too_many_arguments)]
    pub fn build(
        &mut self,
        vehicle: VehicleSnapshot,
        ctrl: Option<CtrlContext>,
        hb_age: Option<f64>,
        estop_latched: bool,
        now_wall: f64,
    ) -> Option<StatePayload> {
        let ctrl_age = vehicle.last_ctrl_age;
        let idle = ctrl_age > IDLE_STATE_INTERVAL_SEC;

        if idle {
            if let Some(last_emit) = self.last_idle_emit {
                if now_wall - last_emit < IDLE_STATE_INTERVAL_SEC {
                    return None;
                }
            }
        }
        self.last_idle_emit = Some(now_wall);

        let mut status = StatusBlock {
            ok: true,
            msg: "ok".to_string(),
            hb_age_ms: hb_age.map(|a| (a * 1000.0) as i64),
            ctrl_latency_ms: ctrl.and_then(|c| c.latency_ms),
            estop: None,
        };

        if let Some(age) = hb_age {
            if age > HEARTBEAT_IDLE_SEC {
                status.ok = false;
                status.msg = format!("hb age {age:.1}s");
            }
        }

        if vehicle.estop_active || estop_latched {
            status.ok = false;
            status.msg = "estop".to_string();
            status.estop = Some(true);
        }

        let payload = StatePayload {
            kind: "state".to_string(),
            seq: self.next_state_seq(),
            sent_at_ms: (now_wall * 1000.0) as i64,
            pose: WirePose {
                x: vehicle.x,
                y: vehicle.z,
                heading: vehicle.yaw,
            },
            velocity: WireVelocity {
                linear: vehicle.vx,
                angular: vehicle.wz,
            },
            status,
            step: StepInfo {
                dt_sec: vehicle.last_dt,
            },
            last_ctrl: ctrl.map(|c| LastCtrlBlock {
                seq: c.seq,
                mode: c.mode.to_string(),
                command: c.command,
                sent_at_ms: c.sent_at_ms,
                manager_recv_at_ms: c.manager_recv_at_ms,
                latency_ms: c.latency_ms,
            }),
            timeline: ctrl.and_then(|c| {
                let seen = self.last_timeline_seq == Some(c.seq);
                if seen {
                    None
                } else {
                    self.last_timeline_seq = Some(c.seq);
                    Some(TimelineBlock {
                        seq: c.seq,
                        ui_sent: c.sent_at_ms,
                        mgr_recv: c.manager_recv_at_ms,
                    })
                }
            }),
        };

        Some(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vehicle_snapshot(ctrl_age: f64) -> VehicleSnapshot {
        VehicleSnapshot {
            x: 1.0,
            y: 0.0,
            z: 2.0,
            yaw: 0.1,
            vx: 0.3,
            wz: 0.0,
            last_dt: 1.0 / 60.0,
            last_ctrl_age: ctrl_age,
            estop_active: false,
        }
    }

    #[test]
    fn test_builds_active_payload() {
        let mut builder = StatePayloadBuilder::new();
        let payload = builder
            .build(vehicle_snapshot(0.1), None, Some(0.1), false, 100.0)
            .unwrap();
        assert_eq!(payload.seq, 1);
        assert_eq!(payload.pose.x, 1.0);
        assert_eq!(payload.pose.y, 2.0, "wire y must be world z");
        assert!(payload.status.ok);
    }

    #[test]
    fn test_idle_coalescing_skips_ticks() {
        let mut builder = StatePayloadBuilder::new();
        // First idle tick always emits (no prior idle emit recorded).
        assert!(builder
            .build(vehicle_snapshot(10.0), None, None, false, 0.0)
            .is_some());
        // Immediately after, still within the coalescing window.
        assert!(builder
            .build(vehicle_snapshot(10.0), None, None, false, 1.0)
            .is_none());
        // Past the window, emits again.
        assert!(builder
            .build(vehicle_snapshot(10.0), None, None, false, 5.1)
            .is_some());
    }

    #[test]
    fn test_estop_degrades_status() {
        let mut builder = StatePayloadBuilder::new();
        let mut snap = vehicle_snapshot(0.1);
        snap.estop_active = true;
        let payload = builder.build(snap, None, None, false, 0.0).unwrap();
        assert!(!payload.status.ok);
        assert_eq!(payload.status.estop, Some(true));
    }

    #[test]
    fn test_heartbeat_starvation_degrades_status() {
        let mut builder = StatePayloadBuilder::new();
        let payload = builder
            .build(vehicle_snapshot(0.1), None, Some(6.0), false, 0.0)
            .unwrap();
        assert!(!payload.status.ok);
        assert!(payload.status.msg.contains("hb age"));
    }

    #[test]
    fn test_timeline_emitted_once_per_seq() {
        let mut builder = StatePayloadBuilder::new();
        let ctx = CtrlContext {
            seq: 5,
            mode: "arcade",
            command: CommandTriple {
                throttle: 0.1,
                steer: 0.0,
                brake: 0.0,
            },
            sent_at_ms: Some(1),
            manager_recv_at_ms: Some(2),
            latency_ms: Some(1),
        };
        let p1 = builder
            .build(vehicle_snapshot(0.0), Some(ctx), None, false, 0.0)
            .unwrap();
        assert!(p1.timeline.is_some());
        let p2 = builder
            .build(vehicle_snapshot(0.0), Some(ctx), None, false, 0.1)
            .unwrap();
        assert!(p2.timeline.is_none());
    }

    #[test]
    fn test_state_seq_wraps() {
        let mut builder = StatePayloadBuilder::new();
        builder.state_seq = SEQ_WRAP - 1;
        let payload = builder
            .build(vehicle_snapshot(0.0), None, None, false, 0.0)
            .unwrap();
        assert_eq!(payload.seq, 0);
    }
}
