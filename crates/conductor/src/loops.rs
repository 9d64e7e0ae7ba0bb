//! Fixed-rate loops (C8): physics, state publication, heartbeat, stats.
//!
//! Each loop owns its own `tokio::time::interval` (or poll cadence) and
//! runs until `stop` fires. None of them hold a lock across an await point.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use manager_control::{monotonic_seconds, ControlState, EstopState, HeartbeatState, StatsTracker};
use payload::{CtrlContext, StatePayloadBuilder};
use tokio::sync::Notify;
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};
use transport::connection::ConnectionManager;
use types::{CommandTriple, HeartbeatFrame, DEFAULT_MODE};
use vehicle::{VehicleModel, PHYSICS_RATE_HZ};

const HEARTBEAT_POLL: Duration = Duration::from_millis(100);
const HEARTBEAT_SEC: f64 = 1.0;
const HEARTBEAT_IDLE_SEC: f64 = 5.0;
const STATS_INTERVAL: Duration = Duration::from_secs(5);
const STATE_RATE_HZ: f64 = 30.0;

/// Advance the vehicle model at `PHYSICS_RATE_HZ`, always, regardless of
/// connection state: the model keeps decaying/coasting even while nobody
/// is listening.
pub async fn physics_loop(
    epoch: Instant,
    vehicle: Arc<Mutex<VehicleModel>>,
    control_state: Arc<ControlState>,
    stop: Arc<Notify>,
) {
    let mut tick = interval(Duration::from_secs_f64(1.0 / PHYSICS_RATE_HZ));
    let mut last = monotonic_seconds(epoch);
    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = stop.notified() => return,
        }
        let now = monotonic_seconds(epoch);
        let dt = (now - last).max(0.0);
        last = now;

        let ctrl = control_state.last();
        vehicle.lock().unwrap().step(ctrl.as_ref(), dt, now);
    }
}

/// Publish state at up to `STATE_RATE_HZ`, gated on the relay being
/// connected and the state label being ready; idle-coalesced by the
/// payload builder itself.
#[allow(clippy::too_many_arguments)]
pub async fn state_loop(
    epoch: Instant,
    vehicle: Arc<Mutex<VehicleModel>>,
    control_state: Arc<ControlState>,
    heartbeat_state: Arc<HeartbeatState>,
    estop_state: Arc<EstopState>,
    stats: Arc<StatsTracker>,
    builder: Arc<Mutex<StatePayloadBuilder>>,
    connection: Arc<ConnectionManager>,
    state_label: String,
    state_log: Option<Arc<crate::conductor::StateLogSink>>,
    stop: Arc<Notify>,
) {
    let mut tick = interval(Duration::from_secs_f64(1.0 / STATE_RATE_HZ));
    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = stop.notified() => return,
        }

        if !connection.is_connected() {
            continue;
        }

        let now_mono = monotonic_seconds(epoch);
        let now_wall = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);

        let snapshot = vehicle.lock().unwrap().snapshot();
        let hb_age = heartbeat_state.last_from_ui().map(|t| (now_wall - t).max(0.0));
        let estop_latched = estop_state.is_triggered();

        let ctrl_ctx = control_state.last().map(|c| CtrlContext {
            seq: c.seq,
            mode: DEFAULT_MODE,
            command: CommandTriple {
                throttle: c.throttle,
                steer: c.steer,
                brake: c.brake,
            },
            sent_at_ms: c.client_ts_ms,
            manager_recv_at_ms: c.manager_recv_ms,
            latency_ms: control_state.last_latency_ms(),
        });

        let payload = builder
            .lock()
            .unwrap()
            .build(snapshot, ctrl_ctx, hb_age, estop_latched, now_wall);

        let Some(payload) = payload else {
            continue;
        };

        let Ok(encoded) = serde_json::to_vec(&payload) else {
            warn!("failed to encode state payload");
            continue;
        };

        if connection.send_data(&state_label, &encoded) {
            stats.inc_state_sent();
            if let Some(sink) = &state_log {
                sink.write(&encoded, now_mono).await;
            }
        } else {
            debug!("state send dropped, channel not ready");
        }
    }
}

/// Send server heartbeats at `HEARTBEAT_SEC` while control input is fresh,
/// backing off to `HEARTBEAT_IDLE_SEC` once the vehicle has been coasting
/// for a while; the heartbeat itself never stops regardless of connection
/// state, only its rate changes.
pub async fn heartbeat_loop(
    vehicle: Arc<Mutex<VehicleModel>>,
    connection: Arc<ConnectionManager>,
    state_label: String,
    stop: Arc<Notify>,
) {
    let mut last_sent = Instant::now() - Duration::from_secs(60);
    loop {
        tokio::select! {
            _ = tokio::time::sleep(HEARTBEAT_POLL) => {}
            _ = stop.notified() => return,
        }

        let ctrl_age = vehicle.lock().unwrap().snapshot().last_ctrl_age;
        let interval_sec = if ctrl_age.is_finite() && ctrl_age <= vehicle::CTRL_HOLD_SEC + vehicle::CTRL_DAMP_SEC
        {
            HEARTBEAT_SEC
        } else {
            HEARTBEAT_IDLE_SEC
        };

        if last_sent.elapsed().as_secs_f64() < interval_sec {
            continue;
        }
        last_sent = Instant::now();

        if !connection.is_connected() {
            continue;
        }

        let now_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        let frame = HeartbeatFrame::server(now_ms, state_label.clone());
        if let Ok(encoded) = serde_json::to_vec(&frame) {
            connection.send_data(&state_label, &encoded);
        }
    }
}

/// Log the running counters every `STATS_INTERVAL`. Never resets them;
/// the counters are lifetime totals for the process.
pub async fn stats_loop(stats: Arc<StatsTracker>, stop: Arc<Notify>) {
    let mut tick = interval(STATS_INTERVAL);
    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = stop.notified() => return,
        }
        let (ctrl_recv, ctrl_drop, state_sent) = stats.snapshot();
        info!(ctrl_recv, ctrl_drop, state_sent, "stats");
    }
}
