//! Control state store, heartbeat/estop latches, and stats counters.
//!
//! Each piece here guards a small amount of state behind its own
//! `std::sync::Mutex`. Critical sections are short and never held across
//! an await point; callers clone out what they need and release the lock.

use std::sync::Mutex;
use std::time::Instant;

use types::ControlSnapshot;

/// The Manager's authoritative preset table. Case-insensitive on lookup.
/// Deliberately not shared with the Bridge's own table (see bridge-control) —
/// the two are allowed to diverge.
pub const PRESETS: &[(&str, (f64, f64, f64))] = &[
    ("IDLE", (0.0, 0.0, 0.4)),
    ("UP", (0.9, 0.0, 0.0)),
    ("DOWN", (-0.5, 0.0, 0.0)),
    ("LEFT", (0.6, -0.7, 0.0)),
    ("RIGHT", (0.6, 0.7, 0.0)),
];

/// Resolve a preset name (case-insensitive) to `(throttle, steer, brake)`.
pub fn resolve_preset(name: &str) -> Option<(f64, f64, f64)> {
    let upper = name.to_uppercase();
    PRESETS
        .iter()
        .find(|(key, _)| *key == upper)
        .map(|(_, triple)| *triple)
}

/// Sequence-deduplicated latest control snapshot plus latency bookkeeping.
pub struct ControlState {
    inner: Mutex<ControlStateInner>,
}

struct ControlStateInner {
    last: Option<ControlSnapshot>,
    last_latency_ms: Option<i64>,
    last_recv_wall: Option<f64>,
}

impl Default for ControlState {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlState {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(ControlStateInner {
                last: None,
                last_latency_ms: None,
                last_recv_wall: None,
            }),
        }
    }

    /// Replace the stored snapshot if `snapshot.seq` is strictly greater
    /// than the current one. Returns `false` (and leaves state untouched)
    /// for an equal-or-lower `seq`.
    pub fn update_if_new(
        &self,
        snapshot: ControlSnapshot,
        latency_ms: Option<i64>,
        recv_wall: f64,
    ) -> bool {
        let mut guard = self.inner.lock().unwrap();
        if let Some(current) = &guard.last {
            if snapshot.seq <= current.seq {
                return false;
            }
        }
        guard.last = Some(snapshot);
        guard.last_latency_ms = latency_ms;
        guard.last_recv_wall = Some(recv_wall);
        true
    }

    pub fn last(&self) -> Option<ControlSnapshot> {
        self.inner.lock().unwrap().last
    }

    pub fn last_latency_ms(&self) -> Option<i64> {
        self.inner.lock().unwrap().last_latency_ms
    }

    pub fn last_recv_wall(&self) -> Option<f64> {
        self.inner.lock().unwrap().last_recv_wall
    }
}

/// Tracks the last heartbeat seen from the UI side.
#[derive(Default)]
pub struct HeartbeatState {
    last_from_ui: Mutex<Option<f64>>,
}

impl HeartbeatState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_from_ui(&self, wall_now: f64) {
        *self.last_from_ui.lock().unwrap() = Some(wall_now);
    }

    pub fn last_from_ui(&self) -> Option<f64> {
        *self.last_from_ui.lock().unwrap()
    }
}

/// Latching emergency-stop flag. Cleared only by process restart in
/// normal operation, but `clear` exists for test harnesses.
#[derive(Default)]
pub struct EstopState {
    triggered: Mutex<bool>,
}

impl EstopState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        *self.triggered.lock().unwrap() = true;
    }

    pub fn clear(&self) {
        *self.triggered.lock().unwrap() = false;
    }

    pub fn is_triggered(&self) -> bool {
        *self.triggered.lock().unwrap()
    }
}

/// Counters for the 5s stats loop.
#[derive(Default)]
pub struct StatsTracker {
    ctrl_recv: Mutex<u64>,
    ctrl_drop: Mutex<u64>,
    state_sent: Mutex<u64>,
}

impl StatsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_ctrl_recv(&self) {
        *self.ctrl_recv.lock().unwrap() += 1;
    }

    pub fn inc_ctrl_drop(&self) {
        *self.ctrl_drop.lock().unwrap() += 1;
    }

    pub fn inc_state_sent(&self) {
        *self.state_sent.lock().unwrap() += 1;
    }

    pub fn snapshot(&self) -> (u64, u64, u64) {
        (
            *self.ctrl_recv.lock().unwrap(),
            *self.ctrl_drop.lock().unwrap(),
            *self.state_sent.lock().unwrap(),
        )
    }
}

/// Monotonic clock helper shared by loops that need a `f64` seconds
/// timebase (the vehicle model and control-age math work in f64 seconds,
/// not `Instant`/`Duration`).
pub fn monotonic_seconds(epoch: Instant) -> f64 {
    epoch.elapsed().as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(seq: u32) -> ControlSnapshot {
        ControlSnapshot {
            seq,
            throttle: 0.1,
            steer: 0.0,
            brake: 0.0,
            received_at: 0.0,
            client_ts_ms: None,
            manager_recv_ms: None,
        }
    }

    #[test]
    fn test_resolve_preset_case_insensitive() {
        assert_eq!(resolve_preset("up"), Some((0.9, 0.0, 0.0)));
        assert_eq!(resolve_preset("Up"), Some((0.9, 0.0, 0.0)));
        assert_eq!(resolve_preset("nope"), None);
    }

    #[test]
    fn test_control_state_dedup() {
        let store = ControlState::new();
        assert!(store.update_if_new(snap(1), None, 0.0));
        assert!(!store.update_if_new(snap(1), None, 1.0));
        assert!(!store.update_if_new(snap(0), None, 1.0));
        assert!(store.update_if_new(snap(2), Some(10), 2.0));
        assert_eq!(store.last().unwrap().seq, 2);
        assert_eq!(store.last_latency_ms(), Some(10));
    }

    #[test]
    fn test_heartbeat_state() {
        let hb = HeartbeatState::new();
        assert_eq!(hb.last_from_ui(), None);
        hb.mark_from_ui(42.0);
        assert_eq!(hb.last_from_ui(), Some(42.0));
    }

    #[test]
    fn test_estop_state_latches() {
        let estop = EstopState::new();
        assert!(!estop.is_triggered());
        estop.trigger();
        assert!(estop.is_triggered());
        estop.clear();
        assert!(!estop.is_triggered());
    }

    #[test]
    fn test_stats_tracker() {
        let stats = StatsTracker::new();
        stats.inc_ctrl_recv();
        stats.inc_ctrl_recv();
        stats.inc_ctrl_drop();
        stats.inc_state_sent();
        assert_eq!(stats.snapshot(), (2, 1, 1));
    }
}
