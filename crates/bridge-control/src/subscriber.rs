//! Command Subscriber (C12).
//!
//! Owns `last_seq`/`last_publish_wall`, drives the Converter and the
//! Velocity Sink, and runs a ~10 Hz watchdog that forces zero output
//! once fresh commands stop arriving.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::converter::{Converter, RawIntent};
use crate::sink::VelocitySink;

const WATCHDOG_POLL: Duration = Duration::from_millis(100);

/// Packs `last_seq` (u32) with a "has ever seen a seq" flag into one
/// atomic so the watchdog and the subscriber never race on initial state.
struct SeqState {
    last_seq: Mutex<Option<u32>>,
}

pub struct CommandSubscriber {
    converter: Converter,
    sink: Arc<dyn VelocitySink>,
    estop_active: Arc<AtomicBool>,
    seq: SeqState,
    last_publish_wall_ms: AtomicU64,
    command_timeout_sec: f64,
    stop: Arc<Notify>,
}

impl CommandSubscriber {
    pub fn new(
        converter: Converter,
        sink: Arc<dyn VelocitySink>,
        estop_active: Arc<AtomicBool>,
        command_timeout_sec: f64,
    ) -> Self {
        Self {
            converter,
            sink,
            estop_active,
            seq: SeqState {
                last_seq: Mutex::new(None),
            },
            last_publish_wall_ms: AtomicU64::new(0),
            command_timeout_sec,
            stop: Arc::new(Notify::new()),
        }
    }

    /// Handle one decoded direct ctrl payload (top-level `seq`/`command`/
    /// `cmd`, received straight off a ctrl-label transport). `now_wall_ms`
    /// is wall time in milliseconds.
    pub fn process_ctrl_payload(&self, payload: &Value, now_wall_ms: i64) {
        let Some(seq) = payload.get("seq").and_then(|v| v.as_u64()).map(|s| s as u32) else {
            warn!("ctrl payload missing integer seq; dropping");
            return;
        };

        let mut guard = self.seq.last_seq.lock().unwrap();
        let is_new = match *guard {
            Some(last) => seq > last,
            None => true,
        };

        // Refresh the watchdog stamp even on a duplicate seq: it reflects
        // ongoing liveness regardless of whether new motion was commanded.
        self.last_publish_wall_ms
            .store(now_wall_ms.max(0) as u64, Ordering::SeqCst);

        if !is_new {
            debug!(seq, "duplicate or stale seq, watchdog refreshed only");
            return;
        }
        *guard = Some(seq);
        drop(guard);

        let command = payload.get("command").and_then(|v| v.as_str());
        let cmd = payload.get("cmd");
        let intent = RawIntent {
            throttle: cmd.and_then(|c| c.get("throttle")).and_then(|v| v.as_f64()).unwrap_or(0.0),
            steer: cmd.and_then(|c| c.get("steer")).and_then(|v| v.as_f64()).unwrap_or(0.0),
            brake: cmd.and_then(|c| c.get("brake")).and_then(|v| v.as_f64()).unwrap_or(0.0),
        };

        let Some(resolved) = self.converter.resolve(command, intent) else {
            warn!(?command, "unknown command preset; dropping");
            return;
        };

        let estop = self.estop_active.load(Ordering::SeqCst);
        let (linear, angular) = self.converter.to_velocity(resolved, estop);
        self.sink.publish(linear, angular);
    }

    /// Handle one decoded Manager `state` payload received over the state
    /// channel: the relayed path, driven by `last_ctrl.seq`/`last_ctrl.command`
    /// rather than a direct top-level ctrl frame. Estop gating comes from
    /// `status.estop`/`status.ok` since no standalone estop frame can ever
    /// reach the Bridge past the transport's ctrl-only frame filter.
    pub fn process_state_payload(&self, payload: &Value, now_wall_ms: i64) {
        let status = payload.get("status");
        let estop_active = status
            .and_then(|s| s.get("estop"))
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
            || !status
                .and_then(|s| s.get("ok"))
                .and_then(|v| v.as_bool())
                .unwrap_or(true);
        self.estop_active.store(estop_active, Ordering::SeqCst);
        if estop_active {
            warn!("estop active in relayed state -> forcing cmd_vel=0");
        }

        let Some(last_ctrl) = payload.get("last_ctrl").filter(|v| v.is_object()) else {
            return;
        };
        let Some(seq) = last_ctrl.get("seq").and_then(|v| v.as_u64()).map(|s| s as u32) else {
            return;
        };

        let mut guard = self.seq.last_seq.lock().unwrap();
        let is_new = match *guard {
            Some(last) => seq > last,
            None => true,
        };

        self.last_publish_wall_ms
            .store(now_wall_ms.max(0) as u64, Ordering::SeqCst);

        if !is_new {
            debug!(seq, "duplicate relayed seq, watchdog refreshed only");
            return;
        }
        *guard = Some(seq);
        drop(guard);

        let command = last_ctrl.get("command");
        let intent = RawIntent {
            throttle: command.and_then(|c| c.get("throttle")).and_then(|v| v.as_f64()).unwrap_or(0.0),
            steer: command.and_then(|c| c.get("steer")).and_then(|v| v.as_f64()).unwrap_or(0.0),
            brake: command.and_then(|c| c.get("brake")).and_then(|v| v.as_f64()).unwrap_or(0.0),
        };
        let Some(resolved) = self.converter.resolve(None, intent) else {
            return;
        };

        let (linear, angular) = self.converter.to_velocity(resolved, estop_active);
        self.sink.publish(linear, angular);
    }

    /// Run the watchdog until signalled to stop. Intended to be spawned.
    pub async fn run_watchdog(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(WATCHDOG_POLL) => {}
                _ = self.stop.notified() => return,
            }
            self.watchdog_tick(now_ms());
        }
    }

    fn watchdog_tick(&self, now_wall_ms: i64) {
        if self.command_timeout_sec <= 0.0 {
            return;
        }
        let last = self.last_publish_wall_ms.load(Ordering::SeqCst);
        if last == 0 {
            return;
        }
        let elapsed_sec = (now_wall_ms.max(0) as u64).saturating_sub(last) as f64 / 1000.0;
        if elapsed_sec >= self.command_timeout_sec {
            self.sink.publish_zero();
            self.last_publish_wall_ms.store(0, Ordering::SeqCst);
        }
    }

    pub fn shutdown_watchdog(&self) {
        self.stop.notify_waiters();
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::converter::ConverterConfig;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    struct RecordingSink {
        calls: StdMutex<Vec<(f64, f64)>>,
    }

    impl RecordingSink {
        fn new() -> Self {
            Self {
                calls: StdMutex::new(Vec::new()),
            }
        }
    }

    impl VelocitySink for RecordingSink {
        fn start(&self) {}
        fn publish(&self, linear: f64, angular: f64) {
            self.calls.lock().unwrap().push((linear, angular));
        }
        fn stop(&self) {}
    }

    fn subscriber(sink: Arc<RecordingSink>, timeout: f64) -> CommandSubscriber {
        CommandSubscriber::new(
            Converter::new(ConverterConfig {
                max_linear_speed: 1.0,
                max_angular_speed: 1.0,
                brake_threshold: 0.1,
            }),
            sink,
            Arc::new(AtomicBool::new(false)),
            timeout,
        )
    }

    #[test]
    fn test_new_seq_publishes() {
        let sink = Arc::new(RecordingSink::new());
        let sub = subscriber(sink.clone(), 0.0);
        sub.process_ctrl_payload(&json!({"seq": 1, "command": "UP"}), 1000);
        assert_eq!(sink.calls.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_duplicate_seq_does_not_republish() {
        let sink = Arc::new(RecordingSink::new());
        let sub = subscriber(sink.clone(), 0.0);
        sub.process_ctrl_payload(&json!({"seq": 1, "command": "UP"}), 1000);
        sub.process_ctrl_payload(&json!({"seq": 1, "command": "UP"}), 1100);
        assert_eq!(sink.calls.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_duplicate_seq_still_refreshes_watchdog() {
        let sink = Arc::new(RecordingSink::new());
        let sub = subscriber(sink.clone(), 1.0);
        sub.process_ctrl_payload(&json!({"seq": 1, "command": "UP"}), 1000);
        sub.process_ctrl_payload(&json!({"seq": 1, "command": "UP"}), 1900);
        // Watchdog stamp was refreshed at t=1900; a tick at t=2200 (300ms
        // later) must not yet fire the 1s timeout.
        sub.watchdog_tick(2200);
        assert_eq!(sink.calls.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_watchdog_zeroes_after_timeout_then_stays_quiet() {
        let sink = Arc::new(RecordingSink::new());
        let sub = subscriber(sink.clone(), 0.5);
        sub.process_ctrl_payload(&json!({"seq": 1, "command": "UP"}), 1000);
        sub.watchdog_tick(1600);
        assert_eq!(sink.calls.lock().unwrap().len(), 2, "publish + watchdog zero");
        assert_eq!(*sink.calls.lock().unwrap().last().unwrap(), (0.0, 0.0));

        sub.watchdog_tick(2600);
        assert_eq!(
            sink.calls.lock().unwrap().len(),
            2,
            "watchdog must not republish zero repeatedly"
        );
    }

    #[test]
    fn test_relayed_state_payload_publishes_from_last_ctrl() {
        let sink = Arc::new(RecordingSink::new());
        let sub = subscriber(sink.clone(), 0.0);
        sub.process_state_payload(
            &json!({
                "type": "state",
                "last_ctrl": {"seq": 1, "command": {"throttle": 1.0, "steer": 0.0, "brake": 0.0}},
                "status": {"ok": true},
            }),
            1000,
        );
        assert_eq!(*sink.calls.lock().unwrap().last().unwrap(), (1.0, 0.0));
    }

    #[test]
    fn test_relayed_state_payload_duplicate_seq_does_not_republish() {
        let sink = Arc::new(RecordingSink::new());
        let sub = subscriber(sink.clone(), 0.0);
        let state = json!({
            "last_ctrl": {"seq": 1, "command": {"throttle": 1.0, "steer": 0.0, "brake": 0.0}},
            "status": {"ok": true},
        });
        sub.process_state_payload(&state, 1000);
        sub.process_state_payload(&state, 1100);
        assert_eq!(sink.calls.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_relayed_state_payload_estop_status_zeroes_and_latches() {
        let sink = Arc::new(RecordingSink::new());
        let sub = subscriber(sink.clone(), 0.0);
        sub.process_state_payload(
            &json!({
                "last_ctrl": {"seq": 1, "command": {"throttle": 1.0, "steer": 0.0, "brake": 0.0}},
                "status": {"ok": true, "estop": true},
            }),
            1000,
        );
        assert!(sub.estop_active.load(Ordering::SeqCst));
        assert_eq!(*sink.calls.lock().unwrap().last().unwrap(), (0.0, 0.0));
    }

    #[test]
    fn test_relayed_state_payload_not_ok_implies_estop() {
        let sink = Arc::new(RecordingSink::new());
        let sub = subscriber(sink.clone(), 0.0);
        sub.process_state_payload(
            &json!({
                "last_ctrl": {"seq": 1, "command": {"throttle": 1.0, "steer": 0.0, "brake": 0.0}},
                "status": {"ok": false},
            }),
            1000,
        );
        assert_eq!(*sink.calls.lock().unwrap().last().unwrap(), (0.0, 0.0));
    }

    #[test]
    fn test_relayed_state_payload_missing_last_ctrl_is_ignored() {
        let sink = Arc::new(RecordingSink::new());
        let sub = subscriber(sink.clone(), 0.0);
        sub.process_state_payload(&json!({"status": {"ok": true}}), 1000);
        assert!(sink.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_unknown_preset_drops_without_publish() {
        let sink = Arc::new(RecordingSink::new());
        let sub = subscriber(sink.clone(), 0.0);
        sub.process_ctrl_payload(&json!({"seq": 1, "command": "NOPE"}), 1000);
        assert!(sink.calls.lock().unwrap().is_empty());
    }
}
