//! Velocity Sink adapter (C11).
//!
//! A trait over the guarded publish lifecycle, with a logging default
//! suitable for bench testing and a ROS-handle-shaped adapter for the
//! real motion stack. The ROS runtime itself is an external collaborator;
//! `RosCmdVelSink` only models the guarded handle lifecycle around it.

use std::sync::Mutex;

use tracing::{debug, info, warn};

pub trait VelocitySink: Send + Sync {
    /// Idempotent bring-up; safe to call repeatedly.
    fn start(&self);
    /// No-op if not started.
    fn publish(&self, linear: f64, angular: f64);
    fn publish_zero(&self) {
        self.publish(0.0, 0.0);
    }
    /// Idempotent teardown; safe to call repeatedly, including before `start`.
    fn stop(&self);
}

/// Default sink: logs every publish at DEBUG, always considered started.
#[derive(Default)]
pub struct LoggingVelocitySink {
    started: Mutex<bool>,
}

impl LoggingVelocitySink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl VelocitySink for LoggingVelocitySink {
    fn start(&self) {
        *self.started.lock().unwrap() = true;
        debug!("logging velocity sink started");
    }

    fn publish(&self, linear: f64, angular: f64) {
        if !*self.started.lock().unwrap() {
            return;
        }
        debug!(linear, angular, "cmd_vel (logging sink)");
    }

    fn stop(&self) {
        *self.started.lock().unwrap() = false;
        debug!("logging velocity sink stopped");
    }
}

/// Placeholder for a real `cmd_vel`-style handle to an external motion
/// stack; a genuine implementation would hold a publisher handle here.
pub struct RosNodeHandle {
    pub topic: String,
}

/// Models the guarded lifecycle of an external ROS node handle: `start()`
/// sets the handle, `stop()` clears it, and "handle absent" is the no-op
/// condition `publish()` checks for.
pub struct RosCmdVelSink {
    topic: String,
    handle: Mutex<Option<RosNodeHandle>>,
}

impl RosCmdVelSink {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            handle: Mutex::new(None),
        }
    }
}

impl VelocitySink for RosCmdVelSink {
    fn start(&self) {
        let mut guard = self.handle.lock().unwrap();
        if guard.is_some() {
            return;
        }
        info!(topic = %self.topic, "ros cmd_vel sink started");
        *guard = Some(RosNodeHandle {
            topic: self.topic.clone(),
        });
    }

    fn publish(&self, linear: f64, angular: f64) {
        let guard = self.handle.lock().unwrap();
        let Some(handle) = guard.as_ref() else {
            warn!("ros cmd_vel publish dropped, sink not started");
            return;
        };
        debug!(topic = %handle.topic, linear, angular, "cmd_vel publish");
    }

    fn stop(&self) {
        let mut guard = self.handle.lock().unwrap();
        if guard.take().is_some() {
            info!(topic = %self.topic, "ros cmd_vel sink stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logging_sink_requires_start() {
        let sink = LoggingVelocitySink::new();
        sink.publish(1.0, 0.0);
        sink.start();
        sink.publish(1.0, 0.0);
        sink.stop();
    }

    #[test]
    fn test_ros_sink_publish_noop_before_start() {
        let sink = RosCmdVelSink::new("/cmd_vel");
        sink.publish(1.0, 0.0);
        sink.start();
        sink.start();
        sink.publish(1.0, 0.0);
        sink.stop();
        sink.stop();
    }
}
