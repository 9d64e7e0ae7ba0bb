//! Planar vehicle model.
//!
//! A single rigid body integrated at a fixed physics rate from a (possibly
//! stale) control snapshot. The model lives in a 3D frame where `z` is
//! forward and `x` is lateral, `y` pinned at zero; callers needing a wire
//! projection do that mapping themselves (see the `payload` crate).

use types::{clamp, wrap_angle, ControlSnapshot};

pub const MAX_SPEED: f64 = 20.0;
pub const MAX_ACCEL: f64 = 9.0;
pub const BRAKE_DECEL: f64 = 14.0;
pub const COAST_DECEL: f64 = 2.0;
pub const IDLE_DECEL: f64 = 1.5;
pub const YAW_RATE_MAX: f64 = 2.5;
pub const YAW_SLEW: f64 = 6.0;
pub const ANGULAR_DAMP: f64 = 4.0;
pub const PHYSICS_RATE_HZ: f64 = 60.0;

/// How long a control snapshot is honoured at full strength before it
/// starts decaying toward zero.
pub const CTRL_HOLD_SEC: f64 = 0.2;
/// Time over which a stale control snapshot decays fully to zero.
pub const CTRL_DAMP_SEC: f64 = 1.0;

const ZERO_EPS: f64 = 1e-3;

/// A consistent read of the vehicle's pose/velocity/timing, safe to copy
/// out from under the vehicle lock.
#[derive(Debug, Clone, Copy, Default)]
pub struct VehicleSnapshot {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub yaw: f64,
    pub vx: f64,
    pub wz: f64,
    pub last_dt: f64,
    pub last_ctrl_age: f64,
    pub estop_active: bool,
}

/// Owns the vehicle's pose and velocity. Mutated only by `step`, `estop`,
/// and `clear_estop`; every other access goes through `snapshot()`.
#[derive(Debug, Clone)]
pub struct VehicleModel {
    x: f64,
    y: f64,
    z: f64,
    yaw: f64,
    vx: f64,
    wz: f64,
    last_dt: f64,
    last_ctrl_age: f64,
    estop_active: bool,
}

impl Default for VehicleModel {
    fn default() -> Self {
        Self::new()
    }
}

impl VehicleModel {
    pub fn new() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            z: 0.0,
            yaw: 0.0,
            vx: 0.0,
            wz: 0.0,
            last_dt: 1.0 / PHYSICS_RATE_HZ,
            last_ctrl_age: f64::INFINITY,
            estop_active: false,
        }
    }

    pub fn snapshot(&self) -> VehicleSnapshot {
        VehicleSnapshot {
            x: self.x,
            y: self.y,
            z: self.z,
            yaw: self.yaw,
            vx: self.vx,
            wz: self.wz,
            last_dt: self.last_dt,
            last_ctrl_age: self.last_ctrl_age,
            estop_active: self.estop_active,
        }
    }

    pub fn estop_active(&self) -> bool {
        self.estop_active
    }

    /// Latch the emergency stop and zero velocity immediately.
    pub fn estop(&mut self) {
        self.estop_active = true;
        self.vx = 0.0;
        self.wz = 0.0;
    }

    /// Clear the latch. Motion does not resume on its own; a fresh control
    /// snapshot is still required.
    pub fn clear_estop(&mut self) {
        self.estop_active = false;
    }

    /// Advance the model by `dt` seconds, optionally steered by `ctrl`
    /// evaluated at monotonic instant `now_mono`.
    pub fn step(&mut self, ctrl: Option<&ControlSnapshot>, dt: f64, now_mono: f64) {
        self.last_dt = dt;

        let (mut throttle, mut steer, mut brake, age) = match ctrl {
            None => (0.0, 0.0, 0.0, f64::INFINITY),
            Some(c) => {
                let age = (now_mono - c.received_at).max(0.0);
                if age <= CTRL_HOLD_SEC {
                    (c.throttle, c.steer, c.brake, age)
                } else {
                    let decay = clamp((age - CTRL_HOLD_SEC) / CTRL_DAMP_SEC, 0.0, 1.0);
                    let scale = 1.0 - decay;
                    (c.throttle * scale, c.steer * scale, c.brake.max(decay), age)
                }
            }
        };
        self.last_ctrl_age = age;

        if self.estop_active {
            throttle = 0.0;
            brake = 1.0;
        }

        self.step_forward(throttle, brake, ctrl.is_some(), dt);
        self.step_angular(steer, ctrl.is_some(), dt);
        self.integrate_pose(dt);
    }

    fn step_forward(&mut self, throttle: f64, brake: f64, has_ctrl: bool, dt: f64) {
        let mut accel = throttle * MAX_ACCEL;

        if throttle.abs() < ZERO_EPS {
            if self.vx.abs() > ZERO_EPS {
                accel -= self.vx.signum() * COAST_DECEL;
            } else {
                accel = 0.0;
            }
        }

        if brake > 0.0 && self.vx.abs() > ZERO_EPS {
            accel -= self.vx.signum() * BRAKE_DECEL * brake;
        }

        if !has_ctrl && !self.estop_active && self.vx.abs() > ZERO_EPS {
            accel -= self.vx.signum() * IDLE_DECEL;
        }

        self.vx = clamp(self.vx + accel * dt, -MAX_SPEED, MAX_SPEED);
        if self.vx.abs() < ZERO_EPS {
            self.vx = 0.0;
        }
    }

    fn step_angular(&mut self, steer: f64, has_ctrl: bool, dt: f64) {
        let target_wz = steer * YAW_RATE_MAX;

        if has_ctrl {
            let delta = clamp(target_wz - self.wz, -YAW_SLEW * dt, YAW_SLEW * dt);
            self.wz += delta;
        } else {
            self.wz *= 1.0 - clamp(ANGULAR_DAMP * dt, 0.0, 1.0);
        }

        if self.wz.abs() < ZERO_EPS {
            self.wz = 0.0;
        }
    }

    fn integrate_pose(&mut self, dt: f64) {
        self.yaw = wrap_angle(self.yaw + self.wz * dt);
        let heading_x = self.yaw.sin();
        let heading_z = self.yaw.cos();
        self.x += self.vx * heading_x * dt;
        self.z += self.vx * heading_z * dt;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(seq: u32, throttle: f64, steer: f64, brake: f64, received_at: f64) -> ControlSnapshot {
        ControlSnapshot {
            seq,
            throttle,
            steer,
            brake,
            received_at,
            client_ts_ms: None,
            manager_recv_ms: None,
        }
    }

    #[test]
    fn test_starts_at_rest() {
        let m = VehicleModel::new();
        let s = m.snapshot();
        assert_eq!(s.vx, 0.0);
        assert_eq!(s.wz, 0.0);
        assert!(s.last_ctrl_age.is_infinite());
    }

    #[test]
    fn test_forward_throttle_increases_speed() {
        let mut m = VehicleModel::new();
        let ctrl = snapshot(1, 0.9, 0.0, 0.0, 0.0);
        for i in 0..30 {
            m.step(Some(&ctrl), 1.0 / 60.0, (i + 1) as f64 / 60.0);
        }
        let s = m.snapshot();
        assert!(s.vx > 0.0);
        assert!(s.vx <= MAX_SPEED + 1e-9);
        assert!(s.z > 0.0, "vehicle should have moved forward");
    }

    #[test]
    fn test_brake_decelerates() {
        let mut m = VehicleModel::new();
        let accel_ctrl = snapshot(1, 0.9, 0.0, 0.0, 0.0);
        for i in 0..60 {
            m.step(Some(&accel_ctrl), 1.0 / 60.0, (i + 1) as f64 / 60.0);
        }
        let vx_before = m.snapshot().vx;
        assert!(vx_before > 0.0);

        let brake_ctrl = snapshot(2, 0.8, 0.0, 1.0, 1.0);
        m.step(Some(&brake_ctrl), 1.0 / 60.0, 1.0 + 1.0 / 60.0);
        assert!(m.snapshot().vx < vx_before);
    }

    #[test]
    fn test_estop_zeroes_and_stays_zero() {
        let mut m = VehicleModel::new();
        let ctrl = snapshot(1, 0.9, 0.5, 0.0, 0.0);
        m.step(Some(&ctrl), 1.0 / 60.0, 1.0 / 60.0);
        assert!(m.snapshot().vx > 0.0 || m.snapshot().wz != 0.0);

        m.estop();
        let s = m.snapshot();
        assert_eq!(s.vx, 0.0);
        assert_eq!(s.wz, 0.0);
        assert!(s.estop_active);

        // Fresh ctrl must not restart motion while latched.
        m.step(Some(&ctrl), 1.0 / 60.0, 0.1);
        let s = m.snapshot();
        assert_eq!(s.vx, 0.0);
        assert_eq!(s.wz, 0.0);
    }

    #[test]
    fn test_stale_command_decays_to_zero() {
        let mut m = VehicleModel::new();
        let ctrl = snapshot(1, 0.9, 0.5, 0.0, 0.0);
        // Run 1.5s of wall time with the same stale snapshot; the effective
        // command should decay fully by CTRL_HOLD_SEC + CTRL_DAMP_SEC = 1.2s.
        let mut t = 0.0;
        while t < 1.5 {
            t += 1.0 / 60.0;
            m.step(Some(&ctrl), 1.0 / 60.0, t);
        }
        let s = m.snapshot();
        assert_eq!(s.vx, 0.0);
        assert_eq!(s.wz, 0.0);
    }

    #[test]
    fn test_yaw_stays_in_range() {
        let mut m = VehicleModel::new();
        let ctrl = snapshot(1, 0.1, 1.0, 0.0, 0.0);
        let mut t = 0.0;
        for _ in 0..600 {
            t += 1.0 / 60.0;
            m.step(Some(&ctrl), 1.0 / 60.0, t);
            let s = m.snapshot();
            assert!(s.yaw > -std::f64::consts::PI && s.yaw <= std::f64::consts::PI);
            assert!(s.wz.abs() <= YAW_RATE_MAX + 1e-6);
        }
    }

    #[test]
    fn test_idle_decel_without_ctrl() {
        let mut m = VehicleModel::new();
        let ctrl = snapshot(1, 0.9, 0.0, 0.0, 0.0);
        for i in 0..30 {
            m.step(Some(&ctrl), 1.0 / 60.0, (i + 1) as f64 / 60.0);
        }
        let vx_before = m.snapshot().vx;
        assert!(vx_before > 0.0);

        for _ in 0..600 {
            m.step(None, 1.0 / 60.0, 1.0);
        }
        assert_eq!(m.snapshot().vx, 0.0);
    }
}
