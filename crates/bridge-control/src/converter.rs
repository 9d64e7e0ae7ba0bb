//! Command Converter (C10, vehicle side).
//!
//! Deliberately its own preset table, separate from the Manager's (see
//! `manager-control::PRESETS`); the two are allowed to diverge and this
//! one is the fallback used when the Bridge receives raw intent without
//! going through the Manager relay.

use types::clamp;

pub const PRESETS: &[(&str, (f64, f64, f64))] = &[
    ("IDLE", (0.0, 0.0, 0.4)),
    ("UP", (1.0, 0.0, 0.0)),
    ("DOWN", (-1.0, 0.0, 0.0)),
    ("LEFT", (0.0, -1.0, 0.0)),
    ("RIGHT", (0.0, 1.0, 0.0)),
];

pub fn resolve_preset(name: &str) -> Option<(f64, f64, f64)> {
    let upper = name.to_uppercase();
    PRESETS
        .iter()
        .find(|(key, _)| *key == upper)
        .map(|(_, triple)| *triple)
}

#[derive(Debug, Clone, Copy)]
pub struct ConverterConfig {
    pub max_linear_speed: f64,
    pub max_angular_speed: f64,
    pub brake_threshold: f64,
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self {
            max_linear_speed: 0.3,
            // Negative by default: inverted steering on the reference hardware.
            max_angular_speed: -0.3,
            brake_threshold: 0.1,
        }
    }
}

/// Raw decoded intent before conversion, mirroring the two accepted
/// shapes a ctrl frame can carry.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawIntent {
    pub throttle: f64,
    pub steer: f64,
    pub brake: f64,
}

pub struct Converter {
    config: ConverterConfig,
}

impl Converter {
    pub fn new(config: ConverterConfig) -> Self {
        Self { config }
    }

    /// Resolve a command name (if present) or explicit fields to a
    /// `(throttle, steer, brake)` triple, clamped to range. Returns `None`
    /// for an unrecognised preset name.
    pub fn resolve(&self, command: Option<&str>, intent: RawIntent) -> Option<RawIntent> {
        if let Some(name) = command {
            let (throttle, steer, brake) = resolve_preset(name)?;
            return Some(RawIntent {
                throttle,
                steer,
                brake,
            });
        }
        Some(RawIntent {
            throttle: clamp(intent.throttle, -1.0, 1.0),
            steer: clamp(intent.steer, -1.0, 1.0),
            brake: clamp(intent.brake, 0.0, 1.0),
        })
    }

    /// Convert a resolved intent into `(linear, angular)`. Estop or a
    /// brake past threshold always wins.
    pub fn to_velocity(&self, intent: RawIntent, estop_active: bool) -> (f64, f64) {
        if estop_active || intent.brake >= self.config.brake_threshold {
            return (0.0, 0.0);
        }
        let throttle = clamp(intent.throttle, -1.0, 1.0);
        let steer = clamp(intent.steer, -1.0, 1.0);
        (
            throttle * self.config.max_linear_speed,
            steer * self.config.max_angular_speed,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_preset_case_insensitive() {
        assert_eq!(resolve_preset("up"), Some((1.0, 0.0, 0.0)));
        assert_eq!(resolve_preset("Down"), Some((-1.0, 0.0, 0.0)));
        assert_eq!(resolve_preset("nope"), None);
    }

    #[test]
    fn test_to_velocity_scales_by_config() {
        let conv = Converter::new(ConverterConfig {
            max_linear_speed: 2.0,
            max_angular_speed: -0.5,
            brake_threshold: 0.1,
        });
        let intent = conv
            .resolve(None, RawIntent { throttle: 0.5, steer: 1.0, brake: 0.0 })
            .unwrap();
        let (linear, angular) = conv.to_velocity(intent, false);
        assert_eq!(linear, 1.0);
        assert_eq!(angular, -0.5);
    }

    #[test]
    fn test_brake_threshold_zeroes_output() {
        let conv = Converter::new(ConverterConfig::default());
        let intent = conv
            .resolve(None, RawIntent { throttle: 1.0, steer: 1.0, brake: 0.2 })
            .unwrap();
        assert_eq!(conv.to_velocity(intent, false), (0.0, 0.0));
    }

    #[test]
    fn test_estop_zeroes_output_regardless_of_brake() {
        let conv = Converter::new(ConverterConfig::default());
        let intent = conv
            .resolve(None, RawIntent { throttle: 1.0, steer: 1.0, brake: 0.0 })
            .unwrap();
        assert_eq!(conv.to_velocity(intent, true), (0.0, 0.0));
    }

    #[test]
    fn test_clamps_out_of_range_explicit_fields() {
        let conv = Converter::new(ConverterConfig {
            max_linear_speed: 1.0,
            max_angular_speed: 1.0,
            brake_threshold: 0.1,
        });
        let intent = conv
            .resolve(None, RawIntent { throttle: 5.0, steer: -9.0, brake: 2.0 })
            .unwrap();
        assert_eq!(intent.throttle, 1.0);
        assert_eq!(intent.steer, -1.0);
        assert_eq!(intent.brake, 1.0);
    }

    #[test]
    fn test_unknown_preset_rejected() {
        let conv = Converter::new(ConverterConfig::default());
        assert!(conv.resolve(Some("NOPE"), RawIntent::default()).is_none());
    }
}
