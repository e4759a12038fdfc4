//! Motion tuning constants.  All of these are calibration values supplied
//! from configuration, never computed.

use serde::{Deserialize, Serialize};

/// Serial port tried when none is given.
pub const DEFAULT_PORT: &str = "/dev/ttyACM0";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionConfig {
    pub port: String,
    /// Point-to-point velocity ratio, percent.
    pub velocity: f32,
    /// Point-to-point acceleration ratio, percent.
    pub acceleration: f32,
    /// Wait after each move or home; the controller acknowledges before the
    /// motion ends.
    pub settle_ms: u64,
    /// Subtracted from the computed grasp height.
    pub grip_offset_mm: f32,
    /// Added to the grasp height for the lift and place approach.
    pub lift_offset_mm: f32,
    /// Height above the place target at which the object is released.
    pub place_clearance_mm: f32,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT.to_string(),
            velocity: 50.0,
            acceleration: 50.0,
            settle_ms: 2000,
            grip_offset_mm: 10.0,
            lift_offset_mm: 50.0,
            place_clearance_mm: 5.0,
        }
    }
}
