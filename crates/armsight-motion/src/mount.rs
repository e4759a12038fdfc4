//! Camera → robot base transform for the wrist-mounted camera.
//!
//! The camera looks straight down with its image axes rotated a quarter turn
//! against the arm's base frame:
//!
//! | Robot axis | From |
//! |---|---|
//! | `x` | `ref_x + camera_y` |
//! | `y` | `ref_y − camera_x` |
//! | `z` | `ref_z − camera_z − grip_offset` |
//!
//! where `ref` is the end-effector pose at the moment of capture.

use armsight_types::{Position, RobotPose, SpatialPoint};

/// Map a camera-frame point to a robot-frame position.
pub fn camera_to_robot(point: &SpatialPoint, reference: &RobotPose, grip_offset_mm: f32) -> Position {
    let r = reference.position;
    Position {
        x: r.x + point.y_mm,
        y: r.y - point.x_mm,
        z: r.z - point.z_mm - grip_offset_mm,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn point_on_optical_axis_drops_straight_down() {
        let reference = RobotPose::new(100.0, 50.0, 200.0, 0.0);
        let p = camera_to_robot(&SpatialPoint::new(0.0, 0.0, 0.0), &reference, 10.0);
        assert_eq!((p.x, p.y, p.z), (100.0, 50.0, 190.0));
    }

    #[test]
    fn axes_are_swapped_and_negated() {
        let reference = RobotPose::new(100.0, 50.0, 200.0, 30.0);
        let p = camera_to_robot(&SpatialPoint::new(12.0, -7.0, 150.0), &reference, 0.0);
        assert_eq!((p.x, p.y, p.z), (93.0, 38.0, 50.0));
    }
}
