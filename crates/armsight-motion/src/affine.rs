//! Pixel → robot-plane calibration as a 3×3 affine matrix.
//!
//! An alternative to the depth-based path for a fixed overhead camera: a
//! matrix fitted offline maps image pixel `(u, v)` straight to robot
//! `(x, y)`, and the height comes from a constant.

use armsight_types::ArmError;
use nalgebra::{Matrix3, Vector3};

/// Height used by [`move_above_pixel`](crate::MotionSequencer::move_above_pixel).
pub const DEFAULT_Z_ABOVE_MM: f32 = -30.0;
/// Height used by [`move_to_block_pixel`](crate::MotionSequencer::move_to_block_pixel).
pub const DEFAULT_BLOCK_HEIGHT_MM: f32 = -30.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AffineCalibration {
    matrix: Matrix3<f64>,
}

impl AffineCalibration {
    /// Build from nine row-major values.
    ///
    /// # Errors
    ///
    /// Returns [`ArmError::InvalidArgument`] unless exactly nine finite
    /// values are given.
    pub fn from_flat(values: &[f64]) -> Result<Self, ArmError> {
        if values.len() != 9 {
            return Err(ArmError::InvalidArgument(format!(
                "affine matrix needs 9 values, got {}",
                values.len()
            )));
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(ArmError::InvalidArgument("affine matrix has non-finite values".into()));
        }
        Ok(Self {
            matrix: Matrix3::from_row_slice(values),
        })
    }

    /// Robot `(x, y)` for image pixel `(u, v)`.
    pub fn apply(&self, u: f64, v: f64) -> (f64, f64) {
        let xy = self.matrix * Vector3::new(u, v, 1.0);
        (xy[0], xy[1])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_passes_pixels_through() {
        let m = AffineCalibration::from_flat(&[1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0]).unwrap();
        assert_eq!(m.apply(12.0, 34.0), (12.0, 34.0));
    }

    #[test]
    fn row_major_scale_and_offset() {
        let m = AffineCalibration::from_flat(&[0.5, 0.0, 100.0, 0.0, -0.5, 20.0, 0.0, 0.0, 1.0]).unwrap();
        assert_eq!(m.apply(40.0, 10.0), (120.0, 15.0));
    }

    #[test]
    fn malformed_matrices_are_rejected() {
        assert!(AffineCalibration::from_flat(&[1.0; 8]).is_err());
        let mut values = [0.0; 9];
        values[4] = f64::NAN;
        assert!(AffineCalibration::from_flat(&values).is_err());
    }
}
