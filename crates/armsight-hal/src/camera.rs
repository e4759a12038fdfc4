//! Generic `DepthCamera` trait and supporting types for stereo-depth rigs.
//!
//! A depth camera produces two streams: RGB color frames and depth frames
//! computed from a stereo pair.  Drivers are responsible for aligning depth to
//! the color camera's viewpoint; consumers must still treat the two streams as
//! having independent resolutions.

use std::time::Duration;

use armsight_types::{ArmError, CameraIntrinsics, ColorFrame, DepthFrame};

/// Depth engines only emit resolutions that are a multiple of this unit.
pub const DEPTH_ALIGNMENT_UNIT: u32 = 16;

/// Round `value` down to the nearest multiple of `unit` (never below `unit`).
pub fn align_down(value: u32, unit: u32) -> u32 {
    if unit == 0 {
        return value;
    }
    ((value / unit) * unit).max(unit)
}

/// Requested stream resolutions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraSettings {
    pub color_width: u32,
    pub color_height: u32,
    pub depth_width: u32,
    pub depth_height: u32,
}

impl CameraSettings {
    /// Build settings, rounding the depth resolution down to the depth
    /// engine's alignment unit.
    pub fn new(color: (u32, u32), depth: (u32, u32), alignment_unit: u32) -> Self {
        Self {
            color_width: color.0,
            color_height: color.1,
            depth_width: align_down(depth.0, alignment_unit),
            depth_height: align_down(depth.1, alignment_unit),
        }
    }
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self::new((640, 400), (320, 200), DEPTH_ALIGNMENT_UNIT)
    }
}

/// Whatever the device delivered during one [`DepthCamera::next_frames`]
/// call.  Either stream may be absent; the two run on their own cadence.
#[derive(Debug, Default)]
pub struct CapturedFrames {
    pub color: Option<ColorFrame>,
    pub depth: Option<DepthFrame>,
}

/// A stereo-depth camera device.
///
/// All methods may block; callers run them on a dedicated thread.
pub trait DepthCamera: Send {
    /// Stable identifier for this camera, e.g. `"oak_d"`.
    fn id(&self) -> &str;

    /// Open the device and start its color + aligned-depth pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`ArmError::DeviceUnavailable`] when no device is attached or
    /// the pipeline cannot be built.
    fn open(&mut self, settings: &CameraSettings) -> Result<(), ArmError>;

    /// Read factory calibration for the depth stream's resolution.
    ///
    /// # Errors
    ///
    /// Any error here is non-fatal; callers fall back to
    /// [`CameraIntrinsics::fallback`].
    fn calibration(&mut self) -> Result<CameraIntrinsics, ArmError>;

    /// Wait up to `timeout` for the next frames from either stream.
    ///
    /// # Errors
    ///
    /// Returns [`ArmError::DeviceUnavailable`] when the device stops
    /// responding.
    fn next_frames(&mut self, timeout: Duration) -> Result<CapturedFrames, ArmError>;

    /// Release all device resources.  Must be safe to call repeatedly.
    fn close(&mut self);
}
