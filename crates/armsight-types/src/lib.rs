use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Focal length (pixels) used when the device calibration cannot be read.
pub const FALLBACK_FOCAL_PX: f32 = 882.5;

/// Pinhole camera intrinsics, valid for exactly one frame resolution.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraIntrinsics {
    pub fx: f32,
    pub fy: f32,
    pub cx: f32,
    pub cy: f32,
    /// Resolution the intrinsics were calibrated for.
    pub width: u32,
    pub height: u32,
}

impl CameraIntrinsics {
    pub fn new(fx: f32, fy: f32, cx: f32, cy: f32, width: u32, height: u32) -> Self {
        Self {
            fx,
            fy,
            cx,
            cy,
            width,
            height,
        }
    }

    /// Degraded-mode intrinsics: nominal focal length, principal point at the
    /// image centre.
    pub fn fallback(width: u32, height: u32) -> Self {
        Self::new(
            FALLBACK_FOCAL_PX,
            FALLBACK_FOCAL_PX,
            width as f32 / 2.0,
            height as f32 / 2.0,
            width,
            height,
        )
    }

    /// Rescale to another resolution of the same sensor.  Returns `self`
    /// unchanged when the resolution already matches.
    pub fn scaled_to(self, width: u32, height: u32) -> Self {
        if (width == self.width && height == self.height) || self.width == 0 || self.height == 0 {
            return Self { width, height, ..self };
        }
        let sx = width as f32 / self.width as f32;
        let sy = height as f32 / self.height as f32;
        Self::new(
            self.fx * sx,
            self.fy * sy,
            self.cx * sx,
            self.cy * sy,
            width,
            height,
        )
    }

    /// Back-project pixel `(px, py)` at metric depth `z_mm` into camera-frame
    /// millimetres.  The vertical axis is flipped so that +y points up.
    pub fn deproject(&self, px: f32, py: f32, z_mm: f32) -> (f32, f32, f32) {
        let x_mm = (px - self.cx) * z_mm / self.fx;
        let y_mm = -(py - self.cy) * z_mm / self.fy;
        (x_mm, y_mm, z_mm)
    }
}

/// An 8-bit RGB frame captured by the Frame Bus.
#[derive(Debug, Clone, PartialEq)]
pub struct ColorFrame {
    pub width: u32,
    pub height: u32,
    /// Row-major RGB24 samples, `width * height * 3` bytes.
    pub data: Vec<u8>,
    pub timestamp: DateTime<Utc>,
    /// Camera session the frame was captured in.
    pub session: u64,
    pub sequence: u64,
}

impl ColorFrame {
    /// Wrap raw RGB24 bytes.
    ///
    /// # Errors
    ///
    /// Returns [`ArmError::InvalidArgument`] when `data` does not hold exactly
    /// `width * height * 3` bytes.
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Result<Self, ArmError> {
        let expected = width as usize * height as usize * 3;
        if data.len() != expected {
            return Err(ArmError::InvalidArgument(format!(
                "color frame {width}x{height} needs {expected} bytes, got {}",
                data.len()
            )));
        }
        Ok(Self {
            width,
            height,
            data,
            timestamp: Utc::now(),
            session: 0,
            sequence: 0,
        })
    }

    /// An all-black frame.
    pub fn blank(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![0; width as usize * height as usize * 3],
            timestamp: Utc::now(),
            session: 0,
            sequence: 0,
        }
    }

    pub fn with_session(mut self, session: u64, sequence: u64) -> Self {
        self.session = session;
        self.sequence = sequence;
        self
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let i = (y as usize * self.width as usize + x as usize) * 3;
        Some([self.data[i], self.data[i + 1], self.data[i + 2]])
    }
}

/// A 16-bit depth frame in millimetres, aligned to the color camera's
/// viewpoint.  A sample of `0` means "no reading".
#[derive(Debug, Clone, PartialEq)]
pub struct DepthFrame {
    pub width: u32,
    pub height: u32,
    /// Row-major depth samples, `width * height` values.
    pub data: Vec<u16>,
    /// Intrinsics matching this frame's resolution.
    pub intrinsics: CameraIntrinsics,
    pub timestamp: DateTime<Utc>,
    pub session: u64,
    pub sequence: u64,
}

impl DepthFrame {
    /// Wrap raw depth samples.  Intrinsics default to
    /// [`CameraIntrinsics::fallback`] until replaced with
    /// [`with_intrinsics`](Self::with_intrinsics).
    ///
    /// # Errors
    ///
    /// Returns [`ArmError::InvalidArgument`] on a size mismatch.
    pub fn new(width: u32, height: u32, data: Vec<u16>) -> Result<Self, ArmError> {
        let expected = width as usize * height as usize;
        if data.len() != expected {
            return Err(ArmError::InvalidArgument(format!(
                "depth frame {width}x{height} needs {expected} samples, got {}",
                data.len()
            )));
        }
        Ok(Self {
            width,
            height,
            data,
            intrinsics: CameraIntrinsics::fallback(width, height),
            timestamp: Utc::now(),
            session: 0,
            sequence: 0,
        })
    }

    /// Attach intrinsics, rescaled to this frame's resolution.
    pub fn with_intrinsics(mut self, intrinsics: CameraIntrinsics) -> Self {
        self.intrinsics = intrinsics.scaled_to(self.width, self.height);
        self
    }

    pub fn with_session(mut self, session: u64, sequence: u64) -> Self {
        self.session = session;
        self.sequence = sequence;
        self
    }

    pub fn at(&self, x: u32, y: u32) -> u16 {
        self.data[y as usize * self.width as usize + x as usize]
    }
}

/// A pixel coordinate in some frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pixel {
    pub x: u32,
    pub y: u32,
}

impl Pixel {
    pub fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }
}

/// A metric 3-D coordinate in the camera frame (+x right, +y up, +z away).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SpatialPoint {
    pub x_mm: f32,
    pub y_mm: f32,
    pub z_mm: f32,
    /// Frame Bus session whose depth frame produced this point.  `None` for
    /// caller-supplied points.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<u64>,
}

impl SpatialPoint {
    pub fn new(x_mm: f32, y_mm: f32, z_mm: f32) -> Self {
        Self {
            x_mm,
            y_mm,
            z_mm,
            session: None,
        }
    }

    pub fn in_session(mut self, session: u64) -> Self {
        self.session = Some(session);
        self
    }
}

/// Binary object mask aligned to the color frame it was computed from.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentationMask {
    pub width: u32,
    pub height: u32,
    /// Row-major occupancy, `width * height` cells.
    pub data: Vec<bool>,
}

impl SegmentationMask {
    /// # Errors
    ///
    /// Returns [`ArmError::InvalidArgument`] on a size mismatch.
    pub fn new(width: u32, height: u32, data: Vec<bool>) -> Result<Self, ArmError> {
        if data.len() != width as usize * height as usize {
            return Err(ArmError::InvalidArgument(format!(
                "mask {width}x{height} needs {} cells, got {}",
                width as usize * height as usize,
                data.len()
            )));
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    pub fn empty(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![false; width as usize * height as usize],
        }
    }

    pub fn get(&self, x: u32, y: u32) -> bool {
        x < self.width && y < self.height && self.data[y as usize * self.width as usize + x as usize]
    }

    pub fn set(&mut self, x: u32, y: u32, value: bool) {
        if x < self.width && y < self.height {
            self.data[y as usize * self.width as usize + x as usize] = value;
        }
    }

    /// Number of set cells.
    pub fn area(&self) -> usize {
        self.data.iter().filter(|&&v| v).count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
pub struct Position {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
pub struct Orientation {
    /// End-effector rotation about the vertical axis, degrees.
    pub r: f32,
}

/// End-effector pose in the robot base frame (millimetres / degrees).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
pub struct RobotPose {
    pub position: Position,
    pub orientation: Orientation,
}

impl RobotPose {
    pub fn new(x: f32, y: f32, z: f32, r: f32) -> Self {
        Self {
            position: Position { x, y, z },
            orientation: Orientation { r },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

/// Last commanded end-effector state.  The driver cannot be queried for it,
/// so this is a cache of what was requested, not a measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GripperState {
    Open,
    Closed,
    #[default]
    Unknown,
}

impl std::fmt::Display for GripperState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GripperState::Open => write!(f, "open"),
            GripperState::Closed => write!(f, "closed"),
            GripperState::Unknown => write!(f, "unknown"),
        }
    }
}

/// Global error type spanning camera, perception, and motion failures.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ArmError {
    #[error("Device unavailable ({device}): {details}")]
    DeviceUnavailable { device: String, details: String },

    #[error("Invalid depth: {0}")]
    InvalidDepth(String),

    #[error("Object not found: {0}")]
    ObjectNotFound(String),

    #[error("Motion failed at step '{step}': {details}")]
    MotionFailed { step: String, details: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Encoding error: {0}")]
    Encoding(String),
}

impl ArmError {
    pub fn device(device: impl Into<String>, details: impl Into<String>) -> Self {
        ArmError::DeviceUnavailable {
            device: device.into(),
            details: details.into(),
        }
    }

    pub fn motion(step: impl Into<String>, details: impl Into<String>) -> Self {
        ArmError::MotionFailed {
            step: step.into(),
            details: details.into(),
        }
    }
}
