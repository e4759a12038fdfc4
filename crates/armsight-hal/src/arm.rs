//! Generic `ArmDriver` trait for serial-connected desktop manipulators.
//!
//! Drivers are synchronous: every call blocks until the controller
//! acknowledges it, and motions may take seconds.  The motion sequencer is the
//! only caller and always runs these methods off the async scheduler.

use armsight_types::{ArmError, RobotPose};

/// A connected robot arm with a suction end-effector.
pub trait ArmDriver: Send {
    /// Set the point-to-point velocity and acceleration ratios (percent).
    ///
    /// # Errors
    ///
    /// Returns [`ArmError::DeviceUnavailable`] if the command cannot be sent.
    fn set_speed(&mut self, velocity: f32, acceleration: f32) -> Result<(), ArmError>;

    /// Joint-interpolated move to a Cartesian target.  May return before the
    /// motion has physically completed.
    ///
    /// # Errors
    ///
    /// Returns [`ArmError::DeviceUnavailable`] if the controller rejects the
    /// command or the link drops.
    fn move_to(&mut self, target: RobotPose) -> Result<(), ArmError>;

    /// Run the controller's homing routine.
    ///
    /// # Errors
    ///
    /// Returns [`ArmError::DeviceUnavailable`] on link failure.
    fn home(&mut self) -> Result<(), ArmError>;

    /// Read the current end-effector pose.
    ///
    /// # Errors
    ///
    /// Returns [`ArmError::DeviceUnavailable`] on link failure.
    fn pose(&mut self) -> Result<RobotPose, ArmError>;

    /// Switch the suction cup on (grip) or off (release).
    ///
    /// # Errors
    ///
    /// Returns [`ArmError::DeviceUnavailable`] on link failure.
    fn set_suction(&mut self, on: bool) -> Result<(), ArmError>;

    /// Close the serial link.
    ///
    /// # Errors
    ///
    /// Returns [`ArmError::DeviceUnavailable`] if the port cannot be released.
    fn close(&mut self) -> Result<(), ArmError>;
}

/// Opens [`ArmDriver`] sessions on a named port (e.g. `/dev/ttyACM0`).
pub trait ArmConnector: Send + Sync {
    /// # Errors
    ///
    /// Returns [`ArmError::DeviceUnavailable`] when nothing answers on `port`.
    fn connect(&self, port: &str) -> Result<Box<dyn ArmDriver>, ArmError>;
}
