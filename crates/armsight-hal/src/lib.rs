//! `armsight-hal` – hardware abstraction for the camera rig and the arm.
//!
//! # Modules
//!
//! - [`camera`] – [`DepthCamera`][camera::DepthCamera]: stereo-depth device
//!   driver trait, stream settings, and depth-alignment helpers.
//! - [`arm`] – [`ArmDriver`][arm::ArmDriver] / [`ArmConnector`][arm::ArmConnector]:
//!   blocking serial-arm driver traits.
//! - [`sim`] – simulated tabletop scene, camera, and arm for running the
//!   whole stack without hardware.

pub mod arm;
pub mod camera;
pub mod sim;

pub use arm::{ArmConnector, ArmDriver};
pub use camera::{CameraSettings, CapturedFrames, DepthCamera, DEPTH_ALIGNMENT_UNIT};
pub use sim::SimRig;
