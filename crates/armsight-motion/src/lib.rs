//! `armsight-motion` – everything that moves the arm.
//!
//! - [`sequencer`] – [`MotionSequencer`]: connection state, primitives,
//!   pick/place sequences.
//! - [`mount`] – fixed camera → robot axis mapping.
//! - [`affine`] – optional pixel → robot-plane calibration matrix.
//! - [`config`] – [`MotionConfig`] speeds and offsets.

pub mod affine;
pub mod config;
pub mod mount;
pub mod sequencer;

pub use config::MotionConfig;
pub use sequencer::{MotionSequencer, PoseReading, SequenceReport, SequenceStep, Target};
