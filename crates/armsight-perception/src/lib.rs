//! `armsight-perception` – from camera frames to metric object positions.
//!
//! # Modules
//!
//! | Module | Contents |
//! |---|---|
//! | [`frame_bus`] | [`FrameBus`]: owns the camera, publishes the latest color/depth frames |
//! | [`depth`] | [`DepthSampler`]: normalized point → [`SpatialPoint`] with hole filling |
//! | [`mask`] | Mask centroid, resampling, and median depth under a mask |
//! | [`models`] | [`ObjectProposer`] / [`Segmenter`] seams plus scene-backed implementations |
//! | [`localizer`] | [`SpatialLocalizer`]: the full locate pipeline |
//! | [`annotate`] | Crosshair, mask tint, and coordinate label on result images |
//! | [`frame_store`] | [`FrameStore`]: annotated images addressable by id |
//!
//! [`SpatialPoint`]: armsight_types::SpatialPoint

pub mod annotate;
pub mod depth;
pub mod frame_bus;
pub mod frame_store;
pub mod localizer;
pub mod mask;
pub mod models;

pub use depth::{DepthConfig, DepthSample, DepthSampler, DepthSource};
pub use frame_bus::{FrameBus, RetryPolicy};
pub use frame_store::{FrameStore, encode_jpeg};
pub use localizer::{LocateRequest, Localization, SpatialLocalizer};
pub use models::{NoSegmenter, ObjectProposer, Proposal, SceneProposer, SceneSegmenter, Segmenter};
