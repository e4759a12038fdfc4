//! `armsight-runtime` – the agent-facing surface of ArmSight.
//!
//! Wires the Frame Bus, the Spatial Localizer, and the Motion Sequencer into
//! a single set of named tools a language model can call.
//!
//! # Modules
//!
//! - [`toolbox`] – [`Toolbox`][toolbox::Toolbox]: tool dispatch by name with
//!   JSON arguments, reply formatting, JSON Schema declarations for every
//!   tool, and JPEG retrieval of stored result images.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]:
//!   initialises the global `tracing` subscriber with an optional OTLP span
//!   exporter.  Set `OTEL_EXPORTER_OTLP_ENDPOINT` to enable live trace export
//!   to any OTLP-compatible collector.
//!
//! # Error surface
//!
//! Tools never return `Err`.  Every [`ArmError`][armsight_types::ArmError] is
//! rendered as `Error: <message>` so the agent can relay it to the user; the
//! failure is also logged at `warn`.

pub mod telemetry;
pub mod toolbox;

pub use telemetry::{LogFormat, TracerProviderGuard, init_tracing};
pub use toolbox::{CAMERA_ACTIVE, StackConfig, ToolDeclaration, Toolbox, tool_declarations};
