//! [`Toolbox`] – the tool surface a conversational agent calls.
//!
//! Every tool returns a plain `String` and never an error: failures come
//! back as `Error: <message>` so the agent can relay them verbatim.  Reply
//! shapes are a contract with the chat front-end, which parses them:
//!
//! | Tool | Reply |
//! |---|---|
//! | `show_camera` | [`CAMERA_ACTIVE`] |
//! | `locate` | `Located <label> at x=…mm, y=…mm, z=…mm.` + a fenced `depth` block |
//! | `open_gripper` / `close_gripper` | `Gripper opened` / `Gripper closed` |
//! | `go_home` | `Robot homed` |
//! | `pick_up` | `Picked up <label>: …` |
//! | `place` | `Placed at …` |
//! | `get_pose` | Pretty JSON pose with `stale` and `gripper` |

use std::sync::Arc;

use armsight_hal::camera::CameraSettings;
use armsight_hal::sim::SimRig;
use armsight_motion::{MotionConfig, MotionSequencer, SequenceReport, Target};
use armsight_perception::frame_store;
use armsight_perception::{
    DepthConfig, DepthSampler, FrameBus, FrameStore, LocateRequest, Localization, SceneProposer, SceneSegmenter,
    SpatialLocalizer,
};
use armsight_types::{ArmError, SpatialPoint};
use schemars::{JsonSchema, schema_for};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

/// Exact reply of `show_camera`; the front-end swaps the image for the live
/// stream.
pub const CAMERA_ACTIVE: &str = "Camera is active. To show the stream, YOU MUST include this exact markdown image in your response: ![Camera Stream](stream)";

// ────────────────────────────────────────────────────────────────────────────
// Arguments
// ────────────────────────────────────────────────────────────────────────────

/// Tool without arguments.
#[derive(Debug, Default, Deserialize, JsonSchema)]
pub struct NoArgs {}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct LocateArgs {
    /// What to find, e.g. "the red block".
    pub description: String,
}

/// A target given by description or by camera-frame coordinates.
#[derive(Debug, Default, Deserialize, JsonSchema)]
pub struct TargetArgs {
    /// What to act on, e.g. "the blue cup".
    #[serde(default)]
    pub description: Option<String>,
    /// Camera-frame x in millimetres (right positive).
    #[serde(default)]
    pub x: Option<f32>,
    /// Camera-frame y in millimetres (up positive).
    #[serde(default)]
    pub y: Option<f32>,
    /// Camera-frame depth in millimetres.
    #[serde(default)]
    pub z: Option<f32>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct AffineArgs {
    /// Nine row-major values of the 3x3 pixel-to-robot matrix.
    pub matrix: Vec<f64>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct PixelArgs {
    /// Image column.
    pub u: f64,
    /// Image row.
    pub v: f64,
    /// Robot z in millimetres; defaults to -30.
    #[serde(default)]
    pub z: Option<f32>,
}

/// One entry of [`tool_declarations`].
#[derive(Debug, Clone, Serialize)]
pub struct ToolDeclaration {
    pub name: &'static str,
    pub description: &'static str,
    pub parameters: Value,
}

fn declare<T: JsonSchema>(name: &'static str, description: &'static str) -> ToolDeclaration {
    ToolDeclaration {
        name,
        description,
        parameters: serde_json::to_value(schema_for!(T)).unwrap_or(Value::Null),
    }
}

/// Declarations for registering the tools with a language model.
pub fn tool_declarations() -> Vec<ToolDeclaration> {
    vec![
        declare::<NoArgs>("show_camera", "Turn on the camera and show its live stream."),
        declare::<LocateArgs>(
            "locate",
            "Find an object in the camera image and return its 3D position in millimetres.",
        ),
        declare::<NoArgs>("open_gripper", "Release: turn the suction cup off."),
        declare::<NoArgs>("close_gripper", "Grip: turn the suction cup on."),
        declare::<NoArgs>("go_home", "Run the arm's homing routine."),
        declare::<TargetArgs>(
            "pick_up",
            "Pick up an object, given by description or by camera-frame x, y, z in millimetres.",
        ),
        declare::<TargetArgs>(
            "place",
            "Put the held object down at a location, given by description or camera-frame x, y, z.",
        ),
        declare::<NoArgs>("get_pose", "Read the arm's current position, rotation, and gripper state."),
        declare::<AffineArgs>(
            "set_affine_matrix",
            "Set the 3x3 matrix that converts image pixels (u, v) to robot (x, y).",
        ),
        declare::<PixelArgs>(
            "move_above_pixel",
            "Move above the point at image pixel (u, v) using the affine calibration.",
        ),
        declare::<PixelArgs>(
            "move_to_block_pixel",
            "Move down to the block at image pixel (u, v) using the affine calibration.",
        ),
    ]
}

// ────────────────────────────────────────────────────────────────────────────
// Reply formatting
// ────────────────────────────────────────────────────────────────────────────

/// Payload of the fenced `depth` block.  Field order is part of the format.
#[derive(Debug, Serialize)]
struct DepthBlock<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    image: &'a str,
    x: i64,
    y: i64,
    z: i64,
    pixel: [u32; 2],
}

pub fn format_located(found: &Localization) -> String {
    let block = DepthBlock {
        kind: "depth",
        image: &found.image_id,
        x: found.point.x_mm as i64,
        y: found.point.y_mm as i64,
        z: found.point.z_mm as i64,
        pixel: [found.pixel.x, found.pixel.y],
    };
    let json = serde_json::to_string(&block).unwrap_or_default();
    format!(
        "Located {} at x={}mm, y={}mm, z={}mm.\n```depth\n{}\n```",
        found.label, block.x, block.y, block.z, json
    )
}

fn format_picked(report: &SequenceReport) -> String {
    let c = report.contact;
    format!(
        "Picked up {}: grasped at x={:.1}, y={:.1}, z={:.1} and lifted to z={:.1}.",
        report.label, c.x, c.y, c.z, report.finish.z
    )
}

fn format_placed(report: &SequenceReport) -> String {
    let c = report.contact;
    format!(
        "Placed at x={:.1}, y={:.1}, z={:.1} and retreated to z={:.1}.",
        c.x, c.y, c.z, report.finish.z
    )
}

fn error_reply(e: impl std::fmt::Display) -> String {
    format!("Error: {e}")
}

// ────────────────────────────────────────────────────────────────────────────
// Toolbox
// ────────────────────────────────────────────────────────────────────────────

/// Settings for assembling a full stack.
#[derive(Debug, Clone)]
pub struct StackConfig {
    pub camera: CameraSettings,
    pub depth: DepthConfig,
    pub motion: MotionConfig,
    /// Result images kept; `0` keeps all.
    pub store_capacity: usize,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            camera: CameraSettings::default(),
            depth: DepthConfig::default(),
            motion: MotionConfig::default(),
            store_capacity: frame_store::DEFAULT_CAPACITY,
        }
    }
}

/// Binds tool names to the perception and motion stack.
pub struct Toolbox {
    localizer: Arc<SpatialLocalizer>,
    motion: Arc<MotionSequencer>,
}

impl Toolbox {
    pub fn new(localizer: Arc<SpatialLocalizer>, motion: Arc<MotionSequencer>) -> Self {
        Self { localizer, motion }
    }

    /// Wire every stage over a simulated bench.
    pub fn simulated(rig: &SimRig, config: &StackConfig) -> Self {
        let bus = Arc::new(FrameBus::new(Box::new(rig.camera()), config.camera));
        let localizer = Arc::new(SpatialLocalizer::new(
            DepthSampler::new(bus.clone(), config.depth),
            bus,
            Arc::new(SceneProposer::new(rig.scene.clone())),
            Arc::new(SceneSegmenter::new(rig.scene.clone())),
            Arc::new(FrameStore::new(config.store_capacity)),
        ));
        let motion = MotionSequencer::new(Arc::new(rig.connector.clone()), config.motion.clone())
            .with_localizer(localizer.clone());
        info!(camera = %localizer.bus().camera_id(), port = %config.motion.port, "simulated stack assembled");
        Self::new(localizer, Arc::new(motion))
    }

    pub fn bus(&self) -> &Arc<FrameBus> {
        self.localizer.bus()
    }

    pub fn store(&self) -> &Arc<FrameStore> {
        self.localizer.store()
    }

    pub fn motion(&self) -> &Arc<MotionSequencer> {
        &self.motion
    }

    /// Run a tool by name with JSON arguments.
    pub async fn dispatch(&self, name: &str, args: Value) -> String {
        info!(tool = name, "tool call");
        let reply = match name {
            "show_camera" => self.show_camera().await,
            "locate" => match parse::<LocateArgs>(args) {
                Ok(a) => self.locate(&a.description).await,
                Err(e) => e,
            },
            "open_gripper" => self.open_gripper().await,
            "close_gripper" => self.close_gripper().await,
            "go_home" => self.go_home().await,
            "pick_up" => match parse::<TargetArgs>(args) {
                Ok(a) => self.pick_up(a).await,
                Err(e) => e,
            },
            "place" => match parse::<TargetArgs>(args) {
                Ok(a) => self.place(a).await,
                Err(e) => e,
            },
            "get_pose" => self.get_pose().await,
            "set_affine_matrix" => match parse::<AffineArgs>(args) {
                Ok(a) => self.set_affine_matrix(&a.matrix),
                Err(e) => e,
            },
            "move_above_pixel" => match parse::<PixelArgs>(args) {
                Ok(a) => self.move_above_pixel(a).await,
                Err(e) => e,
            },
            "move_to_block_pixel" => match parse::<PixelArgs>(args) {
                Ok(a) => self.move_to_block_pixel(a).await,
                Err(e) => e,
            },
            other => error_reply(format!("unknown tool '{other}'")),
        };
        if reply.starts_with("Error:") {
            warn!(tool = name, %reply, "tool failed");
        }
        reply
    }

    pub async fn show_camera(&self) -> String {
        match self.bus().start().await {
            Ok(()) => CAMERA_ACTIVE.to_string(),
            Err(e) => error_reply(format!("failed to access camera: {e}")),
        }
    }

    pub async fn locate(&self, description: &str) -> String {
        if let Err(e) = self.bus().start().await {
            return error_reply(e);
        }
        match self.localizer.locate(LocateRequest::describe(description)).await {
            Ok(found) => format_located(&found),
            Err(e) => error_reply(e),
        }
    }

    pub async fn open_gripper(&self) -> String {
        match self.motion.open_gripper().await {
            Ok(()) => "Gripper opened".to_string(),
            Err(e) => error_reply(e),
        }
    }

    pub async fn close_gripper(&self) -> String {
        match self.motion.close_gripper().await {
            Ok(()) => "Gripper closed".to_string(),
            Err(e) => error_reply(e),
        }
    }

    pub async fn go_home(&self) -> String {
        match self.motion.home().await {
            Ok(()) => "Robot homed".to_string(),
            Err(e) => error_reply(e),
        }
    }

    async fn target(&self, args: TargetArgs) -> Result<Target, ArmError> {
        match (args.x, args.y, args.z, args.description) {
            (Some(x), Some(y), Some(z), _) => Ok(Target::Point(SpatialPoint::new(x, y, z))),
            (None, None, None, Some(description)) if !description.trim().is_empty() => {
                self.bus().start().await?;
                Ok(Target::Describe(description))
            }
            (None, None, None, _) => Err(ArmError::InvalidArgument(
                "give a description or all of x, y, z".into(),
            )),
            _ => Err(ArmError::InvalidArgument("x, y and z must be given together".into())),
        }
    }

    pub async fn pick_up(&self, args: TargetArgs) -> String {
        let label = args.description.clone();
        let target = match self.target(args).await {
            Ok(t) => t,
            Err(e) => return error_reply(e),
        };
        // Coordinates carry no name of their own; keep the caller's.
        let explicit = matches!(target, Target::Point(_));
        match self.motion.pick_up(target).await {
            Ok(mut report) => {
                if explicit && let Some(label) = label {
                    report.label = label;
                }
                format_picked(&report)
            }
            Err(e) => error_reply(e),
        }
    }

    pub async fn place(&self, args: TargetArgs) -> String {
        let target = match self.target(args).await {
            Ok(t) => t,
            Err(e) => return error_reply(e),
        };
        match self.motion.place(target).await {
            Ok(report) => format_placed(&report),
            Err(e) => error_reply(e),
        }
    }

    pub async fn get_pose(&self) -> String {
        let reading = self.motion.get_pose().await;
        serde_json::to_string_pretty(&reading).unwrap_or_else(error_reply)
    }

    pub fn set_affine_matrix(&self, matrix: &[f64]) -> String {
        match self.motion.set_affine_matrix(matrix) {
            Ok(()) => "Affine matrix updated".to_string(),
            Err(e) => error_reply(e),
        }
    }

    pub async fn move_above_pixel(&self, args: PixelArgs) -> String {
        match self.motion.move_above_pixel(args.u, args.v, args.z).await {
            Ok(()) => format!("Moved above pixel ({}, {})", args.u, args.v),
            Err(e) => error_reply(e),
        }
    }

    pub async fn move_to_block_pixel(&self, args: PixelArgs) -> String {
        match self.motion.move_to_block_pixel(args.u, args.v, args.z).await {
            Ok(()) => format!("Moved to block at pixel ({}, {})", args.u, args.v),
            Err(e) => error_reply(e),
        }
    }

    /// JPEG bytes of a stored result image, for the image-serving endpoint.
    ///
    /// # Errors
    ///
    /// [`ArmError::NotFound`] for unknown ids.
    pub fn image(&self, id: &str) -> Result<Vec<u8>, ArmError> {
        self.store().get_jpeg(id)
    }
}

/// Missing or `null` arguments count as `{}`.
fn parse<T: DeserializeOwned>(args: Value) -> Result<T, String> {
    let args = if args.is_null() { Value::Object(Default::default()) } else { args };
    serde_json::from_value(args).map_err(|e| error_reply(ArmError::InvalidArgument(e.to_string())))
}
