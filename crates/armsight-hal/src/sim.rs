//! In-process simulated tabletop rig for CI/CD testing without hardware.
//!
//! [`SimScene`] describes a flat table seen from above with coloured blocks on
//! it.  [`SimCamera`] renders the scene into color and aligned depth frames,
//! and [`SimConnector`] / [`SimArm`] record every arm command so tests can
//! assert on the exact motion sequence.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use armsight_hal::sim::{SimBlock, SimScene};
//!
//! let scene = Arc::new(
//!     SimScene::new(600)
//!         .with_block(SimBlock::new("red block", [220, 30, 30], (300, 180, 340, 220), 40)),
//! );
//! assert!(scene.find("red").is_some());
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use armsight_types::{ArmError, CameraIntrinsics, ColorFrame, DepthFrame, Pixel, RobotPose};
use chrono::Utc;
use parking_lot::Mutex;
use tracing::debug;

use crate::arm::{ArmConnector, ArmDriver};
use crate::camera::{CameraSettings, CapturedFrames, DepthCamera};

// ────────────────────────────────────────────────────────────────────────────
// Scene
// ────────────────────────────────────────────────────────────────────────────

/// One axis-aligned block on the simulated table.
#[derive(Debug, Clone, PartialEq)]
pub struct SimBlock {
    pub label: String,
    pub color: [u8; 3],
    /// `(x0, y0, x1, y1)` in reference color pixels, exclusive upper bound.
    pub rect: (u32, u32, u32, u32),
    /// Height above the table surface.
    pub height_mm: u16,
    /// Shiny top face: the depth engine returns no reading across its
    /// interior, only along a thin rim.
    pub reflective: bool,
}

impl SimBlock {
    pub fn new(label: impl Into<String>, color: [u8; 3], rect: (u32, u32, u32, u32), height_mm: u16) -> Self {
        Self {
            label: label.into(),
            color,
            rect,
            height_mm,
            reflective: false,
        }
    }

    pub fn reflective(mut self) -> Self {
        self.reflective = true;
        self
    }

    fn contains(&self, x: u32, y: u32) -> bool {
        let (x0, y0, x1, y1) = self.rect;
        x >= x0 && x < x1 && y >= y0 && y < y1
    }

    fn on_rim(&self, x: u32, y: u32) -> bool {
        let (x0, y0, x1, y1) = self.rect;
        x < x0 + 2 || y < y0 + 2 || x + 2 >= x1 || y + 2 >= y1
    }

    pub fn center(&self) -> Pixel {
        let (x0, y0, x1, y1) = self.rect;
        Pixel::new((x0 + x1) / 2, (y0 + y1) / 2)
    }
}

/// A table plane at a fixed distance from the camera plus blocks on it.
///
/// Block rectangles are expressed in a reference color resolution (640×400
/// by default); frames at other resolutions are rendered by scaling.
#[derive(Debug, Clone)]
pub struct SimScene {
    pub table_depth_mm: u16,
    pub table_color: [u8; 3],
    pub reference_size: (u32, u32),
    pub blocks: Vec<SimBlock>,
}

impl SimScene {
    pub fn new(table_depth_mm: u16) -> Self {
        Self {
            table_depth_mm,
            table_color: [90, 70, 50],
            reference_size: (640, 400),
            blocks: Vec::new(),
        }
    }

    pub fn with_block(mut self, block: SimBlock) -> Self {
        self.blocks.push(block);
        self
    }

    /// First block whose label contains every word of `description`
    /// (case-insensitive).
    pub fn find(&self, description: &str) -> Option<&SimBlock> {
        let wanted: Vec<String> = description
            .split_whitespace()
            .map(str::to_lowercase)
            .filter(|w| !matches!(w.as_str(), "the" | "a" | "an"))
            .collect();
        self.blocks.iter().find(|b| {
            let label = b.label.to_lowercase();
            wanted.iter().all(|w| label.contains(w.as_str()))
        })
    }

    /// Block under a reference-resolution pixel.
    pub fn block_at(&self, x: u32, y: u32) -> Option<&SimBlock> {
        self.blocks.iter().rev().find(|b| b.contains(x, y))
    }

    /// Block under a pixel of a `width`×`height` frame of this scene.
    pub fn block_in_frame(&self, x: u32, y: u32, width: u32, height: u32) -> Option<&SimBlock> {
        let (rx, ry) = self.to_reference(x, y, width, height);
        self.block_at(rx, ry)
    }

    fn to_reference(&self, x: u32, y: u32, width: u32, height: u32) -> (u32, u32) {
        let (rw, rh) = self.reference_size;
        (
            (x as u64 * rw as u64 / width.max(1) as u64) as u32,
            (y as u64 * rh as u64 / height.max(1) as u64) as u32,
        )
    }

    pub fn render_color(&self, width: u32, height: u32) -> ColorFrame {
        let mut frame = ColorFrame::blank(width, height);
        for y in 0..height {
            for x in 0..width {
                let (rx, ry) = self.to_reference(x, y, width, height);
                let rgb = self
                    .block_at(rx, ry)
                    .map(|b| b.color)
                    .unwrap_or(self.table_color);
                let i = (y as usize * width as usize + x as usize) * 3;
                frame.data[i..i + 3].copy_from_slice(&rgb);
            }
        }
        frame
    }

    pub fn render_depth(&self, width: u32, height: u32) -> DepthFrame {
        let mut data = vec![0u16; width as usize * height as usize];
        for y in 0..height {
            for x in 0..width {
                let (rx, ry) = self.to_reference(x, y, width, height);
                data[y as usize * width as usize + x as usize] = match self.block_at(rx, ry) {
                    Some(b) if b.reflective && !b.on_rim(rx, ry) => 0,
                    Some(b) => self.table_depth_mm.saturating_sub(b.height_mm),
                    None => self.table_depth_mm,
                };
            }
        }
        // Dimensions match by construction.
        DepthFrame {
            width,
            height,
            data,
            intrinsics: CameraIntrinsics::fallback(width, height),
            timestamp: Utc::now(),
            session: 0,
            sequence: 0,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Simulated depth camera
// ────────────────────────────────────────────────────────────────────────────

/// Focal length of the simulated sensor at the scene's reference resolution.
const SIM_FOCAL_PX: f32 = 450.0;

/// A simulated stereo-depth camera that renders a [`SimScene`].
pub struct SimCamera {
    id: String,
    scene: Arc<SimScene>,
    settings: Option<CameraSettings>,
    frame_interval: Duration,
    last_frame: Option<Instant>,
    fail_open: bool,
    fail_calibration: bool,
}

impl SimCamera {
    pub fn new(id: impl Into<String>, scene: Arc<SimScene>) -> Self {
        Self {
            id: id.into(),
            scene,
            settings: None,
            frame_interval: Duration::from_millis(10),
            last_frame: None,
            fail_open: false,
            fail_calibration: false,
        }
    }

    /// Behave as if no device were attached.
    pub fn unplugged(mut self) -> Self {
        self.fail_open = true;
        self
    }

    /// Make the calibration read fail so callers use fallback intrinsics.
    pub fn without_calibration(mut self) -> Self {
        self.fail_calibration = true;
        self
    }

    pub fn with_frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = interval;
        self
    }
}

impl DepthCamera for SimCamera {
    fn id(&self) -> &str {
        &self.id
    }

    fn open(&mut self, settings: &CameraSettings) -> Result<(), ArmError> {
        if self.fail_open {
            return Err(ArmError::device(&self.id, "no cameras connected"));
        }
        self.settings = Some(*settings);
        debug!(camera = %self.id, "sim camera opened");
        Ok(())
    }

    fn calibration(&mut self) -> Result<CameraIntrinsics, ArmError> {
        let settings = self
            .settings
            .ok_or_else(|| ArmError::device(&self.id, "camera is not open"))?;
        if self.fail_calibration {
            return Err(ArmError::device(&self.id, "calibration EEPROM unreadable"));
        }
        let (rw, rh) = self.scene.reference_size;
        Ok(CameraIntrinsics::new(
            SIM_FOCAL_PX,
            SIM_FOCAL_PX,
            rw as f32 / 2.0,
            rh as f32 / 2.0,
            rw,
            rh,
        )
        .scaled_to(settings.depth_width, settings.depth_height))
    }

    fn next_frames(&mut self, timeout: Duration) -> Result<CapturedFrames, ArmError> {
        let settings = self
            .settings
            .ok_or_else(|| ArmError::device(&self.id, "camera is not open"))?;
        if let Some(last) = self.last_frame {
            let due = self.frame_interval.saturating_sub(last.elapsed());
            std::thread::sleep(due.min(timeout));
            if due > timeout {
                return Ok(CapturedFrames::default());
            }
        }
        self.last_frame = Some(Instant::now());
        Ok(CapturedFrames {
            color: Some(
                self.scene
                    .render_color(settings.color_width, settings.color_height),
            ),
            depth: Some(
                self.scene
                    .render_depth(settings.depth_width, settings.depth_height),
            ),
        })
    }

    fn close(&mut self) {
        self.settings = None;
        self.last_frame = None;
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Simulated arm
// ────────────────────────────────────────────────────────────────────────────

/// Pose the simulated controller reports after homing.
pub const SIM_HOME_POSE: RobotPose = RobotPose {
    position: armsight_types::Position {
        x: 200.0,
        y: 0.0,
        z: 135.0,
    },
    orientation: armsight_types::Orientation { r: 0.0 },
};

/// Every command a [`SimArm`] received, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum ArmCommand {
    Speed { velocity: f32, acceleration: f32 },
    MoveTo(RobotPose),
    Home,
    Suction(bool),
    ReadPose,
    Close,
}

/// Shared state behind a [`SimConnector`] and the arms it hands out.
#[derive(Debug, Default)]
pub struct SimArmState {
    pub commands: Vec<ArmCommand>,
    pub pose: RobotPose,
    pub suction: bool,
    pub connect_attempts: usize,
    pub connected_port: Option<String>,
    /// Refuse every connection attempt.
    pub refuse_connections: bool,
    /// Zero-based index of the `move_to` call that the controller rejects.
    pub fail_move_index: Option<usize>,
    /// Make every `pose` read fail.
    pub fail_pose_reads: bool,
    moves: usize,
}

impl SimArmState {
    /// Only the `MoveTo` targets, in order.
    pub fn moves(&self) -> Vec<RobotPose> {
        self.commands
            .iter()
            .filter_map(|c| match c {
                ArmCommand::MoveTo(p) => Some(*p),
                _ => None,
            })
            .collect()
    }
}

/// A simulated arm session.  Always succeeds unless the shared
/// [`SimArmState`] says otherwise.
pub struct SimArm {
    state: Arc<Mutex<SimArmState>>,
}

impl ArmDriver for SimArm {
    fn set_speed(&mut self, velocity: f32, acceleration: f32) -> Result<(), ArmError> {
        self.state.lock().commands.push(ArmCommand::Speed {
            velocity,
            acceleration,
        });
        Ok(())
    }

    fn move_to(&mut self, target: RobotPose) -> Result<(), ArmError> {
        let mut state = self.state.lock();
        let index = state.moves;
        state.moves += 1;
        if state.fail_move_index == Some(index) {
            return Err(ArmError::device("sim_arm", "controller rejected target"));
        }
        state.commands.push(ArmCommand::MoveTo(target));
        state.pose = target;
        Ok(())
    }

    fn home(&mut self) -> Result<(), ArmError> {
        let mut state = self.state.lock();
        state.commands.push(ArmCommand::Home);
        state.pose = SIM_HOME_POSE;
        Ok(())
    }

    fn pose(&mut self) -> Result<RobotPose, ArmError> {
        let mut state = self.state.lock();
        state.commands.push(ArmCommand::ReadPose);
        if state.fail_pose_reads {
            return Err(ArmError::device("sim_arm", "pose read timed out"));
        }
        Ok(state.pose)
    }

    fn set_suction(&mut self, on: bool) -> Result<(), ArmError> {
        let mut state = self.state.lock();
        state.commands.push(ArmCommand::Suction(on));
        state.suction = on;
        Ok(())
    }

    fn close(&mut self) -> Result<(), ArmError> {
        let mut state = self.state.lock();
        state.commands.push(ArmCommand::Close);
        state.connected_port = None;
        Ok(())
    }
}

/// Hands out [`SimArm`] sessions that share one [`SimArmState`].
#[derive(Clone, Default)]
pub struct SimConnector {
    state: Arc<Mutex<SimArmState>>,
}

impl SimConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with the arm resting at `pose`.
    pub fn at_pose(pose: RobotPose) -> Self {
        let connector = Self::default();
        connector.state.lock().pose = pose;
        connector
    }

    /// Shared state for assertions and fault injection.
    pub fn state(&self) -> Arc<Mutex<SimArmState>> {
        self.state.clone()
    }
}

impl ArmConnector for SimConnector {
    fn connect(&self, port: &str) -> Result<Box<dyn ArmDriver>, ArmError> {
        let mut state = self.state.lock();
        state.connect_attempts += 1;
        if state.refuse_connections {
            return Err(ArmError::device(port, "no response on serial port"));
        }
        state.connected_port = Some(port.to_string());
        Ok(Box::new(SimArm {
            state: self.state.clone(),
        }))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Rig
// ────────────────────────────────────────────────────────────────────────────

/// A whole simulated bench: one scene, the camera looking at it, and an arm.
#[derive(Clone)]
pub struct SimRig {
    pub scene: Arc<SimScene>,
    pub connector: SimConnector,
    pub frame_interval: Duration,
}

impl SimRig {
    pub fn new(scene: SimScene) -> Self {
        Self {
            scene: Arc::new(scene),
            connector: SimConnector::at_pose(SIM_HOME_POSE),
            frame_interval: Duration::from_millis(33),
        }
    }

    /// Table 600 mm below the camera with three objects on it.
    pub fn demo() -> Self {
        Self::new(
            SimScene::new(600)
                .with_block(SimBlock::new("red block", [220, 30, 30], (300, 180, 340, 220), 40))
                .with_block(SimBlock::new("blue cup", [30, 60, 220], (100, 100, 140, 160), 80))
                .with_block(SimBlock::new("silver can", [200, 200, 210], (460, 240, 540, 320), 60).reflective()),
        )
    }

    pub fn with_frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = interval;
        self
    }

    /// A fresh camera driver over this rig's scene.
    pub fn camera(&self) -> SimCamera {
        SimCamera::new("sim_camera", self.scene.clone()).with_frame_interval(self.frame_interval)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn scene() -> Arc<SimScene> {
        Arc::new(
            SimScene::new(600)
                .with_block(SimBlock::new("red block", [220, 30, 30], (300, 180, 340, 220), 40))
                .with_block(
                    SimBlock::new("silver can", [200, 200, 210], (100, 100, 160, 160), 80)
                        .reflective(),
                ),
        )
    }

    #[test]
    fn scene_find_matches_all_words() {
        let scene = scene();
        assert_eq!(scene.find("the red block").map(|b| b.center()), Some(Pixel::new(320, 200)));
        assert!(scene.find("blue block").is_none());
    }

    #[test]
    fn rendered_depth_reflects_block_height() {
        let scene = scene();
        let depth = scene.render_depth(320, 200);
        // Reference pixel (320, 200) is depth pixel (160, 100).
        assert_eq!(depth.at(160, 100), 560);
        assert_eq!(depth.at(5, 5), 600);
    }

    #[test]
    fn reflective_block_has_hollow_depth() {
        let scene = scene();
        let depth = scene.render_depth(640, 400);
        assert_eq!(depth.at(130, 130), 0);
        assert_eq!(depth.at(100, 130), 520);
    }

    #[test]
    fn rendered_color_paints_blocks() {
        let scene = scene();
        let color = scene.render_color(640, 400);
        assert_eq!(color.pixel(320, 200), Some([220, 30, 30]));
        assert_eq!(color.pixel(0, 0), Some(scene.table_color));
    }

    #[test]
    fn camera_requires_open_before_capture() {
        let mut cam = SimCamera::new("sim", scene());
        assert!(cam.next_frames(Duration::from_millis(1)).is_err());
        cam.open(&CameraSettings::default()).unwrap();
        let frames = cam.next_frames(Duration::from_millis(1)).unwrap();
        let depth = frames.depth.unwrap();
        assert_eq!((depth.width, depth.height), (320, 192));
        assert_eq!(frames.color.unwrap().width, 640);
    }

    #[test]
    fn camera_respects_frame_cadence() {
        let mut cam = SimCamera::new("sim", scene()).with_frame_interval(Duration::from_secs(60));
        cam.open(&CameraSettings::default()).unwrap();
        assert!(cam.next_frames(Duration::from_millis(1)).unwrap().color.is_some());
        // The next frame is not due for a minute.
        let frames = cam.next_frames(Duration::from_millis(5)).unwrap();
        assert!(frames.color.is_none() && frames.depth.is_none());
    }

    #[test]
    fn unplugged_camera_fails_to_open() {
        let mut cam = SimCamera::new("sim", scene()).unplugged();
        let err = cam.open(&CameraSettings::default()).unwrap_err();
        assert!(matches!(err, ArmError::DeviceUnavailable { .. }));
    }

    #[test]
    fn calibration_matches_depth_resolution() {
        let mut cam = SimCamera::new("sim", scene());
        cam.open(&CameraSettings::default()).unwrap();
        let k = cam.calibration().unwrap();
        assert_eq!((k.width, k.height), (320, 192));
        assert!((k.fx - SIM_FOCAL_PX / 2.0).abs() < 1e-4);
    }

    #[test]
    fn connector_records_commands() {
        let connector = SimConnector::new();
        let mut arm = connector.connect("/dev/ttyACM0").unwrap();
        arm.home().unwrap();
        arm.move_to(RobotPose::new(1.0, 2.0, 3.0, 0.0)).unwrap();
        arm.set_suction(true).unwrap();

        let state = connector.state();
        let state = state.lock();
        assert_eq!(state.connect_attempts, 1);
        assert_eq!(state.connected_port.as_deref(), Some("/dev/ttyACM0"));
        assert_eq!(state.commands[0], ArmCommand::Home);
        assert_eq!(state.moves(), vec![RobotPose::new(1.0, 2.0, 3.0, 0.0)]);
        assert!(state.suction);
    }

    #[test]
    fn injected_move_failure_hits_requested_index() {
        let connector = SimConnector::new();
        connector.state().lock().fail_move_index = Some(1);
        let mut arm = connector.connect("port").unwrap();
        assert!(arm.move_to(RobotPose::new(1.0, 0.0, 0.0, 0.0)).is_ok());
        assert!(arm.move_to(RobotPose::new(2.0, 0.0, 0.0, 0.0)).is_err());
        assert!(arm.move_to(RobotPose::new(3.0, 0.0, 0.0, 0.0)).is_ok());
    }

    #[test]
    fn demo_rig_shares_its_scene() {
        let rig = SimRig::demo();
        assert!(rig.scene.find("blue cup").is_some());
        assert_eq!(rig.connector.state().lock().pose, SIM_HOME_POSE);
        assert_eq!(rig.camera().id(), "sim_camera");
    }

    #[test]
    fn refused_connection_still_counts_attempt() {
        let connector = SimConnector::new();
        connector.state().lock().refuse_connections = true;
        assert!(connector.connect("port").is_err());
        assert_eq!(connector.state().lock().connect_attempts, 1);
    }
}
