//! [`MotionSequencer`] – connection owner, primitive motions, and the
//! composite pick/place sequences.
//!
//! # Connection state machine
//!
//! ```text
//!  Disconnected ──connect ok──► Connected ──disconnect──► Disconnected
//!       ▲                          │
//!       └───driver call failed─────┘
//! ```
//!
//! Every primitive requires `Connected` and makes exactly one reconnect
//! attempt when it is not.  A driver call that fails closes the link, so the
//! next primitive reopens it.  Driver calls block for seconds, so each runs
//! on tokio's blocking pool while the async state lock is held; concurrent
//! callers queue on the lock instead of racing on the serial link.
//!
//! The blocking task borrows the driver through a shared handle.  A caller
//! that drops a primitive mid-flight (e.g. under `tokio::time::timeout`)
//! leaves the link connected; the motion finishes in the background and the
//! next caller waits for it on the driver lock.
//!
//! # Composite sequences
//!
//! | Sequence | Steps |
//! |---|---|
//! | [`pick_up`](MotionSequencer::pick_up) | `resolve_target` → `read_pose` → `open_gripper` → `approach` → `descend` → `close_gripper` → `lift` |
//! | [`place`](MotionSequencer::place) | `resolve_target` → `read_pose` → `approach` → `descend` → `release` → `retreat` |
//!
//! A failing step aborts the rest of the sequence.  Completed steps are not
//! undone; the error names the failed step and lists the completed ones so a
//! caller can decide how to recover.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use armsight_hal::arm::{ArmConnector, ArmDriver};
use armsight_perception::localizer::{LocateRequest, Localization, SpatialLocalizer};
use armsight_types::{ArmError, ConnectionState, GripperState, Position, RobotPose, SpatialPoint};
use parking_lot::{Mutex as DriverLock, RwLock};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

use crate::affine::{AffineCalibration, DEFAULT_BLOCK_HEIGHT_MM, DEFAULT_Z_ABOVE_MM};
use crate::config::MotionConfig;
use crate::mount::camera_to_robot;

/// Device name used in [`ArmError::DeviceUnavailable`].
const ARM_DEVICE: &str = "arm";

// ────────────────────────────────────────────────────────────────────────────
// Public types
// ────────────────────────────────────────────────────────────────────────────

/// One step of a composite sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SequenceStep {
    ResolveTarget,
    ReadPose,
    OpenGripper,
    Approach,
    Descend,
    CloseGripper,
    Lift,
    Release,
    Retreat,
}

impl SequenceStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            SequenceStep::ResolveTarget => "resolve_target",
            SequenceStep::ReadPose => "read_pose",
            SequenceStep::OpenGripper => "open_gripper",
            SequenceStep::Approach => "approach",
            SequenceStep::Descend => "descend",
            SequenceStep::CloseGripper => "close_gripper",
            SequenceStep::Lift => "lift",
            SequenceStep::Release => "release",
            SequenceStep::Retreat => "retreat",
        }
    }
}

impl fmt::Display for SequenceStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a composite sequence acts on.
#[derive(Debug, Clone)]
pub enum Target {
    /// A camera-frame point supplied by the caller.
    Point(SpatialPoint),
    /// Located through the configured [`SpatialLocalizer`].
    Describe(String),
    /// A result from an earlier `locate` call.
    Located(Localization),
}

/// Pose read together with whether it came from hardware.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PoseReading {
    #[serde(flatten)]
    pub pose: RobotPose,
    /// `true` when the arm could not be read and the cached pose is returned.
    pub stale: bool,
    pub gripper: GripperState,
}

/// Result of a successful composite sequence.
#[derive(Debug, Clone, Serialize)]
pub struct SequenceReport {
    pub label: String,
    /// Camera-frame target.
    pub target: SpatialPoint,
    /// End-effector pose the transform was computed against.
    pub reference: RobotPose,
    /// Robot-frame position the end-effector reached at the bottom of the
    /// sequence.
    pub contact: Position,
    /// Position at the end of the sequence.
    pub finish: Position,
    pub image_id: Option<String>,
    pub steps: Vec<SequenceStep>,
}

// ────────────────────────────────────────────────────────────────────────────
// Internal state
// ────────────────────────────────────────────────────────────────────────────

/// Driver handle shared with the blocking task running a call.
type SharedDriver = Arc<DriverLock<Box<dyn ArmDriver>>>;

struct ArmState {
    connection: ConnectionState,
    driver: Option<SharedDriver>,
    port: String,
    pose: RobotPose,
    gripper: GripperState,
}

struct ResolvedTarget {
    point: SpatialPoint,
    label: String,
    image_id: Option<String>,
}

/// Completed steps of a running sequence.
#[derive(Default)]
struct StepLog {
    completed: Vec<SequenceStep>,
}

impl StepLog {
    fn record<T>(&mut self, step: SequenceStep, result: Result<T, ArmError>) -> Result<T, ArmError> {
        match result {
            Ok(value) => {
                debug!(%step, "step complete");
                self.completed.push(step);
                Ok(value)
            }
            Err(e) => {
                let completed: Vec<&str> = self.completed.iter().map(SequenceStep::as_str).collect();
                error!(%step, error = %e, ?completed, "sequence aborted");
                Err(ArmError::motion(
                    step.as_str(),
                    format!("{e} (completed: [{}])", completed.join(", ")),
                ))
            }
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// MotionSequencer
// ────────────────────────────────────────────────────────────────────────────

/// Owns the arm connection and runs every motion.
pub struct MotionSequencer {
    connector: Arc<dyn ArmConnector>,
    config: MotionConfig,
    state: Mutex<ArmState>,
    sequence: Mutex<()>,
    affine: RwLock<Option<AffineCalibration>>,
    localizer: Option<Arc<SpatialLocalizer>>,
}

impl MotionSequencer {
    pub fn new(connector: Arc<dyn ArmConnector>, config: MotionConfig) -> Self {
        let state = ArmState {
            connection: ConnectionState::Disconnected,
            driver: None,
            port: config.port.clone(),
            pose: RobotPose::default(),
            gripper: GripperState::Unknown,
        };
        Self {
            connector,
            config,
            state: Mutex::new(state),
            sequence: Mutex::new(()),
            affine: RwLock::new(None),
            localizer: None,
        }
    }

    /// Resolve [`Target::Describe`] through `localizer`.
    pub fn with_localizer(mut self, localizer: Arc<SpatialLocalizer>) -> Self {
        self.localizer = Some(localizer);
        self
    }

    pub fn config(&self) -> &MotionConfig {
        &self.config
    }

    pub async fn connection(&self) -> ConnectionState {
        self.state.lock().await.connection
    }

    pub async fn port(&self) -> String {
        self.state.lock().await.port.clone()
    }

    // ── Connection ────────────────────────────────────────────────────────

    /// Connect to the arm, optionally on a different port.  A no-op when
    /// already connected.  On success the port becomes the default.
    ///
    /// # Errors
    ///
    /// Returns [`ArmError::DeviceUnavailable`] when nothing answers.
    #[instrument(skip(self))]
    pub async fn connect(&self, port: Option<&str>) -> Result<(), ArmError> {
        let mut state = self.state.lock().await;
        if state.connection == ConnectionState::Connected && state.driver.is_some() {
            return Ok(());
        }
        self.open_link(&mut state, port.map(str::to_string)).await
    }

    /// Close the link.  The state is `Disconnected` afterwards even if the
    /// port could not be released cleanly.
    ///
    /// # Errors
    ///
    /// Returns the driver's error from closing the port.
    #[instrument(skip(self))]
    pub async fn disconnect(&self) -> Result<(), ArmError> {
        let mut state = self.state.lock().await;
        state.connection = ConnectionState::Disconnected;
        let Some(driver) = state.driver.take() else {
            return Ok(());
        };
        let closed = tokio::task::spawn_blocking(move || driver.lock().close())
            .await
            .map_err(|e| ArmError::device(ARM_DEVICE, format!("close task failed: {e}")))?;
        match &closed {
            Ok(()) => info!("arm disconnected"),
            Err(e) => warn!(error = %e, "error closing arm link"),
        }
        closed
    }

    async fn open_link(&self, state: &mut ArmState, port: Option<String>) -> Result<(), ArmError> {
        let port = port.unwrap_or_else(|| state.port.clone());
        info!(%port, "connecting to arm");
        let connector = self.connector.clone();
        let target = port.clone();
        let opened = tokio::task::spawn_blocking(move || connector.connect(&target))
            .await
            .map_err(|e| ArmError::device(ARM_DEVICE, format!("connect task failed: {e}")))?;
        match opened {
            Ok(driver) => {
                state.driver = Some(Arc::new(DriverLock::new(driver)));
                state.connection = ConnectionState::Connected;
                state.port = port;
                info!(port = %state.port, "arm connected");
                Ok(())
            }
            Err(e) => {
                state.driver = None;
                state.connection = ConnectionState::Disconnected;
                error!(%port, error = %e, "arm connection failed");
                Err(e)
            }
        }
    }

    async fn ensure_connected(&self, state: &mut ArmState) -> Result<(), ArmError> {
        if state.connection == ConnectionState::Connected && state.driver.is_some() {
            return Ok(());
        }
        warn!("arm not connected; attempting reconnect");
        self.open_link(state, None).await
    }

    /// Run `op` on the blocking pool against the connected driver.  A failed
    /// call drops the link.
    async fn run_driver<T, F>(&self, state: &mut ArmState, what: &'static str, op: F) -> Result<T, ArmError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Box<dyn ArmDriver>) -> Result<T, ArmError> + Send + 'static,
    {
        let driver = state
            .driver
            .clone()
            .ok_or_else(|| ArmError::device(ARM_DEVICE, "not connected"))?;
        let joined = tokio::task::spawn_blocking(move || op(&mut *driver.lock())).await;
        match joined {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                warn!(call = what, error = %e, "driver call failed; closing link");
                self.drop_link(state).await;
                Err(e)
            }
            Err(e) => {
                // The worker panicked mid-call; the link is in an unknown state.
                self.drop_link(state).await;
                Err(ArmError::device(ARM_DEVICE, format!("{what} worker failed: {e}")))
            }
        }
    }

    async fn drop_link(&self, state: &mut ArmState) {
        state.connection = ConnectionState::Disconnected;
        let Some(driver) = state.driver.take() else {
            return;
        };
        match tokio::task::spawn_blocking(move || driver.lock().close()).await {
            Ok(Ok(())) => debug!("arm link closed"),
            Ok(Err(e)) => warn!(error = %e, "error closing arm link"),
            Err(e) => warn!(error = %e, "close task failed"),
        }
    }

    async fn with_driver<T, F>(&self, state: &mut ArmState, what: &'static str, op: F) -> Result<T, ArmError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Box<dyn ArmDriver>) -> Result<T, ArmError> + Send + 'static,
    {
        self.ensure_connected(state).await?;
        self.run_driver(state, what, op).await
    }

    // ── Primitives ────────────────────────────────────────────────────────

    /// Current pose.  Reads the arm when connected; otherwise, or when the
    /// read fails, returns the cached pose marked stale.  Never reconnects.
    pub async fn get_pose(&self) -> PoseReading {
        let mut state = self.state.lock().await;
        if state.connection != ConnectionState::Connected || state.driver.is_none() {
            warn!("arm not connected; returning cached pose");
            return PoseReading {
                pose: state.pose,
                stale: true,
                gripper: state.gripper,
            };
        }
        match self.run_driver(&mut state, "get_pose", |d| d.pose()).await {
            Ok(pose) => {
                state.pose = pose;
                PoseReading {
                    pose,
                    stale: false,
                    gripper: state.gripper,
                }
            }
            Err(e) => {
                warn!(error = %e, "pose read failed; returning cached pose");
                PoseReading {
                    pose: state.pose,
                    stale: true,
                    gripper: state.gripper,
                }
            }
        }
    }

    /// Joint-interpolated move.  The cached pose is updated on success.
    ///
    /// # Errors
    ///
    /// Returns [`ArmError::DeviceUnavailable`] when the arm is unreachable or
    /// rejects the target.
    #[instrument(skip(self))]
    pub async fn move_to_pose(&self, x: f32, y: f32, z: f32, r: f32) -> Result<(), ArmError> {
        let mut state = self.state.lock().await;
        self.move_locked(&mut state, RobotPose::new(x, y, z, r)).await
    }

    async fn move_locked(&self, state: &mut ArmState, target: RobotPose) -> Result<(), ArmError> {
        let (velocity, acceleration) = (self.config.velocity, self.config.acceleration);
        let settle = Duration::from_millis(self.config.settle_ms);
        let p = target.position;
        info!(x = p.x, y = p.y, z = p.z, r = target.orientation.r, "moving");
        self.with_driver(state, "move_to_pose", move |d| {
            d.set_speed(velocity, acceleration)?;
            d.move_to(target)?;
            std::thread::sleep(settle);
            Ok(())
        })
        .await?;
        state.pose = target;
        Ok(())
    }

    /// Run the homing routine, then refresh the cached pose if the arm
    /// answers.
    ///
    /// # Errors
    ///
    /// Returns [`ArmError::DeviceUnavailable`] when the arm is unreachable.
    #[instrument(skip(self))]
    pub async fn home(&self) -> Result<(), ArmError> {
        let mut state = self.state.lock().await;
        let settle = Duration::from_millis(self.config.settle_ms);
        let pose = self
            .with_driver(&mut state, "home", move |d| {
                d.home()?;
                std::thread::sleep(settle);
                Ok(d.pose())
            })
            .await?;
        match pose {
            Ok(pose) => state.pose = pose,
            Err(e) => warn!(error = %e, "pose read after homing failed; cached pose kept"),
        }
        info!("arm homed");
        Ok(())
    }

    /// Release: suction off.
    ///
    /// # Errors
    ///
    /// Returns [`ArmError::DeviceUnavailable`] when the arm is unreachable.
    #[instrument(skip(self))]
    pub async fn open_gripper(&self) -> Result<(), ArmError> {
        let mut state = self.state.lock().await;
        self.suction_locked(&mut state, false).await
    }

    /// Grip: suction on.
    ///
    /// # Errors
    ///
    /// Returns [`ArmError::DeviceUnavailable`] when the arm is unreachable.
    #[instrument(skip(self))]
    pub async fn close_gripper(&self) -> Result<(), ArmError> {
        let mut state = self.state.lock().await;
        self.suction_locked(&mut state, true).await
    }

    async fn suction_locked(&self, state: &mut ArmState, on: bool) -> Result<(), ArmError> {
        self.with_driver(state, "set_suction", move |d| d.set_suction(on))
            .await?;
        state.gripper = if on { GripperState::Closed } else { GripperState::Open };
        info!(gripper = %state.gripper, "suction {}", if on { "on" } else { "off" });
        Ok(())
    }

    async fn read_pose_locked(&self, state: &mut ArmState) -> Result<RobotPose, ArmError> {
        let pose = self.with_driver(state, "read_pose", |d| d.pose()).await?;
        state.pose = pose;
        Ok(pose)
    }

    // ── Affine calibration ────────────────────────────────────────────────

    /// Install a pixel → robot matrix from nine row-major values.
    ///
    /// # Errors
    ///
    /// Returns [`ArmError::InvalidArgument`] for malformed input; the previous
    /// matrix stays in place.
    pub fn set_affine_matrix(&self, values: &[f64]) -> Result<(), ArmError> {
        let calibration = AffineCalibration::from_flat(values)?;
        *self.affine.write() = Some(calibration);
        info!("affine matrix updated");
        Ok(())
    }

    /// Robot `(x, y)` for image pixel `(u, v)`.
    ///
    /// # Errors
    ///
    /// Returns [`ArmError::InvalidArgument`] when no matrix is set.
    pub fn apply_affine(&self, u: f64, v: f64) -> Result<(f64, f64), ArmError> {
        let calibration = self
            .affine
            .read()
            .ok_or_else(|| ArmError::InvalidArgument("affine matrix not set".into()))?;
        Ok(calibration.apply(u, v))
    }

    /// Hover over image pixel `(u, v)` at `z_above` (default −30 mm).
    ///
    /// # Errors
    ///
    /// As [`apply_affine`](Self::apply_affine) and
    /// [`move_to_pose`](Self::move_to_pose).
    pub async fn move_above_pixel(&self, u: f64, v: f64, z_above: Option<f32>) -> Result<(), ArmError> {
        self.move_to_pixel(u, v, z_above.unwrap_or(DEFAULT_Z_ABOVE_MM)).await
    }

    /// Descend onto the block at image pixel `(u, v)` (default −30 mm).
    ///
    /// # Errors
    ///
    /// As [`move_above_pixel`](Self::move_above_pixel).
    pub async fn move_to_block_pixel(&self, u: f64, v: f64, block_height: Option<f32>) -> Result<(), ArmError> {
        self.move_to_pixel(u, v, block_height.unwrap_or(DEFAULT_BLOCK_HEIGHT_MM))
            .await
    }

    async fn move_to_pixel(&self, u: f64, v: f64, z: f32) -> Result<(), ArmError> {
        let (x, y) = self.apply_affine(u, v)?;
        info!(u, v, x, y, "affine pixel to robot");
        self.move_to_pose(x as f32, y as f32, z, 0.0).await
    }

    // ── Composite sequences ───────────────────────────────────────────────

    async fn resolve(&self, target: Target) -> Result<ResolvedTarget, ArmError> {
        let resolved = match target {
            Target::Point(point) => ResolvedTarget {
                point,
                label: "target".to_string(),
                image_id: None,
            },
            Target::Located(found) => ResolvedTarget {
                point: found.point,
                label: found.label,
                image_id: Some(found.image_id),
            },
            Target::Describe(description) => {
                let localizer = self.localizer.as_ref().ok_or_else(|| {
                    ArmError::InvalidArgument("no localizer configured; pass explicit coordinates".into())
                })?;
                let found = localizer.locate(LocateRequest::describe(description)).await?;
                ResolvedTarget {
                    point: found.point,
                    label: found.label,
                    image_id: Some(found.image_id),
                }
            }
        };
        if let (Some(session), Some(localizer)) = (resolved.point.session, &self.localizer) {
            if !localizer.bus().is_current(&resolved.point) {
                return Err(ArmError::InvalidArgument(format!(
                    "target was located in camera session {session}, which has ended; locate it again"
                )));
            }
        }
        Ok(resolved)
    }

    /// Pick up an object: open, approach, descend, grip, lift.
    ///
    /// The pose is re-read right before the camera → robot transform.
    ///
    /// # Errors
    ///
    /// Target resolution errors pass through unchanged
    /// ([`ArmError::ObjectNotFound`], [`ArmError::InvalidDepth`], …).  Any
    /// later failure is an [`ArmError::MotionFailed`] naming the step.
    #[instrument(skip(self, target))]
    pub async fn pick_up(&self, target: Target) -> Result<SequenceReport, ArmError> {
        let _sequence = self.sequence.lock().await;
        let resolved = self.resolve(target).await?;
        let mut log = StepLog::default();
        log.completed.push(SequenceStep::ResolveTarget);

        let mut state = self.state.lock().await;
        let reference = log.record(SequenceStep::ReadPose, self.read_pose_locked(&mut state).await)?;
        let grasp = camera_to_robot(&resolved.point, &reference, self.config.grip_offset_mm);
        let r = reference.orientation.r;
        info!(label = %resolved.label, x = grasp.x, y = grasp.y, z = grasp.z, "picking up");

        log.record(SequenceStep::OpenGripper, self.suction_locked(&mut state, false).await)?;
        let approach = RobotPose::new(grasp.x, grasp.y, grasp.z, r);
        log.record(SequenceStep::Approach, self.move_locked(&mut state, approach).await)?;
        log.record(SequenceStep::Descend, self.move_locked(&mut state, approach).await)?;
        log.record(SequenceStep::CloseGripper, self.suction_locked(&mut state, true).await)?;
        let lift = RobotPose::new(grasp.x, grasp.y, grasp.z + self.config.lift_offset_mm, r);
        log.record(SequenceStep::Lift, self.move_locked(&mut state, lift).await)?;

        Ok(SequenceReport {
            label: resolved.label,
            target: resolved.point,
            reference,
            contact: grasp,
            finish: lift.position,
            image_id: resolved.image_id,
            steps: log.completed,
        })
    }

    /// Put the held object down at a target: approach above it, descend to
    /// the release clearance, release, retreat.
    ///
    /// # Errors
    ///
    /// Same as [`pick_up`](Self::pick_up).
    #[instrument(skip(self, target))]
    pub async fn place(&self, target: Target) -> Result<SequenceReport, ArmError> {
        let _sequence = self.sequence.lock().await;
        let resolved = self.resolve(target).await?;
        let mut log = StepLog::default();
        log.completed.push(SequenceStep::ResolveTarget);

        let mut state = self.state.lock().await;
        let reference = log.record(SequenceStep::ReadPose, self.read_pose_locked(&mut state).await)?;
        let surface = camera_to_robot(&resolved.point, &reference, self.config.grip_offset_mm);
        let r = reference.orientation.r;
        info!(label = %resolved.label, x = surface.x, y = surface.y, z = surface.z, "placing");

        let above = RobotPose::new(surface.x, surface.y, surface.z + self.config.lift_offset_mm, r);
        let release = RobotPose::new(surface.x, surface.y, surface.z + self.config.place_clearance_mm, r);
        log.record(SequenceStep::Approach, self.move_locked(&mut state, above).await)?;
        log.record(SequenceStep::Descend, self.move_locked(&mut state, release).await)?;
        log.record(SequenceStep::Release, self.suction_locked(&mut state, false).await)?;
        log.record(SequenceStep::Retreat, self.move_locked(&mut state, above).await)?;

        Ok(SequenceReport {
            label: resolved.label,
            target: resolved.point,
            reference,
            contact: release.position,
            finish: above.position,
            image_id: resolved.image_id,
            steps: log.completed,
        })
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
