//! [`FrameBus`] – owner of the depth camera and its acquisition thread.
//!
//! The camera delivers frames on its own cadence while consumers
//! (localization, display streaming) read at unpredictable rates.  Each stream
//! is therefore published through a [`tokio::sync::watch`] channel, which
//! behaves like a queue of capacity one that never blocks: the producer
//! overwrites the previous frame and every reader sees the most recent one.
//!
//! # Lifecycle
//!
//! | Call | Effect |
//! |---|---|
//! | [`FrameBus::start`] | Opens the device, reads calibration (falling back to defaults), opens a new session, spawns the acquisition thread. No-op while running. |
//! | [`FrameBus::stop`] | Stops the thread, closes the device, clears the latest frames. Always leaves `running == false`. |
//!
//! Frames and [`SpatialPoint`]s carry the session id they were produced in so
//! that stale results can be rejected after a restart.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use armsight_hal::camera::{CameraSettings, DepthCamera};
use armsight_types::{ArmError, CameraIntrinsics, ColorFrame, DepthFrame, SpatialPoint};
use parking_lot::{Mutex as SlotLock, RwLock};
use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info, warn};

/// How long the acquisition thread waits on the device per poll.  Bounds how
/// long [`FrameBus::stop`] can take.
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Consecutive device errors after which the acquisition thread gives up.
const MAX_CONSECUTIVE_FAILURES: u32 = 10;

type Latest<T> = Arc<watch::Sender<Option<Arc<T>>>>;

/// Hands the driver to the acquisition thread.  Still full if the thread
/// never ran.
type CameraSlot = Arc<SlotLock<Option<Box<dyn DepthCamera>>>>;

/// Bounded wait for a first frame while the camera warms up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Extra reads after the first one.
    pub retries: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 5,
            backoff: Duration::from_millis(50),
        }
    }
}

enum BusState {
    /// Device closed; the bus holds the driver.
    Idle(Box<dyn DepthCamera>),
    /// The acquisition thread owns the driver and hands it back on join.
    Running(Acquisition),
    /// The driver was lost to a panicked worker.
    Lost,
}

struct Acquisition {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<Option<Box<dyn DepthCamera>>>,
}

/// Process-wide owner of one depth camera.
///
/// Construct with the driver to own, share behind an [`Arc`], and call
/// [`start`](Self::start) before reading frames.
pub struct FrameBus {
    camera_id: String,
    settings: CameraSettings,
    state: Mutex<BusState>,
    color: Latest<ColorFrame>,
    depth: Latest<DepthFrame>,
    running: Arc<AtomicBool>,
    session: AtomicU64,
    intrinsics: RwLock<Option<CameraIntrinsics>>,
}

impl FrameBus {
    pub fn new(camera: Box<dyn DepthCamera>, settings: CameraSettings) -> Self {
        let (color, _) = watch::channel(None);
        let (depth, _) = watch::channel(None);
        Self {
            camera_id: camera.id().to_string(),
            settings,
            state: Mutex::new(BusState::Idle(camera)),
            color: Arc::new(color),
            depth: Arc::new(depth),
            running: Arc::new(AtomicBool::new(false)),
            session: AtomicU64::new(0),
            intrinsics: RwLock::new(None),
        }
    }

    /// Open the device and start acquisition.  Idempotent while running.
    ///
    /// # Errors
    ///
    /// Returns [`ArmError::DeviceUnavailable`] if the device cannot be opened;
    /// the device is closed again and the bus stays stopped.
    pub async fn start(&self) -> Result<(), ArmError> {
        let mut state = self.state.lock().await;

        if let BusState::Running(acq) = &*state {
            if !acq.handle.is_finished() {
                return Ok(());
            }
            // The worker gave up after repeated device errors; reclaim the
            // driver and open it again.
            warn!(camera = %self.camera_id, "acquisition thread exited; restarting camera");
            self.reclaim(&mut state).await?;
        }

        let camera = match std::mem::replace(&mut *state, BusState::Lost) {
            BusState::Idle(camera) => camera,
            _ => {
                return Err(ArmError::device(
                    &self.camera_id,
                    "camera driver was lost by a failed worker",
                ));
            }
        };

        let settings = self.settings;
        let opened = tokio::task::spawn_blocking(move || {
            let mut camera = camera;
            match camera.open(&settings) {
                Ok(()) => {
                    let calibration = camera.calibration();
                    Ok((camera, calibration))
                }
                Err(e) => {
                    camera.close();
                    Err((camera, e))
                }
            }
        })
        .await
        .map_err(|e| ArmError::device(&self.camera_id, format!("open task failed: {e}")))?;

        let (camera, calibration) = match opened {
            Ok(v) => v,
            Err((camera, e)) => {
                *state = BusState::Idle(camera);
                self.running.store(false, Ordering::SeqCst);
                error!(camera = %self.camera_id, error = %e, "failed to start camera");
                return Err(e);
            }
        };

        let intrinsics = calibration.unwrap_or_else(|e| {
            warn!(camera = %self.camera_id, error = %e, "calibration unavailable; using fallback intrinsics");
            CameraIntrinsics::fallback(settings.depth_width, settings.depth_height)
        });
        *self.intrinsics.write() = Some(intrinsics);

        let session = self.session.fetch_add(1, Ordering::SeqCst) + 1;
        self.color.send_replace(None);
        self.depth.send_replace(None);

        let stop = Arc::new(AtomicBool::new(false));
        let worker = AcquisitionWorker {
            camera_id: self.camera_id.clone(),
            stop: stop.clone(),
            running: self.running.clone(),
            color: self.color.clone(),
            depth: self.depth.clone(),
            intrinsics,
            session,
        };
        self.running.store(true, Ordering::SeqCst);
        let slot: CameraSlot = Arc::new(SlotLock::new(Some(camera)));
        let worker_slot = slot.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("frame-bus-{}", self.camera_id))
            .spawn(move || {
                let camera = worker_slot.lock().take()?;
                Some(worker.run(camera))
            });
        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => return Err(self.unwind_start(&mut state, &slot, &e.to_string()).await),
        };

        *state = BusState::Running(Acquisition { stop, handle });
        info!(camera = %self.camera_id, session, "camera started");
        Ok(())
    }

    /// Stop acquisition and release the device.  Safe to call when stopped.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        self.running.store(false, Ordering::SeqCst);
        if matches!(*state, BusState::Running(_)) {
            if let Err(e) = self.reclaim(&mut state).await {
                error!(camera = %self.camera_id, error = %e, "error stopping camera");
            }
        }
        self.color.send_replace(None);
        self.depth.send_replace(None);
        info!(camera = %self.camera_id, "camera stopped");
    }

    // The acquisition thread never ran: close the opened device and put it
    // back into `Idle` so a later start can retry.
    async fn unwind_start(&self, state: &mut BusState, slot: &CameraSlot, reason: &str) -> ArmError {
        self.running.store(false, Ordering::SeqCst);
        error!(camera = %self.camera_id, reason, "cannot spawn acquisition thread");
        let camera = slot.lock().take();
        if let Some(mut camera) = camera {
            let closed = tokio::task::spawn_blocking(move || {
                camera.close();
                camera
            })
            .await;
            match closed {
                Ok(camera) => *state = BusState::Idle(camera),
                Err(e) => warn!(camera = %self.camera_id, error = %e, "close task failed; camera driver lost"),
            }
        }
        ArmError::device(&self.camera_id, format!("cannot spawn acquisition thread: {reason}"))
    }

    // Join the acquisition thread and put the driver back into `Idle`.
    async fn reclaim(&self, state: &mut BusState) -> Result<(), ArmError> {
        let BusState::Running(acq) = std::mem::replace(state, BusState::Lost) else {
            return Ok(());
        };
        acq.stop.store(true, Ordering::SeqCst);
        let joined = tokio::task::spawn_blocking(move || acq.handle.join())
            .await
            .map_err(|e| ArmError::device(&self.camera_id, format!("join task failed: {e}")))?;
        match joined {
            Ok(Some(camera)) => {
                *state = BusState::Idle(camera);
                Ok(())
            }
            Ok(None) => Err(ArmError::device(&self.camera_id, "acquisition thread never received the camera")),
            Err(_) => Err(ArmError::device(
                &self.camera_id,
                "acquisition thread panicked",
            )),
        }
    }

    /// Whether the acquisition thread is currently delivering frames.
    pub fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Most recent color frame, or `None` if none has arrived.  Never blocks.
    pub fn get_color_frame(&self) -> Option<Arc<ColorFrame>> {
        if !self.running() {
            return None;
        }
        self.color.borrow().clone()
    }

    /// Most recent depth frame, or `None` if none has arrived.  Never blocks.
    pub fn get_depth_frame(&self) -> Option<Arc<DepthFrame>> {
        if !self.running() {
            return None;
        }
        self.depth.borrow().clone()
    }

    /// Latest color frame, retrying with backoff while none has arrived.
    ///
    /// # Errors
    ///
    /// Returns [`ArmError::DeviceUnavailable`] when the bus is stopped or no
    /// frame arrives within the retry budget.
    pub async fn await_color_frame(&self, policy: RetryPolicy) -> Result<Arc<ColorFrame>, ArmError> {
        self.poll_latest("color", policy, || self.get_color_frame()).await
    }

    /// Latest depth frame, retrying with backoff while none has arrived.
    ///
    /// # Errors
    ///
    /// Same as [`await_color_frame`](Self::await_color_frame).
    pub async fn await_depth_frame(&self, policy: RetryPolicy) -> Result<Arc<DepthFrame>, ArmError> {
        self.poll_latest("depth", policy, || self.get_depth_frame()).await
    }

    async fn poll_latest<T>(
        &self,
        stream: &str,
        policy: RetryPolicy,
        read: impl Fn() -> Option<Arc<T>>,
    ) -> Result<Arc<T>, ArmError> {
        if !self.running() {
            return Err(ArmError::device(&self.camera_id, "camera is not running"));
        }
        for attempt in 0..=policy.retries {
            if let Some(frame) = read() {
                return Ok(frame);
            }
            if attempt < policy.retries {
                debug!(camera = %self.camera_id, stream, attempt, "no frame yet; waiting");
                tokio::time::sleep(policy.backoff).await;
            }
        }
        Err(ArmError::device(
            &self.camera_id,
            format!("could not get {stream} frame"),
        ))
    }

    /// Change-notifying view of the color stream for display clients.
    pub fn subscribe_color(&self) -> watch::Receiver<Option<Arc<ColorFrame>>> {
        self.color.subscribe()
    }

    /// Intrinsics of the current (or last) session's depth stream.
    pub fn intrinsics(&self) -> Option<CameraIntrinsics> {
        *self.intrinsics.read()
    }

    /// Current camera session id; `0` before the first start.
    pub fn session(&self) -> u64 {
        self.session.load(Ordering::SeqCst)
    }

    /// Whether `point` was sampled in the current, still running, session.
    /// Caller-supplied points (no session) are always accepted.
    pub fn is_current(&self, point: &SpatialPoint) -> bool {
        match point.session {
            Some(s) => self.running() && s == self.session(),
            None => true,
        }
    }

    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }
}

impl Drop for FrameBus {
    fn drop(&mut self) {
        if let BusState::Running(acq) = self.state.get_mut() {
            acq.stop.store(true, Ordering::SeqCst);
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Acquisition thread
// ────────────────────────────────────────────────────────────────────────────

struct AcquisitionWorker {
    camera_id: String,
    stop: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    color: Latest<ColorFrame>,
    depth: Latest<DepthFrame>,
    intrinsics: CameraIntrinsics,
    session: u64,
}

impl AcquisitionWorker {
    fn run(self, mut camera: Box<dyn DepthCamera>) -> Box<dyn DepthCamera> {
        let mut sequence = 0u64;
        let mut failures = 0u32;
        while !self.stop.load(Ordering::SeqCst) {
            match camera.next_frames(POLL_TIMEOUT) {
                Ok(frames) => {
                    failures = 0;
                    if frames.color.is_none() && frames.depth.is_none() {
                        continue;
                    }
                    sequence += 1;
                    if let Some(color) = frames.color {
                        self.color
                            .send_replace(Some(Arc::new(color.with_session(self.session, sequence))));
                    }
                    if let Some(depth) = frames.depth {
                        let depth = depth
                            .with_intrinsics(self.intrinsics)
                            .with_session(self.session, sequence);
                        self.depth.send_replace(Some(Arc::new(depth)));
                    }
                }
                Err(e) => {
                    failures += 1;
                    warn!(camera = %self.camera_id, error = %e, failures, "frame acquisition failed");
                    if failures >= MAX_CONSECUTIVE_FAILURES {
                        error!(camera = %self.camera_id, "too many acquisition failures; stopping stream");
                        self.running.store(false, Ordering::SeqCst);
                        break;
                    }
                    std::thread::sleep(POLL_TIMEOUT);
                }
            }
        }
        camera.close();
        debug!(camera = %self.camera_id, frames = sequence, "acquisition thread exiting");
        camera
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use armsight_hal::sim::{SimBlock, SimCamera, SimScene};

    fn scene() -> Arc<SimScene> {
        Arc::new(
            SimScene::new(600)
                .with_block(SimBlock::new("red block", [220, 30, 30], (300, 180, 340, 220), 40)),
        )
    }

    fn bus(camera: SimCamera) -> FrameBus {
        FrameBus::new(Box::new(camera), CameraSettings::default())
    }

    async fn wait_for_color(bus: &FrameBus) -> Arc<ColorFrame> {
        for _ in 0..200 {
            if let Some(frame) = bus.get_color_frame() {
                return frame;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("no color frame within 1 s");
    }

    #[tokio::test]
    async fn no_frames_before_start() {
        let bus = bus(SimCamera::new("sim", scene()));
        assert!(!bus.running());
        assert!(bus.get_color_frame().is_none());
        assert!(bus.get_depth_frame().is_none());
        assert_eq!(bus.session(), 0);
    }

    #[tokio::test]
    async fn start_delivers_frames_and_stop_clears_them() -> Result<(), Box<dyn std::error::Error>> {
        let bus = bus(SimCamera::new("sim", scene()));
        bus.start().await?;
        assert!(bus.running());

        let color = wait_for_color(&bus).await;
        assert_eq!((color.width, color.height), (640, 400));
        assert_eq!(color.session, 1);
        let depth = bus.get_depth_frame().ok_or("no depth frame")?;
        assert_eq!((depth.width, depth.height), (320, 192));
        assert_eq!(depth.intrinsics.width, 320);

        bus.stop().await;
        assert!(!bus.running());
        assert!(bus.get_color_frame().is_none());
        Ok(())
    }

    #[tokio::test]
    async fn start_is_idempotent_while_running() -> Result<(), Box<dyn std::error::Error>> {
        let bus = bus(SimCamera::new("sim", scene()));
        bus.start().await?;
        bus.start().await?;
        assert_eq!(bus.session(), 1);
        bus.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn restart_opens_new_session() -> Result<(), Box<dyn std::error::Error>> {
        let bus = bus(SimCamera::new("sim", scene()));
        bus.start().await?;
        let point = SpatialPoint::new(0.0, 0.0, 500.0).in_session(bus.session());
        assert!(bus.is_current(&point));

        bus.stop().await;
        bus.start().await?;
        assert_eq!(bus.session(), 2);
        assert!(!bus.is_current(&point));
        assert!(bus.is_current(&SpatialPoint::new(0.0, 0.0, 1.0)));
        bus.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn failed_start_unwinds_and_can_be_retried() {
        let bus = bus(SimCamera::new("sim", scene()).unplugged());
        let err = bus.start().await.unwrap_err();
        assert!(matches!(err, ArmError::DeviceUnavailable { .. }));
        assert!(!bus.running());
        // The driver is back in the idle slot, so a retry reaches the device
        // again instead of reporting a lost driver.
        let err = bus.start().await.unwrap_err();
        assert!(err.to_string().contains("no cameras connected"));
    }

    #[tokio::test]
    async fn missing_calibration_falls_back_to_defaults() -> Result<(), Box<dyn std::error::Error>> {
        let bus = bus(SimCamera::new("sim", scene()).without_calibration());
        bus.start().await?;
        let k = bus.intrinsics().ok_or("no intrinsics")?;
        assert_eq!(k, CameraIntrinsics::fallback(320, 192));
        bus.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn repeated_reads_return_the_same_latest_frame() -> Result<(), Box<dyn std::error::Error>> {
        let camera = SimCamera::new("sim", scene()).with_frame_interval(Duration::from_secs(60));
        let bus = Arc::new(bus(camera));
        bus.start().await?;
        let first = wait_for_color(&bus).await;

        let readers: Vec<_> = (0..8)
            .map(|_| {
                let bus = bus.clone();
                tokio::spawn(async move { bus.get_color_frame() })
            })
            .collect();
        for reader in readers {
            let frame = reader.await?.ok_or("frame vanished")?;
            assert!(Arc::ptr_eq(&frame, &first));
        }
        bus.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn awaiting_a_frame_on_a_stopped_bus_fails_fast() {
        let bus = bus(SimCamera::new("sim", scene()));
        let err = bus.await_depth_frame(RetryPolicy::default()).await.unwrap_err();
        assert!(err.to_string().contains("not running"));
    }

    #[tokio::test]
    async fn awaiting_a_frame_rides_out_warm_up() -> Result<(), Box<dyn std::error::Error>> {
        let bus = bus(SimCamera::new("sim", scene()));
        bus.start().await?;
        let policy = RetryPolicy {
            retries: 100,
            backoff: Duration::from_millis(10),
        };
        let depth = bus.await_depth_frame(policy).await?;
        assert_eq!(depth.session, bus.session());
        bus.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn subscribers_see_new_frames() -> Result<(), Box<dyn std::error::Error>> {
        let bus = bus(SimCamera::new("sim", scene()));
        let mut rx = bus.subscribe_color();
        bus.start().await?;
        tokio::time::timeout(Duration::from_secs(1), rx.wait_for(|f| f.is_some())).await??;
        bus.stop().await;
        Ok(())
    }

    /// Counts `close` calls on a wrapped [`SimCamera`].
    struct CountingCamera {
        inner: SimCamera,
        closes: Arc<std::sync::atomic::AtomicUsize>,
    }

    impl DepthCamera for CountingCamera {
        fn id(&self) -> &str {
            self.inner.id()
        }
        fn open(&mut self, settings: &CameraSettings) -> Result<(), ArmError> {
            self.inner.open(settings)
        }
        fn calibration(&mut self) -> Result<CameraIntrinsics, ArmError> {
            self.inner.calibration()
        }
        fn next_frames(&mut self, timeout: Duration) -> Result<armsight_hal::camera::CapturedFrames, ArmError> {
            self.inner.next_frames(timeout)
        }
        fn close(&mut self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
            self.inner.close();
        }
    }

    #[tokio::test]
    async fn failed_thread_launch_closes_camera_and_allows_restart() -> Result<(), Box<dyn std::error::Error>> {
        let closes = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let camera = CountingCamera {
            inner: SimCamera::new("sim", scene()).with_frame_interval(Duration::from_millis(5)),
            closes: closes.clone(),
        };
        let bus = FrameBus::new(Box::new(camera), CameraSettings::default());

        {
            let mut state = bus.state.lock().await;
            let BusState::Idle(mut camera) = std::mem::replace(&mut *state, BusState::Lost) else {
                panic!("new bus must be idle");
            };
            camera.open(&CameraSettings::default())?;
            let slot: CameraSlot = Arc::new(SlotLock::new(Some(camera)));
            bus.running.store(true, Ordering::SeqCst);

            let err = bus.unwind_start(&mut state, &slot, "out of threads").await;
            assert!(matches!(err, ArmError::DeviceUnavailable { .. }));
            assert!(matches!(*state, BusState::Idle(_)));
        }
        assert!(!bus.running());
        assert_eq!(closes.load(Ordering::SeqCst), 1);

        bus.start().await?;
        assert!(bus.running());
        wait_for_color(&bus).await;
        bus.stop().await;
        Ok(())
    }
}
