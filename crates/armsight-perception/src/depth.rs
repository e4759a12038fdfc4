//! [`DepthSampler`] – turns a normalized image point into a metric 3-D point.
//!
//! Sampling happens against the *depth* frame's resolution, never the color
//! frame's.  When the depth engine has no reading at the requested pixel the
//! sampler falls back to the median of the valid readings in a small square
//! window around it.

use std::sync::Arc;
use std::time::Duration;

use armsight_types::{ArmError, ColorFrame, DepthFrame, Pixel, SpatialPoint};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::frame_bus::{FrameBus, RetryPolicy};

/// Depth sampling parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DepthConfig {
    /// Readings closer than this are treated as invalid.  Zero is always
    /// invalid; the default accepts every other reading.
    pub near_mm: u16,
    /// Readings farther than this are treated as invalid.
    pub far_mm: u16,
    /// Half-width of the fallback window (5 → an 11×11 window).
    pub roi_half_width: u32,
    /// Extra frame reads while the camera warms up.
    pub frame_retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for DepthConfig {
    fn default() -> Self {
        Self {
            near_mm: 1,
            far_mm: u16::MAX,
            roi_half_width: 5,
            frame_retries: 5,
            retry_backoff_ms: 50,
        }
    }
}

impl DepthConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            retries: self.frame_retries,
            backoff: Duration::from_millis(self.retry_backoff_ms),
        }
    }

    /// Whether a raw reading is usable.
    pub fn is_valid(&self, depth_mm: u16) -> bool {
        depth_mm != 0 && depth_mm >= self.near_mm && depth_mm <= self.far_mm
    }
}

/// Which path produced a depth value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DepthSource {
    /// The reading at the pixel itself.
    Direct,
    /// Median of the window around the pixel.
    Window,
    /// Median of everything under a segmentation mask.
    MaskMedian,
}

/// Result of sampling one point.
#[derive(Debug, Clone)]
pub struct DepthSample {
    pub point: SpatialPoint,
    /// Pixel in the depth frame that was sampled.
    pub pixel: Pixel,
    pub source: DepthSource,
    pub depth_frame: Arc<DepthFrame>,
    /// Color frame from the same moment, for visualization.  Best effort.
    pub color: Option<Arc<ColorFrame>>,
}

/// Median of `values` (must be non-empty after filtering by the caller).
/// Even-length inputs average the two middle values.
pub fn median_mm(values: &mut [u16]) -> Option<f32> {
    if values.is_empty() {
        return None;
    }
    values.sort_unstable();
    let mid = values.len() / 2;
    if values.len() % 2 == 1 {
        Some(values[mid] as f32)
    } else {
        Some((values[mid - 1] as f32 + values[mid] as f32) / 2.0)
    }
}

/// Map normalized `[0, 1]` coordinates to a pixel of a `width`×`height`
/// frame.  Out-of-range inputs are clamped to the border.
pub fn normalized_to_pixel(norm_x: f32, norm_y: f32, width: u32, height: u32) -> Pixel {
    let clamp = |v: f32, extent: u32| -> u32 {
        let max = extent.saturating_sub(1) as i64;
        ((v * extent as f32) as i64).clamp(0, max) as u32
    };
    Pixel::new(clamp(norm_x, width), clamp(norm_y, height))
}

/// Sample `frame` at normalized `(norm_x, norm_y)`.
///
/// # Errors
///
/// Returns [`ArmError::InvalidDepth`] when neither the pixel nor its window
/// holds a valid reading.
pub fn sample_frame(
    frame: &DepthFrame,
    norm_x: f32,
    norm_y: f32,
    config: &DepthConfig,
) -> Result<(SpatialPoint, Pixel, DepthSource), ArmError> {
    let pixel = normalized_to_pixel(norm_x, norm_y, frame.width, frame.height);

    let direct = frame.at(pixel.x, pixel.y);
    let (z, source) = if config.is_valid(direct) {
        (direct as f32, DepthSource::Direct)
    } else {
        let r = config.roi_half_width;
        let x0 = pixel.x.saturating_sub(r);
        let y0 = pixel.y.saturating_sub(r);
        let x1 = (pixel.x + r + 1).min(frame.width);
        let y1 = (pixel.y + r + 1).min(frame.height);
        let mut window: Vec<u16> = (y0..y1)
            .flat_map(|y| (x0..x1).map(move |x| (x, y)))
            .map(|(x, y)| frame.at(x, y))
            .filter(|&d| config.is_valid(d))
            .collect();
        match median_mm(&mut window) {
            Some(z) => (z, DepthSource::Window),
            None => {
                return Err(ArmError::InvalidDepth(format!(
                    "no valid depth at pixel ({}, {})",
                    pixel.x, pixel.y
                )));
            }
        }
    };

    let (x_mm, y_mm, z_mm) = frame.intrinsics.deproject(pixel.x as f32, pixel.y as f32, z);
    let point = SpatialPoint::new(x_mm, y_mm, z_mm).in_session(frame.session);
    Ok((point, pixel, source))
}

/// Samples metric points from the [`FrameBus`]'s latest depth frame.
#[derive(Clone)]
pub struct DepthSampler {
    bus: Arc<FrameBus>,
    config: DepthConfig,
}

impl DepthSampler {
    pub fn new(bus: Arc<FrameBus>, config: DepthConfig) -> Self {
        Self { bus, config }
    }

    pub fn config(&self) -> &DepthConfig {
        &self.config
    }

    /// Latest depth frame, riding out camera warm-up.
    ///
    /// # Errors
    ///
    /// Returns [`ArmError::DeviceUnavailable`] when no frame is available.
    pub async fn depth_frame(&self) -> Result<Arc<DepthFrame>, ArmError> {
        self.bus.await_depth_frame(self.config.retry_policy()).await
    }

    /// Sample the 3-D point at normalized image coordinates.
    ///
    /// # Errors
    ///
    /// [`ArmError::DeviceUnavailable`] without a depth frame,
    /// [`ArmError::InvalidDepth`] without a usable reading.
    pub async fn sample(&self, norm_x: f32, norm_y: f32) -> Result<DepthSample, ArmError> {
        let depth_frame = self.depth_frame().await?;
        self.sample_in(depth_frame, norm_x, norm_y)
    }

    /// Sample an already fetched depth frame.
    ///
    /// # Errors
    ///
    /// [`ArmError::InvalidDepth`] without a usable reading.
    pub fn sample_in(&self, depth_frame: Arc<DepthFrame>, norm_x: f32, norm_y: f32) -> Result<DepthSample, ArmError> {
        let (point, pixel, source) = sample_frame(&depth_frame, norm_x, norm_y, &self.config)?;
        debug!(
            x = point.x_mm,
            y = point.y_mm,
            z = point.z_mm,
            ?source,
            "sampled depth"
        );
        Ok(DepthSample {
            point,
            pixel,
            source,
            color: self.bus.get_color_frame(),
            depth_frame,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use armsight_types::CameraIntrinsics;

    fn flat(width: u32, height: u32, value: u16) -> DepthFrame {
        DepthFrame::new(width, height, vec![value; (width * height) as usize])
            .unwrap()
            .with_intrinsics(CameraIntrinsics::new(400.0, 400.0, 50.0, 40.0, width, height))
    }

    fn set(frame: &mut DepthFrame, x: u32, y: u32, value: u16) {
        let w = frame.width as usize;
        frame.data[y as usize * w + x as usize] = value;
    }

    #[test]
    fn median_of_odd_and_even_sets() {
        assert_eq!(median_mm(&mut [5, 1, 3]), Some(3.0));
        assert_eq!(median_mm(&mut [4, 1, 3, 2]), Some(2.5));
        assert_eq!(median_mm(&mut []), None);
    }

    #[test]
    fn out_of_range_points_are_clamped() {
        assert_eq!(normalized_to_pixel(-0.5, 1.7, 100, 80), Pixel::new(0, 79));
        assert_eq!(normalized_to_pixel(1.0, 0.0, 100, 80), Pixel::new(99, 0));
        assert_eq!(normalized_to_pixel(f32::NAN, 0.5, 100, 80), Pixel::new(0, 40));
    }

    #[test]
    fn clamped_sample_reads_the_border_pixel() {
        let mut frame = flat(100, 80, 700);
        set(&mut frame, 99, 79, 900);
        let (point, pixel, source) =
            sample_frame(&frame, 3.0, 3.0, &DepthConfig::default()).unwrap();
        assert_eq!(pixel, Pixel::new(99, 79));
        assert_eq!(source, DepthSource::Direct);
        assert_eq!(point.z_mm, 900.0);
    }

    #[test]
    fn direct_reading_projects_through_intrinsics() {
        let frame = flat(100, 80, 800);
        // Pixel (70, 20): 20 px right of and 20 px above the principal point.
        let (point, _, source) = sample_frame(&frame, 0.7, 0.25, &DepthConfig::default()).unwrap();
        assert_eq!(source, DepthSource::Direct);
        assert!((point.x_mm - 40.0).abs() < 1e-3);
        assert!((point.y_mm - 40.0).abs() < 1e-3);
        assert_eq!(point.z_mm, 800.0);
    }

    #[test]
    fn zero_reading_uses_window_median() {
        let mut frame = flat(100, 80, 0);
        // Three valid readings inside the 11×11 window around (50, 40).
        set(&mut frame, 45, 35, 600);
        set(&mut frame, 55, 45, 620);
        set(&mut frame, 50, 41, 640);
        // Outside the window: must be ignored.
        set(&mut frame, 56, 40, 100);
        let (point, pixel, source) =
            sample_frame(&frame, 0.5, 0.5, &DepthConfig::default()).unwrap();
        assert_eq!(pixel, Pixel::new(50, 40));
        assert_eq!(source, DepthSource::Window);
        assert_eq!(point.z_mm, 620.0);
    }

    #[test]
    fn empty_window_is_invalid_depth() {
        let frame = flat(100, 80, 0);
        let err = sample_frame(&frame, 0.5, 0.5, &DepthConfig::default()).unwrap_err();
        assert!(matches!(err, ArmError::InvalidDepth(_)));
    }

    #[test]
    fn any_nonzero_reading_is_used_by_default() {
        let mut frame = flat(100, 80, 0);
        set(&mut frame, 52, 40, 80);
        let (point, _, source) = sample_frame(&frame, 0.5, 0.5, &DepthConfig::default()).unwrap();
        assert_eq!(source, DepthSource::Window);
        assert_eq!(point.z_mm, 80.0);

        set(&mut frame, 50, 40, 12_000);
        let (point, _, source) = sample_frame(&frame, 0.5, 0.5, &DepthConfig::default()).unwrap();
        assert_eq!(source, DepthSource::Direct);
        assert_eq!(point.z_mm, 12_000.0);
    }

    #[test]
    fn configured_clamp_rejects_readings_outside_it() {
        let config = DepthConfig {
            near_mm: 100,
            far_mm: 10_000,
            ..DepthConfig::default()
        };
        let mut frame = flat(100, 80, 0);
        set(&mut frame, 50, 40, 20_000);
        set(&mut frame, 51, 40, 50);
        let err = sample_frame(&frame, 0.5, 0.5, &config).unwrap_err();
        assert!(matches!(err, ArmError::InvalidDepth(_)));

        set(&mut frame, 49, 40, 400);
        let (point, _, source) = sample_frame(&frame, 0.5, 0.5, &config).unwrap();
        assert_eq!(source, DepthSource::Window);
        assert_eq!(point.z_mm, 400.0);
    }

    #[test]
    fn sampled_point_carries_frame_session() {
        let frame = flat(100, 80, 500).with_session(7, 1);
        let (point, _, _) = sample_frame(&frame, 0.5, 0.5, &DepthConfig::default()).unwrap();
        assert_eq!(point.session, Some(7));
    }
}
