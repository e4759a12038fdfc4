//! [`SpatialLocalizer`] – resolves "where is it?" into a 3-D point.
//!
//! # Pipeline
//!
//! 1. Grab the latest color frame.
//! 2. Seed pixel: the caller's normalized point, or the first proposal for a
//!    description.
//! 3. Optional segmentation refines the seed to the mask centroid.
//! 4. Depth is sampled at the refined pixel.  If the sampler finds nothing
//!    there and a mask exists, the median depth under the whole mask is used
//!    instead.
//! 5. The annotated frame goes into the [`FrameStore`] and its id is returned.

use std::sync::Arc;

use armsight_types::{ArmError, ColorFrame, DepthFrame, Pixel, SegmentationMask, SpatialPoint};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::annotate::annotate;
use crate::depth::{DepthConfig, DepthSampler, DepthSource, normalized_to_pixel};
use crate::frame_bus::FrameBus;
use crate::frame_store::{FrameStore, JPEG_QUALITY, encode_jpeg};
use crate::mask::{centroid_pixel, median_depth_under, resize_nearest};
use crate::models::{ObjectProposer, Segmenter};

/// What to locate: a normalized image point, a description, or both (the
/// point wins).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LocateRequest {
    pub point: Option<(f32, f32)>,
    pub description: Option<String>,
}

impl LocateRequest {
    pub fn at(norm_x: f32, norm_y: f32) -> Self {
        Self {
            point: Some((norm_x, norm_y)),
            description: None,
        }
    }

    pub fn describe(description: impl Into<String>) -> Self {
        Self {
            point: None,
            description: Some(description.into()),
        }
    }
}

/// A located object.
#[derive(Debug, Clone, Serialize)]
pub struct Localization {
    pub point: SpatialPoint,
    /// Refined target in color-frame pixels.
    pub pixel: Pixel,
    pub label: String,
    /// [`FrameStore`] id of the annotated frame.
    pub image_id: String,
    pub depth_source: DepthSource,
    pub mask_refined: bool,
}

/// Combines the camera, depth sampling, and vision models.
pub struct SpatialLocalizer {
    bus: Arc<FrameBus>,
    sampler: DepthSampler,
    proposer: Arc<dyn ObjectProposer>,
    segmenter: Arc<dyn Segmenter>,
    store: Arc<FrameStore>,
}

impl SpatialLocalizer {
    pub fn new(
        sampler: DepthSampler,
        bus: Arc<FrameBus>,
        proposer: Arc<dyn ObjectProposer>,
        segmenter: Arc<dyn Segmenter>,
        store: Arc<FrameStore>,
    ) -> Self {
        Self {
            bus,
            sampler,
            proposer,
            segmenter,
            store,
        }
    }

    pub fn bus(&self) -> &Arc<FrameBus> {
        &self.bus
    }

    pub fn store(&self) -> &Arc<FrameStore> {
        &self.store
    }

    /// Locate an object.
    ///
    /// # Errors
    ///
    /// - [`ArmError::InvalidArgument`] when the request names neither a point
    ///   nor a description.
    /// - [`ArmError::ObjectNotFound`] when the proposer returns nothing.
    /// - [`ArmError::InvalidDepth`] when no depth can be recovered.
    /// - [`ArmError::DeviceUnavailable`] when the camera has no frames.
    #[instrument(skip_all, fields(description = request.description.as_deref(), point = ?request.point))]
    pub async fn locate(&self, request: LocateRequest) -> Result<Localization, ArmError> {
        let color = self
            .bus
            .await_color_frame(self.sampler.config().retry_policy())
            .await?;

        let (seed, label) = self.seed(&color, &request).await?;
        debug!(x = seed.x, y = seed.y, %label, "seed pixel");

        let mask = self.segment(&color, seed).await;
        let pixel = mask.as_ref().and_then(centroid_pixel).unwrap_or(seed);

        let norm_x = pixel.x as f32 / color.width.max(1) as f32;
        let norm_y = pixel.y as f32 / color.height.max(1) as f32;

        // One depth frame serves both the direct sample and the mask fallback.
        let depth = self.sampler.depth_frame().await?;
        let (point, depth_source) = match self.sampler.sample_in(depth.clone(), norm_x, norm_y) {
            Ok(sample) => (sample.point, sample.source),
            Err(ArmError::InvalidDepth(details)) => match &mask {
                Some(mask) => (
                    mask_median_point(mask, &depth, norm_x, norm_y, self.sampler.config())?,
                    DepthSource::MaskMedian,
                ),
                None => return Err(ArmError::InvalidDepth(details)),
            },
            Err(e) => return Err(e),
        };

        let annotated = annotate(&color, pixel, &point, mask.as_ref());
        let image_id = self.store.put(annotated);

        info!(
            %label,
            x = point.x_mm,
            y = point.y_mm,
            z = point.z_mm,
            ?depth_source,
            image = %image_id,
            "object located"
        );
        Ok(Localization {
            point,
            pixel,
            label,
            image_id,
            depth_source,
            mask_refined: mask.is_some(),
        })
    }

    async fn seed(&self, color: &ColorFrame, request: &LocateRequest) -> Result<(Pixel, String), ArmError> {
        let description = request.description.clone().unwrap_or_default();
        if let Some((x, y)) = request.point {
            let label = if description.is_empty() { "target".to_string() } else { description };
            return Ok((normalized_to_pixel(x, y, color.width, color.height), label));
        }
        if description.trim().is_empty() {
            return Err(ArmError::InvalidArgument(
                "need a point or a description to locate".into(),
            ));
        }

        let jpeg = encode_jpeg(color, JPEG_QUALITY)?;
        let proposals = self.proposer.propose(&jpeg, &description).await?;
        let best = proposals
            .into_iter()
            .next()
            .ok_or_else(|| ArmError::ObjectNotFound(description.clone()))?;
        let (x, y) = best.normalized();
        let label = if best.label.is_empty() { description } else { best.label };
        Ok((normalized_to_pixel(x, y, color.width, color.height), label))
    }

    /// Mask in color resolution, or `None` when segmentation is unavailable
    /// or came back empty.
    async fn segment(&self, color: &ColorFrame, seed: Pixel) -> Option<SegmentationMask> {
        match self.segmenter.segment(color, seed).await {
            Ok(Some(mask)) if mask.area() > 0 => Some(resize_nearest(&mask, color.width, color.height)),
            Ok(_) => {
                debug!("segmentation produced no mask; keeping seed");
                None
            }
            Err(e) => {
                warn!(error = %e, "segmentation failed; keeping seed");
                None
            }
        }
    }

}

/// Median depth under `mask` in `depth`, deprojected at the normalized point.
fn mask_median_point(
    mask: &SegmentationMask,
    depth: &DepthFrame,
    norm_x: f32,
    norm_y: f32,
    config: &DepthConfig,
) -> Result<SpatialPoint, ArmError> {
    let z = median_depth_under(mask, depth, config)
        .ok_or_else(|| ArmError::InvalidDepth("no valid depth under object mask".into()))?;
    let px = normalized_to_pixel(norm_x, norm_y, depth.width, depth.height);
    let (x, y, z) = depth.intrinsics.deproject(px.x as f32, px.y as f32, z);
    debug!(z, "depth recovered from mask median");
    Ok(SpatialPoint::new(x, y, z).in_session(depth.session))
}

#[cfg(test)]
mod tests {
    use super::*;
    use armsight_types::CameraIntrinsics;
    use crate::models::{NoSegmenter, Proposal, SceneProposer, SceneSegmenter};
    use armsight_hal::camera::CameraSettings;
    use armsight_hal::sim::{SimBlock, SimCamera, SimScene};
    use async_trait::async_trait;
    use std::time::Duration;

    struct FixedProposer(Vec<Proposal>);

    #[async_trait]
    impl ObjectProposer for FixedProposer {
        async fn propose(&self, _jpeg: &[u8], _description: &str) -> Result<Vec<Proposal>, ArmError> {
            Ok(self.0.clone())
        }
    }

    struct BrokenSegmenter;

    #[async_trait]
    impl Segmenter for BrokenSegmenter {
        async fn segment(&self, _frame: &ColorFrame, _seed: Pixel) -> Result<Option<SegmentationMask>, ArmError> {
            Err(ArmError::device("segmenter", "model offline"))
        }
    }

    #[test]
    fn mask_fallback_reads_the_frame_it_is_given() {
        let mut data = vec![0u16; 16];
        data[5] = 500;
        data[6] = 520;
        data[9] = 540;
        let depth = DepthFrame::new(4, 4, data)
            .unwrap()
            .with_intrinsics(CameraIntrinsics::new(100.0, 100.0, 2.0, 2.0, 4, 4))
            .with_session(3, 9);
        let mut mask = SegmentationMask::empty(4, 4);
        for (x, y) in [(1, 1), (2, 1), (1, 2), (2, 2)] {
            mask.set(x, y, true);
        }
        let point = mask_median_point(&mask, &depth, 0.5, 0.5, &DepthConfig::default()).unwrap();
        assert_eq!(point.z_mm, 520.0);
        assert_eq!(point.x_mm, 0.0);
        assert_eq!(point.session, Some(3));
    }

    fn scene() -> Arc<SimScene> {
        Arc::new(
            SimScene::new(600)
                .with_block(SimBlock::new("red block", [220, 30, 30], (300, 180, 340, 220), 40))
                .with_block(SimBlock::new("silver can", [200, 200, 210], (100, 100, 200, 200), 80).reflective()),
        )
    }

    fn patient() -> DepthConfig {
        DepthConfig {
            frame_retries: 200,
            retry_backoff_ms: 5,
            ..DepthConfig::default()
        }
    }

    async fn localizer(
        proposer: Arc<dyn ObjectProposer>,
        segmenter: Arc<dyn Segmenter>,
    ) -> Result<SpatialLocalizer, ArmError> {
        let scene = scene();
        let camera = SimCamera::new("sim", scene).with_frame_interval(Duration::from_millis(5));
        let bus = Arc::new(FrameBus::new(Box::new(camera), CameraSettings::default()));
        bus.start().await?;
        let sampler = DepthSampler::new(bus.clone(), patient());
        Ok(SpatialLocalizer::new(sampler, bus, proposer, segmenter, Arc::new(FrameStore::default())))
    }

    #[tokio::test]
    async fn explicit_point_on_block_reads_block_top() -> Result<(), Box<dyn std::error::Error>> {
        let loc = localizer(Arc::new(FixedProposer(vec![])), Arc::new(NoSegmenter)).await?;
        // Centre of the red block.
        let found = loc.locate(LocateRequest::at(0.5, 0.5)).await?;
        assert_eq!(found.pixel, Pixel::new(320, 200));
        assert_eq!(found.point.z_mm, 560.0);
        assert_eq!(found.depth_source, DepthSource::Direct);
        assert!(!found.mask_refined);
        assert_eq!(found.point.session, Some(loc.bus().session()));
        assert!(loc.store().get(&found.image_id).is_ok());
        loc.bus().stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn description_uses_first_proposal() -> Result<(), Box<dyn std::error::Error>> {
        let scene = scene();
        let loc = localizer(Arc::new(SceneProposer::new(scene)), Arc::new(NoSegmenter)).await?;
        let found = loc.locate(LocateRequest::describe("red block")).await?;
        assert_eq!(found.label, "red block");
        assert_eq!(found.point.z_mm, 560.0);
        loc.bus().stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn empty_proposals_are_object_not_found() -> Result<(), Box<dyn std::error::Error>> {
        let loc = localizer(Arc::new(FixedProposer(vec![])), Arc::new(NoSegmenter)).await?;
        let err = loc.locate(LocateRequest::describe("unicorn")).await.unwrap_err();
        assert_eq!(err, ArmError::ObjectNotFound("unicorn".into()));
        loc.bus().stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn empty_request_is_rejected() -> Result<(), Box<dyn std::error::Error>> {
        let loc = localizer(Arc::new(FixedProposer(vec![])), Arc::new(NoSegmenter)).await?;
        let err = loc.locate(LocateRequest::default()).await.unwrap_err();
        assert!(matches!(err, ArmError::InvalidArgument(_)));
        loc.bus().stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn segmentation_moves_seed_to_centroid() -> Result<(), Box<dyn std::error::Error>> {
        let scene = scene();
        let loc = localizer(Arc::new(FixedProposer(vec![])), Arc::new(SceneSegmenter::new(scene))).await?;
        // Near the red block's corner.
        let found = loc.locate(LocateRequest::at(302.0 / 640.0, 182.0 / 400.0)).await?;
        assert!(found.mask_refined);
        assert!(found.pixel.x.abs_diff(320) <= 1 && found.pixel.y.abs_diff(200) <= 1);
        loc.bus().stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn reflective_object_is_rescued_by_mask_median() -> Result<(), Box<dyn std::error::Error>> {
        let scene = scene();
        let loc = localizer(Arc::new(FixedProposer(vec![])), Arc::new(SceneSegmenter::new(scene))).await?;
        let found = loc.locate(LocateRequest::at(150.0 / 640.0, 150.0 / 400.0)).await?;
        assert_eq!(found.depth_source, DepthSource::MaskMedian);
        assert_eq!(found.point.z_mm, 520.0);
        loc.bus().stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn reflective_object_without_mask_is_invalid_depth() -> Result<(), Box<dyn std::error::Error>> {
        let loc = localizer(Arc::new(FixedProposer(vec![])), Arc::new(BrokenSegmenter)).await?;
        let err = loc.locate(LocateRequest::at(150.0 / 640.0, 150.0 / 400.0)).await.unwrap_err();
        assert!(matches!(err, ArmError::InvalidDepth(_)));
        loc.bus().stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn failed_segmentation_keeps_seed() -> Result<(), Box<dyn std::error::Error>> {
        let loc = localizer(Arc::new(FixedProposer(vec![])), Arc::new(BrokenSegmenter)).await?;
        let found = loc.locate(LocateRequest::at(0.47, 0.455)).await?;
        assert!(!found.mask_refined);
        assert_eq!(found.pixel, normalized_to_pixel(0.47, 0.455, 640, 400));
        loc.bus().stop().await;
        Ok(())
    }
}
