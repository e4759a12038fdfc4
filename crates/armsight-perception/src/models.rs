//! Vision-model seams used by the localizer.
//!
//! | Trait | Input | Output |
//! |---|---|---|
//! | [`ObjectProposer`] | JPEG image + free-text description | Candidate points on a 0–1000 grid, best first |
//! | [`Segmenter`] | Color frame + seed pixel | Object mask, or `None` |
//!
//! Remote model clients live outside this crate; the scene-backed
//! implementations here drive the simulator and tests.

use std::sync::Arc;

use armsight_hal::sim::SimScene;
use armsight_types::{ArmError, ColorFrame, Pixel, SegmentationMask};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Proposal grid resolution: coordinates run from 0 to this value.
pub const PROPOSAL_SCALE: f32 = 1000.0;

/// One candidate location returned by an [`ObjectProposer`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    /// `[y, x]` on a 0–1000 grid.
    pub point: [u32; 2],
    pub label: String,
}

impl Proposal {
    pub fn new(x: u32, y: u32, label: impl Into<String>) -> Self {
        Self {
            point: [y, x],
            label: label.into(),
        }
    }

    /// `(x, y)` in `[0, 1]`.
    pub fn normalized(&self) -> (f32, f32) {
        (
            self.point[1] as f32 / PROPOSAL_SCALE,
            self.point[0] as f32 / PROPOSAL_SCALE,
        )
    }
}

/// Finds objects in an image from a natural-language description.
#[async_trait]
pub trait ObjectProposer: Send + Sync {
    /// # Errors
    ///
    /// Implementation-defined; an empty result is not an error.
    async fn propose(&self, jpeg: &[u8], description: &str) -> Result<Vec<Proposal>, ArmError>;
}

/// Produces an object mask from a seed pixel.
#[async_trait]
pub trait Segmenter: Send + Sync {
    /// The mask is in `frame`'s resolution.
    ///
    /// # Errors
    ///
    /// Implementation-defined; callers treat errors like `Ok(None)`.
    async fn segment(&self, frame: &ColorFrame, seed: Pixel) -> Result<Option<SegmentationMask>, ArmError>;
}

/// Used when no segmentation model is configured.
pub struct NoSegmenter;

#[async_trait]
impl Segmenter for NoSegmenter {
    async fn segment(&self, _frame: &ColorFrame, _seed: Pixel) -> Result<Option<SegmentationMask>, ArmError> {
        Ok(None)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Scene-backed models
// ────────────────────────────────────────────────────────────────────────────

/// Answers descriptions by label lookup in a [`SimScene`].
pub struct SceneProposer {
    scene: Arc<SimScene>,
}

impl SceneProposer {
    pub fn new(scene: Arc<SimScene>) -> Self {
        Self { scene }
    }
}

#[async_trait]
impl ObjectProposer for SceneProposer {
    async fn propose(&self, _jpeg: &[u8], description: &str) -> Result<Vec<Proposal>, ArmError> {
        let (rw, rh) = self.scene.reference_size;
        Ok(self
            .scene
            .find(description)
            .map(|block| {
                let c = block.center();
                let scale = |v: u32, extent: u32| (v as f32 * PROPOSAL_SCALE / extent.max(1) as f32) as u32;
                Proposal::new(scale(c.x, rw), scale(c.y, rh), block.label.clone())
            })
            .into_iter()
            .collect())
    }
}

/// Segments whichever scene block lies under the seed.
pub struct SceneSegmenter {
    scene: Arc<SimScene>,
}

impl SceneSegmenter {
    pub fn new(scene: Arc<SimScene>) -> Self {
        Self { scene }
    }
}

#[async_trait]
impl Segmenter for SceneSegmenter {
    async fn segment(&self, frame: &ColorFrame, seed: Pixel) -> Result<Option<SegmentationMask>, ArmError> {
        let (w, h) = (frame.width, frame.height);
        let Some(target) = self.scene.block_in_frame(seed.x, seed.y, w, h) else {
            return Ok(None);
        };
        let mut mask = SegmentationMask::empty(w, h);
        for y in 0..h {
            for x in 0..w {
                if self.scene.block_in_frame(x, y, w, h) == Some(target) {
                    mask.set(x, y, true);
                }
            }
        }
        Ok(Some(mask))
    }
}
