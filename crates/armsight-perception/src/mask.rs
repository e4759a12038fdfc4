//! Geometry on [`SegmentationMask`]s: centroid refinement and depth pooling.

use armsight_types::{DepthFrame, Pixel, SegmentationMask};

use crate::depth::{DepthConfig, median_mm};

/// Mean `(x, y)` of the set cells, or `None` for an empty mask.
pub fn centroid(mask: &SegmentationMask) -> Option<(f32, f32)> {
    let (mut sx, mut sy, mut n) = (0f64, 0f64, 0u64);
    for y in 0..mask.height {
        for x in 0..mask.width {
            if mask.get(x, y) {
                sx += x as f64;
                sy += y as f64;
                n += 1;
            }
        }
    }
    (n > 0).then(|| ((sx / n as f64) as f32, (sy / n as f64) as f32))
}

/// [`centroid`] rounded to the nearest pixel.
pub fn centroid_pixel(mask: &SegmentationMask) -> Option<Pixel> {
    centroid(mask).map(|(x, y)| Pixel::new(x.round() as u32, y.round() as u32))
}

/// Nearest-neighbour resize to `width`×`height`.
pub fn resize_nearest(mask: &SegmentationMask, width: u32, height: u32) -> SegmentationMask {
    if mask.width == width && mask.height == height {
        return mask.clone();
    }
    let mut out = SegmentationMask::empty(width, height);
    if mask.width == 0 || mask.height == 0 {
        return out;
    }
    for y in 0..height {
        let sy = (y as u64 * mask.height as u64 / height as u64) as u32;
        for x in 0..width {
            let sx = (x as u64 * mask.width as u64 / width as u64) as u32;
            if mask.get(sx, sy) {
                out.set(x, y, true);
            }
        }
    }
    out
}

/// Median of the valid depth readings covered by `mask`.  The mask is
/// resampled to the depth frame's resolution first.
pub fn median_depth_under(mask: &SegmentationMask, depth: &DepthFrame, config: &DepthConfig) -> Option<f32> {
    let mask = resize_nearest(mask, depth.width, depth.height);
    let mut values: Vec<u16> = mask
        .data
        .iter()
        .zip(&depth.data)
        .filter(|&(&inside, &d)| inside && config.is_valid(d))
        .map(|(_, &d)| d)
        .collect();
    median_mm(&mut values)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn disk(width: u32, height: u32, cx: i64, cy: i64, r: i64) -> SegmentationMask {
        let mut mask = SegmentationMask::empty(width, height);
        for y in 0..height {
            for x in 0..width {
                let (dx, dy) = (x as i64 - cx, y as i64 - cy);
                if dx * dx + dy * dy <= r * r {
                    mask.set(x, y, true);
                }
            }
        }
        mask
    }

    #[test]
    fn disk_centroid_is_its_centre() {
        let mask = disk(100, 80, 40, 30, 10);
        let (x, y) = centroid(&mask).unwrap();
        assert!((x - 40.0).abs() < 1e-3);
        assert!((y - 30.0).abs() < 1e-3);
        assert_eq!(centroid_pixel(&mask), Some(Pixel::new(40, 30)));
    }

    #[test]
    fn empty_mask_has_no_centroid() {
        assert_eq!(centroid(&SegmentationMask::empty(10, 10)), None);
    }

    #[test]
    fn resize_halves_area() {
        let mut mask = SegmentationMask::empty(8, 8);
        for y in 2..6 {
            for x in 2..6 {
                mask.set(x, y, true);
            }
        }
        let small = resize_nearest(&mask, 4, 4);
        assert_eq!(small.area(), 4);
        assert!(small.get(1, 1) && small.get(2, 2));
        assert!(!small.get(0, 0) && !small.get(3, 3));
    }

    #[test]
    fn median_ignores_holes_and_outside_pixels() {
        let mut data = vec![900u16; 16];
        // Inside the mask: two holes and three readings.
        data[5] = 0;
        data[6] = 500;
        data[9] = 520;
        data[10] = 0;
        data[11] = 540;
        let depth = DepthFrame::new(4, 4, data).unwrap();
        let mut mask = SegmentationMask::empty(4, 4);
        for (x, y) in [(1, 1), (2, 1), (1, 2), (2, 2), (3, 2)] {
            mask.set(x, y, true);
        }
        assert_eq!(median_depth_under(&mask, &depth, &DepthConfig::default()), Some(520.0));
    }

    #[test]
    fn median_under_all_hole_mask_is_none() {
        let depth = DepthFrame::new(4, 4, vec![0; 16]).unwrap();
        let mask = disk(4, 4, 2, 2, 1);
        assert_eq!(median_depth_under(&mask, &depth, &DepthConfig::default()), None);
    }
}
