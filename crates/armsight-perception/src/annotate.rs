//! Draws localization results onto a color frame: mask tint, crosshair, and
//! a coordinate label.

use armsight_types::{ColorFrame, Pixel, SegmentationMask, SpatialPoint};
use image::{Rgb, RgbImage};

use crate::mask::resize_nearest;

const CROSSHAIR: Rgb<u8> = Rgb([255, 40, 40]);
const LABEL_FG: Rgb<u8> = Rgb([255, 255, 255]);
const LABEL_BG: Rgb<u8> = Rgb([0, 0, 0]);
const MASK_TINT: [u8; 3] = [40, 220, 80];
const CROSSHAIR_ARM: i64 = 12;
const GLYPH_SCALE: u32 = 2;

/// 3×5 glyphs, one row per byte, bit 2 is the leftmost column.
fn glyph(c: char) -> [u8; 5] {
    match c {
        '0' => [0b111, 0b101, 0b101, 0b101, 0b111],
        '1' => [0b010, 0b110, 0b010, 0b010, 0b111],
        '2' => [0b111, 0b001, 0b111, 0b100, 0b111],
        '3' => [0b111, 0b001, 0b111, 0b001, 0b111],
        '4' => [0b101, 0b101, 0b111, 0b001, 0b001],
        '5' => [0b111, 0b100, 0b111, 0b001, 0b111],
        '6' => [0b111, 0b100, 0b111, 0b101, 0b111],
        '7' => [0b111, 0b001, 0b001, 0b001, 0b001],
        '8' => [0b111, 0b101, 0b111, 0b101, 0b111],
        '9' => [0b111, 0b101, 0b111, 0b001, 0b111],
        '-' => [0b000, 0b000, 0b111, 0b000, 0b000],
        '.' => [0b000, 0b000, 0b000, 0b000, 0b010],
        ':' => [0b000, 0b010, 0b000, 0b010, 0b000],
        '=' => [0b000, 0b111, 0b000, 0b111, 0b000],
        'x' => [0b000, 0b101, 0b010, 0b101, 0b000],
        'y' => [0b101, 0b101, 0b111, 0b001, 0b111],
        'z' => [0b111, 0b001, 0b010, 0b100, 0b111],
        'm' => [0b000, 0b111, 0b111, 0b101, 0b101],
        _ => [0; 5],
    }
}

/// Text drawn next to the target.
pub fn coordinate_label(point: &SpatialPoint) -> String {
    format!(
        "x={} y={} z={}mm",
        point.x_mm.round() as i64,
        point.y_mm.round() as i64,
        point.z_mm.round() as i64
    )
}

fn put(img: &mut RgbImage, x: i64, y: i64, color: Rgb<u8>) {
    if x >= 0 && y >= 0 && (x as u32) < img.width() && (y as u32) < img.height() {
        img.put_pixel(x as u32, y as u32, color);
    }
}

fn draw_text(img: &mut RgbImage, text: &str, x: i64, y: i64) {
    let cell = 4 * GLYPH_SCALE as i64;
    let width = text.chars().count() as i64 * cell + GLYPH_SCALE as i64;
    let height = 5 * GLYPH_SCALE as i64 + 2 * GLYPH_SCALE as i64;
    for dy in 0..height {
        for dx in 0..width {
            put(img, x + dx, y + dy, LABEL_BG);
        }
    }
    for (i, c) in text.chars().enumerate() {
        let ox = x + GLYPH_SCALE as i64 + i as i64 * cell;
        let oy = y + GLYPH_SCALE as i64;
        for (row, bits) in glyph(c).iter().enumerate() {
            for col in 0..3 {
                if bits & (0b100 >> col) == 0 {
                    continue;
                }
                for sy in 0..GLYPH_SCALE as i64 {
                    for sx in 0..GLYPH_SCALE as i64 {
                        put(
                            img,
                            ox + col * GLYPH_SCALE as i64 + sx,
                            oy + row as i64 * GLYPH_SCALE as i64 + sy,
                            LABEL_FG,
                        );
                    }
                }
            }
        }
    }
}

/// Copy of `frame` with the target marked.
///
/// `target` is in `frame`'s pixel space.  A mask of a different resolution
/// is resampled to the frame first.
pub fn annotate(
    frame: &ColorFrame,
    target: Pixel,
    point: &SpatialPoint,
    mask: Option<&SegmentationMask>,
) -> ColorFrame {
    let Some(mut img) = RgbImage::from_raw(frame.width, frame.height, frame.data.clone()) else {
        return frame.clone();
    };

    if let Some(mask) = mask {
        let mask = resize_nearest(mask, frame.width, frame.height);
        for (x, y, px) in img.enumerate_pixels_mut() {
            if mask.get(x, y) {
                for (channel, tint) in px.0.iter_mut().zip(MASK_TINT) {
                    *channel = ((*channel as u16 + tint as u16) / 2) as u8;
                }
            }
        }
    }

    let (tx, ty) = (target.x as i64, target.y as i64);
    for d in -CROSSHAIR_ARM..=CROSSHAIR_ARM {
        put(&mut img, tx + d, ty, CROSSHAIR);
        put(&mut img, tx, ty + d, CROSSHAIR);
    }

    let text = coordinate_label(point);
    let text_width = text.chars().count() as i64 * 4 * GLYPH_SCALE as i64;
    let lx = (tx + CROSSHAIR_ARM + 4).min(frame.width as i64 - text_width - 4).max(0);
    let ly = (ty - CROSSHAIR_ARM - 16).max(0);
    draw_text(&mut img, &text, lx, ly);

    ColorFrame {
        data: img.into_raw(),
        ..frame.clone()
    }
}
