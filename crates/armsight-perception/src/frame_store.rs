//! [`FrameStore`] – keeps annotated result images addressable by id.
//!
//! Tool replies reference images by an opaque id; a display client later asks
//! for the pixels.  Entries are evicted least-recently-used once the store is
//! at capacity.

use std::io::Cursor;
use std::num::NonZeroUsize;
use std::sync::Arc;

use armsight_types::{ArmError, ColorFrame};
use image::ImageOutputFormat;
use lru::LruCache;
use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;

/// Default number of images kept.
pub const DEFAULT_CAPACITY: usize = 64;

/// JPEG quality used for stored images.
pub const JPEG_QUALITY: u8 = 85;

/// Encode a color frame as JPEG.
///
/// # Errors
///
/// Returns [`ArmError::Encoding`] if the encoder rejects the frame.
pub fn encode_jpeg(frame: &ColorFrame, quality: u8) -> Result<Vec<u8>, ArmError> {
    let image = image::RgbImage::from_raw(frame.width, frame.height, frame.data.clone())
        .ok_or_else(|| ArmError::Encoding("frame buffer does not match its size".into()))?;
    let mut out = Cursor::new(Vec::new());
    image
        .write_to(&mut out, ImageOutputFormat::Jpeg(quality))
        .map_err(|e| ArmError::Encoding(e.to_string()))?;
    Ok(out.into_inner())
}

/// Thread-safe id → image map.
pub struct FrameStore {
    entries: Mutex<LruCache<String, Arc<ColorFrame>>>,
}

impl FrameStore {
    /// A store holding at most `capacity` images; `0` means unbounded.
    pub fn new(capacity: usize) -> Self {
        let cache = match NonZeroUsize::new(capacity) {
            Some(cap) => LruCache::new(cap),
            None => LruCache::unbounded(),
        };
        Self {
            entries: Mutex::new(cache),
        }
    }

    /// Store `frame` under a fresh id and return the id.
    pub fn put(&self, frame: ColorFrame) -> String {
        self.put_shared(Arc::new(frame))
    }

    pub fn put_shared(&self, frame: Arc<ColorFrame>) -> String {
        let id = Uuid::new_v4().to_string();
        let mut entries = self.entries.lock();
        if let Some((evicted, _)) = entries.push(id.clone(), frame) {
            debug!(image = %evicted, "evicted stored image");
        }
        id
    }

    /// # Errors
    ///
    /// Returns [`ArmError::NotFound`] for unknown or evicted ids.
    pub fn get(&self, id: &str) -> Result<Arc<ColorFrame>, ArmError> {
        self.entries
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| ArmError::NotFound(format!("image {id}")))
    }

    /// The stored image encoded as JPEG.
    ///
    /// # Errors
    ///
    /// [`ArmError::NotFound`] for unknown ids, [`ArmError::Encoding`] if the
    /// encoder fails.
    pub fn get_jpeg(&self, id: &str) -> Result<Vec<u8>, ArmError> {
        let frame = self.get(id)?;
        encode_jpeg(&frame, JPEG_QUALITY)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for FrameStore {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stored_frame_comes_back_by_id() -> Result<(), Box<dyn std::error::Error>> {
        let store = FrameStore::default();
        let mut frame = ColorFrame::blank(4, 2);
        frame.data[0] = 200;
        let id = store.put(frame.clone());
        assert_eq!(*store.get(&id)?, frame);
        Ok(())
    }

    #[test]
    fn unknown_id_is_not_found() {
        let store = FrameStore::default();
        assert!(matches!(store.get("nope"), Err(ArmError::NotFound(_))));
    }

    #[test]
    fn ids_are_unique() {
        let store = FrameStore::default();
        let a = store.put(ColorFrame::blank(2, 2));
        let b = store.put(ColorFrame::blank(2, 2));
        assert_ne!(a, b);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn oldest_entry_is_evicted_at_capacity() {
        let store = FrameStore::new(2);
        let first = store.put(ColorFrame::blank(2, 2));
        let second = store.put(ColorFrame::blank(2, 2));
        // Touch the first so the second becomes least recently used.
        assert!(store.get(&first).is_ok());
        let third = store.put(ColorFrame::blank(2, 2));
        assert!(store.get(&first).is_ok());
        assert!(store.get(&second).is_err());
        assert!(store.get(&third).is_ok());
    }

    #[test]
    fn zero_capacity_is_unbounded() {
        let store = FrameStore::new(0);
        for _ in 0..200 {
            store.put(ColorFrame::blank(1, 1));
        }
        assert_eq!(store.len(), 200);
    }

    #[test]
    fn jpeg_has_magic_bytes() -> Result<(), Box<dyn std::error::Error>> {
        let store = FrameStore::default();
        let id = store.put(ColorFrame::blank(16, 16));
        let jpeg = store.get_jpeg(&id)?;
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        Ok(())
    }
}
