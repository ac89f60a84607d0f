//! Test doubles shared by the daemon's unit tests.

use crate::engine::{spawn_engine, EngineConfig, EngineHandle};
use crate::photos::FsPhotoStore;
use crate::store::Store;
use attendance_core::{Embedding, EmbeddingCache, EmbeddingExtractor, ExtractError, MotionLiveness};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use std::io::Cursor;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Extractor driven by pixel (0, 0): red value `r` yields the embedding
/// `[r / 100, 0]`, and `r == 255` means "no face".
#[derive(Default)]
pub struct PixelExtractor {
    pub calls: AtomicUsize,
    delay: Option<Duration>,
}

impl PixelExtractor {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            delay: Some(delay),
        }
    }
}

impl EmbeddingExtractor for PixelExtractor {
    fn extract(&self, image: &RgbImage) -> Result<Vec<Embedding>, ExtractError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        let r = image.get_pixel(0, 0)[0];
        if r == 255 {
            return Ok(Vec::new());
        }
        Ok(vec![Embedding::new(vec![r as f32 / 100.0, 0.0])])
    }
}

/// 64x64 image filled with red value `r` on a grey-ish background colour.
pub fn solid(r: u8) -> RgbImage {
    RgbImage::from_pixel(64, 64, Rgb([r, 100, 100]))
}

/// `solid(r)` with a white 40x40 block in the bottom-right corner.
/// Differs from `solid(r)` in 1600 pixels, well above default liveness thresholds.
pub fn moved(r: u8) -> RgbImage {
    let mut img = solid(r);
    for y in 24..64 {
        for x in 24..64 {
            img.put_pixel(x, y, Rgb([255, 255, 255]));
        }
    }
    img
}

pub fn png(img: &RgbImage) -> Vec<u8> {
    let mut buf = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(img.clone())
        .write_to(&mut buf, ImageFormat::Png)
        .unwrap();
    buf.into_inner()
}

/// Encoded image as a browser-style data URL.
pub fn data_url(img: &RgbImage) -> String {
    use base64::Engine as _;
    format!(
        "data:image/png;base64,{}",
        base64::engine::general_purpose::STANDARD.encode(png(img))
    )
}

/// In-memory database, temporary photo directory and a two-worker engine
/// over a [`PixelExtractor`].
pub struct Harness {
    pub store: Store,
    pub photos: Arc<FsPhotoStore>,
    pub engine: EngineHandle,
    pub extractor: Arc<PixelExtractor>,
    _dir: tempfile::TempDir,
}

impl Harness {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let photos = Arc::new(FsPhotoStore::open(dir.path()).unwrap());
        let extractor = Arc::new(PixelExtractor::default());
        let engine = spawn_engine(
            EngineConfig {
                workers: 2,
                queue_depth: 8,
                timeout: Duration::from_secs(5),
            },
            extractor.clone(),
            Arc::new(MotionLiveness::default()),
            Arc::new(EmbeddingCache::new()),
            photos.clone(),
        )
        .unwrap();
        Self {
            store: Store::open(Path::new(":memory:")).await.unwrap(),
            photos,
            engine,
            extractor,
            _dir: dir,
        }
    }

    /// Wait for a background cache warm-up of `photo_ref` to land.
    pub async fn wait_cached(&self, photo_ref: &str) -> bool {
        for _ in 0..100 {
            if self.engine.cache().contains(photo_ref) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }
}
