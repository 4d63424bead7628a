//! Receiving side of the codec: JPEG decode and frame presentation.

use image::codecs::jpeg::JpegDecoder;
use image::{DynamicImage, ImageDecoder, ImageFormat, Limits};
use std::io::Cursor;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// Decoded frame ready for presentation
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    pub width: u32,
    pub height: u32,
    pub image: DynamicImage,
}

/// Largest width or height a received frame may declare
pub const MAX_FRAME_DIMENSION: u32 = 8192;

/// Ceiling on the decoded pixel buffer of one frame
pub const MAX_DECODED_BYTES: u64 = 64 << 20;

/// JPEG end-of-image marker
const EOI: [u8; 2] = [0xFF, 0xD9];

/// Decode a JPEG payload.
///
/// Data-plane payloads are never guaranteed well-formed, so a corrupt or
/// partial payload is `None` rather than an error. Header dimensions are
/// untrusted and checked before any pixel buffer is allocated.
pub fn decode(payload: &[u8]) -> Option<DecodedFrame> {
    // The decoder pads a cut-off scan instead of failing.
    if !payload.ends_with(&EOI) {
        return None;
    }
    let mut decoder = JpegDecoder::new(Cursor::new(payload)).ok()?;
    let (width, height) = decoder.dimensions();
    if width > MAX_FRAME_DIMENSION
        || height > MAX_FRAME_DIMENSION
        || decoder.total_bytes() > MAX_DECODED_BYTES
    {
        debug!("frame header claims {width}x{height}; refusing to decode");
        return None;
    }
    let mut limits = Limits::default();
    limits.max_image_width = Some(MAX_FRAME_DIMENSION);
    limits.max_image_height = Some(MAX_FRAME_DIMENSION);
    limits.max_alloc = Some(MAX_DECODED_BYTES);
    decoder.set_limits(limits).ok()?;
    let image = DynamicImage::from_decoder(decoder).ok()?;
    Some(DecodedFrame {
        width: image.width(),
        height: image.height(),
        image,
    })
}

/// Whatever shows decoded frames to the user.
pub trait FramePresenter: Send {
    fn present(&mut self, frame: DecodedFrame);
}

/// Forward frames to another task (used by embedders and tests).
impl FramePresenter for mpsc::UnboundedSender<DecodedFrame> {
    fn present(&mut self, frame: DecodedFrame) {
        let _ = self.send(frame);
    }
}

/// Minimum gap between snapshot writes
const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(1);

/// Logs incoming frames and optionally keeps the latest one on disk.
pub struct SnapshotPresenter {
    path: Option<PathBuf>,
    frames: u64,
    last_write: Option<Instant>,
}

impl SnapshotPresenter {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            path,
            frames: 0,
            last_write: None,
        }
    }

    #[cfg(test)]
    pub fn frames(&self) -> u64 {
        self.frames
    }

    fn write_snapshot(&mut self, frame: &DecodedFrame) {
        let Some(path) = self.path.as_ref() else {
            return;
        };
        if self
            .last_write
            .is_some_and(|at| at.elapsed() < SNAPSHOT_INTERVAL)
        {
            return;
        }
        self.last_write = Some(Instant::now());
        match frame.image.save_with_format(path, ImageFormat::Jpeg) {
            Ok(()) => debug!("snapshot written to {}", path.display()),
            Err(e) => warn!("snapshot write to {} failed: {e}", path.display()),
        }
    }
}

impl FramePresenter for SnapshotPresenter {
    fn present(&mut self, frame: DecodedFrame) {
        self.frames += 1;
        if self.frames == 1 {
            info!("first frame received: {}x{}", frame.width, frame.height);
        } else {
            trace!(frame = self.frames, "{}x{}", frame.width, frame.height);
        }
        self.write_snapshot(&frame);
    }
}
