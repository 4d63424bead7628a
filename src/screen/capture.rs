//! Screen capture pipeline.
//!
//! Captures the configured display, downscales to `max_width`,
//! JPEG-compresses, and shrinks the result until it fits one datagram.
//! The platform capturer is `!Send` on X11, so it lives on a dedicated
//! thread that serves one capture request at a time.

use async_trait::async_trait;
use image::codecs::jpeg::JpegEncoder;
use image::{ImageBuffer, RgbImage};
use scrap::{Capturer, Display};
use std::io::{Cursor, ErrorKind};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::{EncodeSettings, FrameSource, MIN_JPEG_QUALITY, MIN_WIDTH};
use crate::error::CodecError;

type CaptureReply = oneshot::Sender<Result<Vec<u8>, CodecError>>;

/// Quality drop per retry when a frame is over budget
const QUALITY_STEP: u8 = 15;

/// Handle to the capture thread. Dropping it stops the thread.
pub struct ScreenCapture {
    requests: mpsc::UnboundedSender<CaptureReply>,
}

impl ScreenCapture {
    /// Spawn the capture thread. The display itself is opened lazily on the
    /// first request, so a missing display only fails individual ticks.
    pub fn start(settings: EncodeSettings) -> std::io::Result<Self> {
        let (requests, mut rx) = mpsc::unbounded_channel::<CaptureReply>();

        std::thread::Builder::new()
            .name("srvnc-capture".into())
            .spawn(move || {
                let mut worker = CaptureWorker::new(settings);
                while let Some(reply) = rx.blocking_recv() {
                    let _ = reply.send(worker.grab());
                }
                debug!("capture thread exiting");
            })?;

        Ok(Self { requests })
    }
}

#[async_trait]
impl FrameSource for ScreenCapture {
    async fn capture_and_encode(&self) -> Result<Vec<u8>, CodecError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.requests
            .send(reply_tx)
            .map_err(|_| CodecError::Capture("capture thread has stopped".into()))?;
        reply_rx
            .await
            .map_err(|_| CodecError::Capture("capture thread dropped the request".into()))?
    }
}

enum Grab {
    Fresh(Vec<u8>),
    NotReady,
}

struct CaptureWorker {
    settings: EncodeSettings,
    capturer: Option<Capturer>,
    /// Last good frame, resent when the display has nothing new
    last: Option<Vec<u8>>,
}

impl CaptureWorker {
    fn new(settings: EncodeSettings) -> Self {
        Self {
            settings,
            capturer: None,
            last: None,
        }
    }

    fn grab(&mut self) -> Result<Vec<u8>, CodecError> {
        if self.capturer.is_none() {
            self.capturer = Some(open_capturer(self.settings.monitor)?);
        }
        let Some(capturer) = self.capturer.as_mut() else {
            return Err(CodecError::Capture("capturer unavailable".into()));
        };

        let deadline = Instant::now() + self.settings.capture_timeout;
        match grab_from(capturer, &self.settings, deadline) {
            Ok(Grab::Fresh(jpeg)) => {
                self.last = Some(jpeg.clone());
                Ok(jpeg)
            }
            Ok(Grab::NotReady) => self.last.clone().ok_or_else(|| {
                CodecError::Capture(format!(
                    "no frame ready within {:?}",
                    self.settings.capture_timeout
                ))
            }),
            Err(e @ CodecError::Capture(_)) => {
                // Reopen on the next request.
                warn!("dropping capturer after error: {e}");
                self.capturer = None;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }
}

fn open_capturer(monitor: usize) -> Result<Capturer, CodecError> {
    let display = if monitor == 0 {
        Display::primary().map_err(|e| CodecError::Capture(format!("no display found: {e}")))?
    } else {
        let mut displays =
            Display::all().map_err(|e| CodecError::Capture(format!("no display found: {e}")))?;
        if monitor > displays.len() {
            return Err(CodecError::Capture(format!(
                "monitor {monitor} requested but only {} available",
                displays.len()
            )));
        }
        displays.swap_remove(monitor - 1)
    };
    Capturer::new(display).map_err(|e| CodecError::Capture(format!("failed to start: {e}")))
}

fn grab_from(
    capturer: &mut Capturer,
    settings: &EncodeSettings,
    deadline: Instant,
) -> Result<Grab, CodecError> {
    let (src_w, src_h) = (capturer.width(), capturer.height());
    loop {
        match capturer.frame() {
            Ok(frame) => {
                // scrap gives us BGRA pixels (stride may include padding)
                let stride = frame.len() / src_h.max(1);
                return encode_frame(&frame, src_w, src_h, stride, settings).map(Grab::Fresh);
            }
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    return Ok(Grab::NotReady);
                }
                std::thread::sleep(Duration::from_millis(5));
            }
            Err(e) => return Err(CodecError::Capture(e.to_string())),
        }
    }
}

/// Compress one BGRA frame to a JPEG no larger than `settings.max_payload`.
///
/// Quality is lowered first, then resolution is halved, until the result
/// fits or the frame would shrink below [`MIN_WIDTH`].
pub fn encode_frame(
    bgra: &[u8],
    src_w: usize,
    src_h: usize,
    stride: usize,
    settings: &EncodeSettings,
) -> Result<Vec<u8>, CodecError> {
    if src_w == 0 || src_h == 0 {
        return Err(CodecError::Capture("empty frame".into()));
    }
    if stride < src_w * 4 || bgra.len() < stride * src_h {
        return Err(CodecError::Capture(format!(
            "short frame: {} bytes for {src_w}x{src_h} (stride {stride})",
            bgra.len()
        )));
    }

    let (mut out_w, mut out_h) = scaled_dimensions(src_w, src_h, settings.max_width);
    loop {
        let rgb = bgra_to_rgb_scaled(bgra, src_w, src_h, stride, out_w, out_h);
        let mut quality = settings.quality.clamp(1, 100);
        loop {
            let jpeg = jpeg_encode(&rgb, out_w, out_h, quality)?;
            if jpeg.len() <= settings.max_payload {
                return Ok(jpeg);
            }
            if quality <= MIN_JPEG_QUALITY {
                break;
            }
            quality = quality.saturating_sub(QUALITY_STEP).max(MIN_JPEG_QUALITY);
        }
        if out_w / 2 < MIN_WIDTH.min(src_w as u32) {
            return Err(CodecError::Encode(format!(
                "frame does not fit {} bytes even at {out_w}x{out_h}",
                settings.max_payload
            )));
        }
        out_w /= 2;
        out_h = (out_h / 2).max(1);
    }
}

/// Output size after downscaling to `max_width`, preserving aspect ratio.
fn scaled_dimensions(src_w: usize, src_h: usize, max_width: u32) -> (u32, u32) {
    let max_width = max_width.max(1);
    if src_w as u32 > max_width {
        let scale = max_width as f64 / src_w as f64;
        let new_h = ((src_h as f64 * scale) as u32).max(1);
        (max_width, new_h)
    } else {
        (src_w as u32, src_h as u32)
    }
}

/// Convert BGRA buffer to RGB, optionally downscaling via nearest-neighbor
fn bgra_to_rgb_scaled(
    bgra: &[u8],
    src_w: usize,
    src_h: usize,
    stride: usize,
    dst_w: u32,
    dst_h: u32,
) -> Vec<u8> {
    let mut rgb = Vec::with_capacity((dst_w * dst_h * 3) as usize);

    for y in 0..dst_h {
        let src_y = (y as usize * src_h) / dst_h as usize;
        for x in 0..dst_w {
            let src_x = (x as usize * src_w) / dst_w as usize;
            let offset = src_y * stride + src_x * 4;
            match bgra.get(offset..offset + 3) {
                Some(px) => rgb.extend_from_slice(&[px[2], px[1], px[0]]),
                None => rgb.extend_from_slice(&[0, 0, 0]),
            }
        }
    }

    rgb
}

fn jpeg_encode(rgb: &[u8], width: u32, height: u32, quality: u8) -> Result<Vec<u8>, CodecError> {
    let mut buf = Cursor::new(Vec::new());
    let encoder = JpegEncoder::new_with_quality(&mut buf, quality);

    let img: RgbImage = ImageBuffer::from_raw(width, height, rgb.to_vec())
        .ok_or_else(|| CodecError::Encode(format!("invalid image dimensions {width}x{height}")))?;

    img.write_with_encoder(encoder)
        .map_err(|e| CodecError::Encode(format!("JPEG encode failed: {e}")))?;

    Ok(buf.into_inner())
}
