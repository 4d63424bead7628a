pub mod capture;
pub mod viewer;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::CodecError;
use crate::protocol::framing::MAX_PAYLOAD;

/// Max width for captured frames.
/// Frames are downscaled to fit this while preserving aspect ratio.
pub const DEFAULT_MAX_WIDTH: u32 = 1280;
/// JPEG quality (1-100). Lower = smaller datagrams, faster encode.
pub const DEFAULT_JPEG_QUALITY: u8 = 70;
/// Quality floor used when shrinking a frame to fit one datagram
pub const MIN_JPEG_QUALITY: u8 = 20;
/// Frames are never shrunk below this width
pub const MIN_WIDTH: u32 = 160;
/// How long a capture request waits for the display to produce a frame
pub const DEFAULT_CAPTURE_TIMEOUT: Duration = Duration::from_millis(100);

/// Capture and compression parameters for the source side.
#[derive(Debug, Clone)]
pub struct EncodeSettings {
    /// 0 = primary display, n = n-th display in enumeration order
    pub monitor: usize,
    pub max_width: u32,
    pub quality: u8,
    /// Compressed frames must not exceed this many bytes
    pub max_payload: usize,
    pub capture_timeout: Duration,
}

impl Default for EncodeSettings {
    fn default() -> Self {
        Self {
            monitor: 0,
            max_width: DEFAULT_MAX_WIDTH,
            quality: DEFAULT_JPEG_QUALITY,
            max_payload: MAX_PAYLOAD,
            capture_timeout: DEFAULT_CAPTURE_TIMEOUT,
        }
    }
}

/// Produces one compressed frame per call.
///
/// The send loop calls this once per tick, and only when a viewer is
/// registered. Errors are tick-local.
#[async_trait]
pub trait FrameSource: Send + Sync {
    async fn capture_and_encode(&self) -> Result<Vec<u8>, CodecError>;
}
