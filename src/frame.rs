//! Camera configuration and captured frames.
//!
//! - `CameraConfig`: immutable description of one capture source.
//! - `CapturedFrame`: one decoded RGB frame with its per-camera sequence number.
//!
//! A `CapturedFrame` is owned by the capture loop until it is handed to the bounded
//! queue; whoever dequeues it owns it from then on. Frames are not `Clone` so that a
//! frame cannot silently end up in two pipelines.

use anyhow::{anyhow, Result};
use image::RgbImage;
use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// CameraConfig
// ----------------------------------------------------------------------------

/// How a capture source is reached.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Local V4L2-style device, e.g. `/dev/video0`.
    LocalDevice,
    /// Network stream, e.g. `rtsp://10.0.0.5:554/stream1`.
    NetworkStream,
    /// Local video file.
    File,
}

/// Configuration for one camera.
///
/// Immutable after creation: changing any field means building a new config and
/// replacing the stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CameraConfig {
    /// Unique camera name.
    pub name: String,
    /// Source address (device path, stream URL, file path or `stub://...`).
    pub source: String,
    pub transport: TransportKind,
    /// Target frame rate (frames per second). The capture loop paces reads to this rate.
    #[serde(default = "default_fps")]
    pub target_fps: u32,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_fps() -> u32 {
    10
}

fn default_width() -> u32 {
    640
}

fn default_height() -> u32 {
    480
}

fn default_enabled() -> bool {
    true
}

impl CameraConfig {
    pub fn new(name: impl Into<String>, source: impl Into<String>, transport: TransportKind) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            transport,
            target_fps: default_fps(),
            width: default_width(),
            height: default_height(),
            enabled: default_enabled(),
        }
    }

    pub fn with_fps(mut self, fps: u32) -> Self {
        self.target_fps = fps;
        self
    }

    pub fn with_resolution(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(anyhow!("camera name must not be empty"));
        }
        if self.source.trim().is_empty() {
            return Err(anyhow!("camera '{}' has an empty source", self.name));
        }
        if self.width == 0 || self.height == 0 {
            return Err(anyhow!(
                "camera '{}' resolution {}x{} is invalid",
                self.name,
                self.width,
                self.height
            ));
        }
        Ok(())
    }

    /// Minimum spacing between reads implied by `target_fps` (zero = unpaced).
    pub fn frame_interval(&self) -> std::time::Duration {
        if self.target_fps == 0 {
            std::time::Duration::from_millis(0)
        } else {
            std::time::Duration::from_millis((1000 / self.target_fps).max(1) as u64)
        }
    }
}

// ----------------------------------------------------------------------------
// CapturedFrame
// ----------------------------------------------------------------------------

/// One decoded frame from a camera.
pub struct CapturedFrame {
    /// RGB8 pixels.
    pub image: RgbImage,
    /// Per-camera sequence number; strictly increasing, never reused.
    pub sequence: u64,
    /// Capture time in milliseconds since the Unix epoch.
    pub captured_at_ms: u64,
}

impl CapturedFrame {
    pub fn new(image: RgbImage, sequence: u64, captured_at_ms: u64) -> Self {
        Self {
            image,
            sequence,
            captured_at_ms,
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Encode the frame as JPEG for upload.
    pub fn encode_jpeg(&self, quality: u8) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut encoder =
            image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100));
        encoder.encode_image(&self.image)?;
        Ok(out)
    }
}

impl std::fmt::Debug for CapturedFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Pixel data is deliberately left out.
        f.debug_struct("CapturedFrame")
            .field("sequence", &self.sequence)
            .field("captured_at_ms", &self.captured_at_ms)
            .field("width", &self.image.width())
            .field("height", &self.image.height())
            .finish()
    }
}
