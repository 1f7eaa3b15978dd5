//! Capture source abstraction.
//!
//! A `FrameSource` is one open handle on a camera: device, network stream or file.
//! `CameraStream` owns exactly one at a time and recreates it through a
//! `SourceFactory` on every reconnect, so a wedged handle is always discarded rather
//! than reused.

use anyhow::Result;
use image::RgbImage;
use std::sync::Arc;

use super::synthetic::SyntheticSource;
use crate::frame::CameraConfig;

/// One open capture handle.
pub trait FrameSource: Send {
    /// Open the device or stream. Must return within a bounded time.
    fn connect(&mut self) -> Result<()>;

    /// Read the next decoded frame. An error means the handle is no longer usable.
    fn read_frame(&mut self) -> Result<RgbImage>;

    /// Release the underlying device or handle.
    fn release(&mut self) {}

    /// Human-readable description for logs.
    fn describe(&self) -> String;
}

/// Builds a fresh source for a camera config.
pub type SourceFactory = Arc<dyn Fn(&CameraConfig) -> Result<Box<dyn FrameSource>> + Send + Sync>;

/// Factory that picks the backend from the source address.
///
/// `stub://` sources are synthetic. Everything else requires the
/// `capture-gstreamer` feature.
pub fn default_factory() -> SourceFactory {
    Arc::new(open_source)
}

pub fn open_source(config: &CameraConfig) -> Result<Box<dyn FrameSource>> {
    if config.source.starts_with("stub://") {
        return Ok(Box::new(SyntheticSource::new(config.clone())));
    }

    #[cfg(feature = "capture-gstreamer")]
    {
        Ok(Box::new(super::gstreamer::GstreamerSource::new(
            config.clone(),
        )?))
    }
    #[cfg(not(feature = "capture-gstreamer"))]
    {
        anyhow::bail!(
            "camera '{}': source '{}' requires the capture-gstreamer feature",
            config.name,
            config.source
        )
    }
}
