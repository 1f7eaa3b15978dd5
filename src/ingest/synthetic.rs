//! Synthetic frame source for `stub://` addresses.
//!
//! Produces a moving gradient at the configured resolution. Used for dry runs
//! without camera hardware and by tests.

use anyhow::{anyhow, Result};
use image::RgbImage;

use super::source::FrameSource;
use crate::frame::CameraConfig;

pub struct SyntheticSource {
    config: CameraConfig,
    frame_count: u64,
    /// Simulated scene state; changes every 50 frames.
    scene_state: u8,
    connected: bool,
}

impl SyntheticSource {
    pub fn new(config: CameraConfig) -> Self {
        Self {
            config,
            frame_count: 0,
            scene_state: 0,
            connected: false,
        }
    }

    fn generate(&mut self) -> RgbImage {
        if self.frame_count % 50 == 0 {
            self.scene_state = self.scene_state.wrapping_add(1);
        }
        let shift = self.frame_count + self.scene_state as u64;
        RgbImage::from_fn(self.config.width, self.config.height, |x, y| {
            let base = (x as u64 + y as u64 + shift) % 256;
            image::Rgb([base as u8, (base / 2) as u8, (255 - base) as u8])
        })
    }
}

impl FrameSource for SyntheticSource {
    /// Synthetic sources are always reachable.
    fn connect(&mut self) -> Result<()> {
        log::info!(
            "camera '{}': connected to {} (synthetic)",
            self.config.name,
            self.config.source
        );
        self.connected = true;
        Ok(())
    }

    fn read_frame(&mut self) -> Result<RgbImage> {
        if !self.connected {
            return Err(anyhow!("synthetic source read before connect"));
        }
        self.frame_count += 1;
        Ok(self.generate())
    }

    fn release(&mut self) {
        self.connected = false;
    }

    fn describe(&self) -> String {
        format!("synthetic:{}", self.config.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::TransportKind;

    #[test]
    fn synthetic_frames_change_over_time() -> Result<()> {
        let cfg = CameraConfig::new("a", "stub://a", TransportKind::File).with_resolution(16, 16);
        let mut source = SyntheticSource::new(cfg);
        source.connect()?;
        let first = source.read_frame()?;
        let second = source.read_frame()?;
        assert_ne!(first.as_raw(), second.as_raw());
        Ok(())
    }

    #[test]
    fn synthetic_read_requires_connect() {
        let cfg = CameraConfig::new("a", "stub://a", TransportKind::File);
        let mut source = SyntheticSource::new(cfg);
        assert!(source.read_frame().is_err());
    }
}
