//! GStreamer-backed capture for real cameras.
//!
//! One pipeline per connection, ending in an RGB appsink that keeps only the newest
//! buffer. The source element depends on the transport kind:
//!
//! - local device: `v4l2src`
//! - network stream: `rtspsrc` for `rtsp://`, `uridecodebin` otherwise
//! - file: `filesrc ! decodebin`

#![cfg(feature = "capture-gstreamer")]

use anyhow::{anyhow, Context, Result};
use gstreamer::prelude::*;
use image::RgbImage;
use std::time::Duration;

use super::source::FrameSource;
use crate::frame::{CameraConfig, TransportKind};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct GstreamerSource {
    config: CameraConfig,
    pipeline: Option<gstreamer::Pipeline>,
    appsink: Option<gstreamer_app::AppSink>,
}

impl GstreamerSource {
    pub fn new(config: CameraConfig) -> Result<Self> {
        gstreamer::init().context("initialize gstreamer")?;
        Ok(Self {
            config,
            pipeline: None,
            appsink: None,
        })
    }

    fn pipeline_description(&self) -> String {
        let src = match self.config.transport {
            TransportKind::LocalDevice => format!("v4l2src device={}", self.config.source),
            TransportKind::NetworkStream if self.config.source.starts_with("rtsp://") => {
                format!(
                    "rtspsrc location={} latency=0 ! decodebin",
                    self.config.source
                )
            }
            TransportKind::NetworkStream => format!("uridecodebin uri={}", self.config.source),
            TransportKind::File => format!("filesrc location={} ! decodebin", self.config.source),
        };
        format!(
            "{src} ! videoconvert ! videoscale ! video/x-raw,format=RGB,width={w},height={h} ! \
             appsink name=appsink sync=false max-buffers=1 drop=true",
            w = self.config.width,
            h = self.config.height
        )
    }

    /// Read timeout: four frame intervals, never below 500 ms.
    fn frame_timeout(&self) -> gstreamer::ClockTime {
        let base_ms = if self.config.target_fps == 0 {
            500
        } else {
            (1000 / self.config.target_fps).saturating_mul(4)
        };
        gstreamer::ClockTime::from_mseconds(base_ms.max(500) as u64)
    }

    fn check_bus(&self) -> Result<()> {
        let Some(pipeline) = self.pipeline.as_ref() else {
            return Ok(());
        };
        let Some(bus) = pipeline.bus() else {
            return Ok(());
        };
        while let Some(message) = bus.pop() {
            use gstreamer::MessageView;
            match message.view() {
                MessageView::Error(err) => {
                    return Err(anyhow!(
                        "gstreamer error from {:?}: {}",
                        err.src().map(|s| s.path_string()),
                        err.error()
                    ));
                }
                MessageView::Eos(..) => return Err(anyhow!("stream reached end of stream")),
                _ => {}
            }
        }
        Ok(())
    }
}

impl FrameSource for GstreamerSource {
    fn connect(&mut self) -> Result<()> {
        self.release();

        let pipeline = gstreamer::parse::launch(&self.pipeline_description())
            .context("build capture pipeline")?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow!("capture pipeline is not a Pipeline"))?;
        let appsink = pipeline
            .by_name("appsink")
            .context("appsink element missing from pipeline")?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| anyhow!("appsink element has unexpected type"))?;

        pipeline
            .set_state(gstreamer::State::Playing)
            .context("set capture pipeline to Playing")?;
        let (result, _, _) = pipeline.state(gstreamer::ClockTime::from_mseconds(
            CONNECT_TIMEOUT.as_millis() as u64,
        ));
        if let Err(err) = result {
            let _ = pipeline.set_state(gstreamer::State::Null);
            return Err(anyhow!(
                "camera '{}' did not start within {:?}: {:?}",
                self.config.name,
                CONNECT_TIMEOUT,
                err
            ));
        }

        self.pipeline = Some(pipeline);
        self.appsink = Some(appsink);
        log::info!(
            "camera '{}': connected to {}",
            self.config.name,
            self.config.source
        );
        Ok(())
    }

    fn read_frame(&mut self) -> Result<RgbImage> {
        self.check_bus()?;
        let timeout = self.frame_timeout();
        let appsink = self
            .appsink
            .as_ref()
            .ok_or_else(|| anyhow!("capture source not connected"))?;
        let sample = appsink
            .try_pull_sample(timeout)
            .ok_or_else(|| anyhow!("capture stream stalled"))?;
        sample_to_image(&sample)
    }

    fn release(&mut self) {
        if let Some(pipeline) = self.pipeline.take() {
            if let Err(err) = pipeline.set_state(gstreamer::State::Null) {
                log::warn!(
                    "camera '{}': failed to stop pipeline: {:?}",
                    self.config.name,
                    err
                );
            }
        }
        self.appsink = None;
    }

    fn describe(&self) -> String {
        format!("gstreamer:{}", self.config.source)
    }
}

impl Drop for GstreamerSource {
    fn drop(&mut self) {
        self.release();
    }
}

fn sample_to_image(sample: &gstreamer::Sample) -> Result<RgbImage> {
    let buffer = sample.buffer().context("sample missing buffer")?;
    let caps = sample.caps().context("sample missing caps")?;
    let info = gstreamer_video::VideoInfo::from_caps(caps).context("parse caps as video info")?;

    let width = info.width();
    let height = info.height();
    let row_bytes = (width as usize) * 3;
    let stride = info.stride()[0] as usize;

    let map = buffer.map_readable().context("map capture buffer")?;
    let data = map.as_slice();

    let pixels = if stride == row_bytes {
        data.get(..row_bytes * height as usize)
            .context("capture buffer is shorter than the frame")?
            .to_vec()
    } else {
        let mut pixels = Vec::with_capacity(row_bytes * height as usize);
        for row in 0..height as usize {
            let start = row * stride;
            pixels.extend_from_slice(
                data.get(start..start + row_bytes)
                    .context("capture buffer row is out of bounds")?,
            );
        }
        pixels
    };

    RgbImage::from_raw(width, height, pixels)
        .ok_or_else(|| anyhow!("capture buffer does not match {}x{} RGB", width, height))
}
