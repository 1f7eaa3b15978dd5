//! Frame ingestion.
//!
//! This module provides:
//! - `FrameSource`: one open capture handle (synthetic `stub://`, or GStreamer with the
//!   `capture-gstreamer` feature for devices, network streams and files)
//! - `CameraStream`: supervised capture loop for one camera
//!
//! The ingestion layer is responsible for:
//! - Reconnecting flaky sources within a bounded retry budget
//! - Assigning per-camera sequence numbers at capture time
//! - Pacing reads to the configured frame rate
//! - Dropping frames, never stalling, when consumers fall behind

mod camera;
#[cfg(feature = "capture-gstreamer")]
pub mod gstreamer;
pub mod source;
pub mod synthetic;

pub use camera::{
    CameraState, CameraStats, CameraStream, StreamSettings, DEFAULT_MAX_RECONNECT_ATTEMPTS,
    DEFAULT_RECONNECT_DELAY,
};
pub use source::{default_factory, open_source, FrameSource, SourceFactory};
pub use synthetic::SyntheticSource;
