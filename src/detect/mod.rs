mod backend;
pub mod backends;
mod detector;
mod nms;
mod result;

pub use backend::{InferenceEngine, ModelInput};
pub use backends::StubEngine;
pub use detector::{
    ChannelOrder, Detector, DetectorSettings, DetectorStats, DEFAULT_CONFIDENCE_THRESHOLD,
    DEFAULT_MAX_DETECTIONS, DEFAULT_NMS_THRESHOLD,
};
pub use nms::non_max_suppression;
pub use result::{BoundingBox, Detection, DetectionResult};
