//! Detector: preprocessing, one engine call, post-processing.

use anyhow::{anyhow, Result};
use image::imageops::FilterType;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use super::backend::{InferenceEngine, ModelInput};
use super::nms::non_max_suppression;
use super::result::{BoundingBox, Detection};

pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.5;
pub const DEFAULT_NMS_THRESHOLD: f32 = 0.45;
pub const DEFAULT_MAX_DETECTIONS: usize = 100;

/// Channel order the model was trained with.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelOrder {
    #[default]
    Rgb,
    Bgr,
}

#[derive(Clone, Debug)]
pub struct DetectorSettings {
    /// Class labels, indexed by class id. The row width is `4 + labels.len()`.
    pub labels: Vec<String>,
    pub confidence_threshold: f32,
    pub nms_threshold: f32,
    pub max_detections: usize,
    pub channel_order: ChannelOrder,
}

impl DetectorSettings {
    pub fn new(labels: Vec<String>) -> Self {
        Self {
            labels,
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            nms_threshold: DEFAULT_NMS_THRESHOLD,
            max_detections: DEFAULT_MAX_DETECTIONS,
            channel_order: ChannelOrder::Rgb,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.labels.is_empty() {
            return Err(anyhow!("detector needs at least one class label"));
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(anyhow!(
                "confidence threshold {} is outside 0..=1",
                self.confidence_threshold
            ));
        }
        if !(0.0..=1.0).contains(&self.nms_threshold) {
            return Err(anyhow!("nms threshold {} is outside 0..=1", self.nms_threshold));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct DetectorStats {
    pub backend: &'static str,
    pub inferences: u64,
    pub average_latency_ms: f64,
    pub malformed_outputs: u64,
}

/// Stateless-per-call detector. Only the performance counters persist.
pub struct Detector {
    engine: Box<dyn InferenceEngine>,
    settings: DetectorSettings,
    inferences: AtomicU64,
    total_latency_us: AtomicU64,
    malformed_outputs: AtomicU64,
}

impl Detector {
    pub fn new(engine: Box<dyn InferenceEngine>, settings: DetectorSettings) -> Result<Self> {
        settings.validate()?;
        engine.warm_up()?;
        Ok(Self {
            engine,
            settings,
            inferences: AtomicU64::new(0),
            total_latency_us: AtomicU64::new(0),
            malformed_outputs: AtomicU64::new(0),
        })
    }

    pub fn settings(&self) -> &DetectorSettings {
        &self.settings
    }

    /// Run detection on one frame.
    pub fn detect(&self, image: &RgbImage) -> Result<Vec<Detection>> {
        let input = self.preprocess(image);
        let started = Instant::now();
        let raw = self.engine.infer(&input)?;
        self.record_latency(started.elapsed());
        Ok(self.postprocess(&raw, image.width(), image.height()))
    }

    /// Resize to the model input, apply channel order, normalize to 0..1, lay out NCHW.
    pub fn preprocess(&self, image: &RgbImage) -> ModelInput {
        let (in_w, in_h) = self.engine.input_size();
        let resized;
        let source = if image.dimensions() == (in_w, in_h) {
            image
        } else {
            resized = image::imageops::resize(image, in_w, in_h, FilterType::Triangle);
            &resized
        };

        let plane = (in_w * in_h) as usize;
        let mut data = vec![0f32; plane * 3];
        for (x, y, pixel) in source.enumerate_pixels() {
            let idx = (y * in_w + x) as usize;
            let [r, g, b] = pixel.0;
            let (c0, c2) = match self.settings.channel_order {
                ChannelOrder::Rgb => (r, b),
                ChannelOrder::Bgr => (b, r),
            };
            data[idx] = c0 as f32 / 255.0;
            data[plane + idx] = g as f32 / 255.0;
            data[2 * plane + idx] = c2 as f32 / 255.0;
        }
        ModelInput {
            data,
            width: in_w,
            height: in_h,
        }
    }

    /// Turn raw engine rows into detections in original-image pixel space.
    ///
    /// A raw buffer whose length is not a multiple of the row width is treated as
    /// "no detections".
    pub fn postprocess(&self, raw: &[f32], orig_width: u32, orig_height: u32) -> Vec<Detection> {
        let num_classes = self.settings.labels.len();
        let row_width = 4 + num_classes;
        if raw.is_empty() {
            return Vec::new();
        }
        if raw.len() % row_width != 0 {
            self.malformed_outputs.fetch_add(1, Ordering::Relaxed);
            log::debug!(
                "detector output of {} values is not a multiple of row width {}; ignoring",
                raw.len(),
                row_width
            );
            return Vec::new();
        }

        let (in_w, in_h) = self.engine.input_size();
        let sx = orig_width as f32 / in_w as f32;
        let sy = orig_height as f32 / in_h as f32;
        let (fw, fh) = (orig_width as f32, orig_height as f32);

        let mut candidates = Vec::new();
        for row in raw.chunks_exact(row_width) {
            let scores = &row[4..];
            let Some((class_id, &score)) = scores
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
            else {
                continue;
            };
            if !score.is_finite() || score < self.settings.confidence_threshold {
                continue;
            }
            let bbox = BoundingBox::from_center(row[0], row[1], row[2], row[3])
                .scaled(sx, sy)
                .clamped(fw, fh);
            if bbox.area() <= 0.0 {
                continue;
            }
            candidates.push(Detection {
                label: self.settings.labels[class_id].clone(),
                class_id,
                confidence: score.min(1.0),
                bbox,
                bbox_normalized: bbox.scaled(1.0 / fw, 1.0 / fh),
            });
        }

        non_max_suppression(
            candidates,
            self.settings.nms_threshold,
            self.settings.max_detections,
        )
    }

    fn record_latency(&self, elapsed: Duration) {
        self.inferences.fetch_add(1, Ordering::Relaxed);
        self.total_latency_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn stats(&self) -> DetectorStats {
        let inferences = self.inferences.load(Ordering::Relaxed);
        let total_us = self.total_latency_us.load(Ordering::Relaxed);
        DetectorStats {
            backend: self.engine.name(),
            inferences,
            average_latency_ms: if inferences == 0 {
                0.0
            } else {
                total_us as f64 / inferences as f64 / 1000.0
            },
            malformed_outputs: self.malformed_outputs.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::backends::StubEngine;

    fn labels() -> Vec<String> {
        vec!["deer".to_string(), "boar".to_string()]
    }

    fn detector(output: Vec<f32>) -> Detector {
        let engine = StubEngine::new(100, 100).with_output(output);
        Detector::new(Box::new(engine), DetectorSettings::new(labels())).unwrap()
    }

    #[test]
    fn scales_boxes_to_original_frame() {
        // One deer centered at (50, 50), 20x20 in a 100x100 model input.
        let det = detector(vec![50.0, 50.0, 20.0, 20.0, 0.9, 0.1]);
        let out = det.detect(&RgbImage::new(200, 100)).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].label, "deer");
        assert_eq!(out[0].bbox, BoundingBox::new(80.0, 40.0, 120.0, 60.0));
        assert!((out[0].bbox_normalized.x1 - 0.4).abs() < 1e-6);
        assert!((out[0].bbox_normalized.y2 - 0.6).abs() < 1e-6);
    }

    #[test]
    fn picks_argmax_class_and_applies_threshold() {
        let det = detector(Vec::new());
        let raw = [
            50.0, 50.0, 10.0, 10.0, 0.2, 0.7, // boar
            10.0, 10.0, 5.0, 5.0, 0.3, 0.4, // below threshold
        ];
        let out = det.postprocess(&raw, 100, 100);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].class_id, 1);
        assert_eq!(out[0].label, "boar");
    }

    #[test]
    fn malformed_output_is_no_detections() {
        let det = detector(vec![1.0, 2.0, 3.0, 4.0, 5.0]);
        let out = det.detect(&RgbImage::new(100, 100)).unwrap();
        assert!(out.is_empty());
        assert_eq!(det.stats().malformed_outputs, 1);
    }

    #[test]
    fn overlapping_same_class_rows_are_suppressed() {
        let det = detector(vec![
            50.0, 50.0, 20.0, 20.0, 0.8, 0.0, //
            51.0, 51.0, 20.0, 20.0, 0.95, 0.0, //
            50.0, 50.0, 20.0, 20.0, 0.0, 0.85, // other class, same place
        ]);
        let out = det.detect(&RgbImage::new(100, 100)).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].confidence, 0.95);
        assert_eq!(out[1].label, "boar");
    }

    #[test]
    fn preprocess_produces_nchw_in_unit_range() {
        let det = detector(Vec::new());
        let mut image = RgbImage::new(100, 100);
        image.put_pixel(0, 0, image::Rgb([255, 0, 51]));
        let input = det.preprocess(&image);
        assert_eq!(input.data.len(), 3 * 100 * 100);
        assert_eq!(input.data[0], 1.0);
        assert_eq!(input.data[100 * 100], 0.0);
        assert!((input.data[2 * 100 * 100] - 0.2).abs() < 1e-6);
    }

    #[test]
    fn counts_inferences() {
        let det = detector(Vec::new());
        det.detect(&RgbImage::new(10, 10)).unwrap();
        det.detect(&RgbImage::new(10, 10)).unwrap();
        let stats = det.stats();
        assert_eq!(stats.inferences, 2);
        assert_eq!(stats.backend, "stub");
    }

    #[test]
    fn rejects_empty_labels() {
        let engine = StubEngine::new(10, 10);
        assert!(Detector::new(Box::new(engine), DetectorSettings::new(Vec::new())).is_err());
    }
}
