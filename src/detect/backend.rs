use anyhow::Result;

/// Preprocessed model input: one image, NCHW f32, values in 0..=1.
#[derive(Clone, Debug)]
pub struct ModelInput {
    pub data: Vec<f32>,
    pub width: u32,
    pub height: u32,
}

/// Compiled inference engine.
///
/// The engine is opaque: it takes one preprocessed image and returns raw output rows.
/// Each row is `[cx, cy, w, h, score_0, score_1, ...]` in model-input pixel space,
/// flattened into one vector. Interpretation (thresholds, NMS, scaling) belongs to
/// `Detector`.
///
/// `infer` takes `&self` so one engine can serve every camera's consumer thread
/// without a global lock. Implementations must not keep frame data between calls.
pub trait InferenceEngine: Send + Sync {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Model input size (width, height).
    fn input_size(&self) -> (u32, u32);

    /// Run the model once.
    fn infer(&self, input: &ModelInput) -> Result<Vec<f32>>;

    /// Optional warm-up hook.
    fn warm_up(&self) -> Result<()> {
        Ok(())
    }
}
