#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use tract_onnx::prelude::*;

use crate::detect::backend::{InferenceEngine, ModelInput};

/// Memory layout of the model's detection output tensor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputLayout {
    /// `[1, rows, 4 + classes]`.
    RowsFirst,
    /// `[1, 4 + classes, rows]`, as exported by YOLOv8-family models.
    FeaturesFirst,
}

/// Tract-based engine for ONNX detection models.
///
/// Loads a local model file once; every call runs the optimized plan. No network I/O
/// and no writes beyond model loading.
pub struct TractEngine {
    model: TypedRunnableModel<TypedModel>,
    width: u32,
    height: u32,
    layout: OutputLayout,
}

impl TractEngine {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(model_path: P, width: u32, height: u32) -> Result<Self> {
        let model_path = model_path.as_ref();
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(
                    f32::datum_type(),
                    tvec!(1, 3, height as usize, width as usize),
                ),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            model,
            width,
            height,
            layout: OutputLayout::FeaturesFirst,
        })
    }

    pub fn with_layout(mut self, layout: OutputLayout) -> Self {
        self.layout = layout;
        self
    }

    fn build_input(&self, input: &ModelInput) -> Result<Tensor> {
        if input.width != self.width || input.height != self.height {
            return Err(anyhow!(
                "input size {}x{} does not match model input {}x{}",
                input.width,
                input.height,
                self.width,
                self.height
            ));
        }
        let array = tract_ndarray::Array4::from_shape_vec(
            (1, 3, self.height as usize, self.width as usize),
            input.data.clone(),
        )
        .context("input buffer does not match 1x3xHxW")?;
        Ok(array.into_tensor())
    }

    fn flatten_rows(&self, outputs: TVec<TValue>) -> Result<Vec<f32>> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        let shape = view.shape().to_vec();
        if shape.len() != 3 || shape[0] != 1 {
            // Unknown shape: hand the raw values over and let post-processing decide.
            return Ok(view.iter().copied().collect());
        }
        match self.layout {
            OutputLayout::RowsFirst => Ok(view.iter().copied().collect()),
            OutputLayout::FeaturesFirst => {
                let view = view
                    .into_dimensionality::<tract_ndarray::Ix3>()
                    .context("model output is not three-dimensional")?;
                let (features, rows) = (shape[1], shape[2]);
                let mut flat = Vec::with_capacity(features * rows);
                for row in 0..rows {
                    for feature in 0..features {
                        flat.push(view[[0, feature, row]]);
                    }
                }
                Ok(flat)
            }
        }
    }
}

impl InferenceEngine for TractEngine {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn input_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn infer(&self, input: &ModelInput) -> Result<Vec<f32>> {
        let tensor = self.build_input(input)?;
        let outputs = self
            .model
            .run(tvec!(tensor.into()))
            .context("ONNX inference failed")?;
        self.flatten_rows(outputs)
    }

    fn warm_up(&self) -> Result<()> {
        let input = ModelInput {
            data: vec![0.0; 3 * self.width as usize * self.height as usize],
            width: self.width,
            height: self.height,
        };
        self.infer(&input).map(|_| ())
    }
}
