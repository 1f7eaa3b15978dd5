use anyhow::Result;
use std::time::Duration;

use crate::detect::backend::{InferenceEngine, ModelInput};

/// Scripted engine for dry runs and tests.
///
/// Returns the same raw output for every call, optionally after a fixed delay to
/// simulate a slow accelerator.
pub struct StubEngine {
    input_size: (u32, u32),
    output: Vec<f32>,
    delay: Duration,
}

impl StubEngine {
    /// An engine that never detects anything.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            input_size: (width, height),
            output: Vec::new(),
            delay: Duration::ZERO,
        }
    }

    pub fn with_output(mut self, output: Vec<f32>) -> Self {
        self.output = output;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

impl InferenceEngine for StubEngine {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn input_size(&self) -> (u32, u32) {
        self.input_size
    }

    fn infer(&self, _input: &ModelInput) -> Result<Vec<f32>> {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        Ok(self.output.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_engine_replays_output() {
        let engine = StubEngine::new(64, 64).with_output(vec![1.0, 2.0]);
        let input = ModelInput {
            data: vec![0.0; 3 * 64 * 64],
            width: 64,
            height: 64,
        };
        assert_eq!(engine.infer(&input).unwrap(), vec![1.0, 2.0]);
        assert_eq!(engine.infer(&input).unwrap(), vec![1.0, 2.0]);
    }
}
