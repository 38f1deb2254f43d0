use ndarray::{Array, Array3, Ix4};
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

#[derive(Error, Debug)]
#[error("failed to load model: {0}")]
pub struct ModelLoadError(pub String);

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("model not loaded")]
    NotLoaded,
    #[error("inference failed: {0}")]
    Runtime(String),
    #[error("unexpected model output: {0}")]
    Output(String),
}

/// One raw candidate from the detection head: unfiltered, in model-native
/// order, with a corner-form `[x1, y1, x2, y2]` box in frame pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct RawPrediction {
    pub label: String,
    pub score: f32,
    pub corners: [f32; 4],
}

/// The detection capability behind the service. Kept as a trait so the
/// filter/annotator pipeline is testable against a deterministic fake.
pub trait Model: Send + Sync + 'static {
    /// Loads model weights. Called once at startup; a failure here is fatal
    /// and is never retried.
    fn warmup(&self) -> Result<(), ModelLoadError>;

    /// Runs forward inference on a `1 x C x H x W` float tensor.
    fn predict(&self, input: &Array<f32, Ix4>) -> Result<Vec<RawPrediction>, InferenceError>;
}

/// Wraps a [`Model`] with the readiness flag and the pixel-to-tensor
/// conversion. The flag is set exactly once, after a successful warmup, and
/// never cleared for the lifetime of the process.
pub struct ModelAdapter<M: Model> {
    model: M,
    ready: AtomicBool,
}

impl<M: Model> ModelAdapter<M> {
    pub fn new(model: M) -> Self {
        Self {
            model,
            ready: AtomicBool::new(false),
        }
    }

    pub fn warmup(&self) -> Result<(), ModelLoadError> {
        self.model.warmup()?;
        self.ready.store(true, Ordering::Release);
        tracing::info!("model warmup complete");
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Converts decoded pixels to the model's input scale and runs inference.
    /// The pixel array is only read; callers may keep using it afterwards.
    pub fn infer(&self, pixels: &Array3<u8>) -> Result<Vec<RawPrediction>, InferenceError> {
        let input = to_model_input(pixels);
        self.model.predict(&input)
    }
}

/// `H x W x C` u8 pixels to a normalized `1 x C x H x W` float tensor.
fn to_model_input(pixels: &Array3<u8>) -> Array<f32, Ix4> {
    let (height, width, channels) = pixels.dim();
    let mut input = Array::zeros((1, channels, height, width));
    for ((y, x, c), &value) in pixels.indexed_iter() {
        input[[0, c, y, x]] = f32::from(value) / 255.;
    }

    input
}
