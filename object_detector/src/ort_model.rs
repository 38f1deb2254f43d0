use crate::{
    config::{Device, LabelsSettings, ModelSettings, Validatable},
    model_service::{InferenceError, Model, ModelLoadError, RawPrediction},
};
use ndarray::{Array, ArrayD, ArrayView2, Axis, Ix4};
use ort::{
    execution_providers::CUDAExecutionProvider,
    session::{builder::GraphOptimizationLevel, Session},
    value::TensorRef,
};
use std::{
    fs::File,
    io::{self, BufRead},
    path::PathBuf,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, OnceLock,
    },
};

const DETECTION_OUTPUT: &str = "dets";

/// ONNX Runtime backend. Expects a detection model whose output is an
/// NMS-suppressed `[1, N, 6]` (or `[N, 6]`) tensor of
/// `[x1, y1, x2, y2, score, class]` rows in frame pixels.
pub struct OrtModel {
    model: ModelSettings,
    labels: LabelsSettings,
    runtime: OnceLock<OrtRuntime>,
}

struct OrtRuntime {
    sessions: Vec<Arc<Mutex<Session>>>,
    counter: AtomicUsize,
    class_labels: Vec<String>,
}

impl OrtModel {
    pub fn new(model: &ModelSettings, labels: &LabelsSettings) -> Self {
        Self {
            model: model.clone(),
            labels: labels.clone(),
            runtime: OnceLock::new(),
        }
    }
}

impl Model for OrtModel {
    fn warmup(&self) -> Result<(), ModelLoadError> {
        if self.runtime.get().is_some() {
            return Ok(());
        }

        self.model.validate().map_err(ModelLoadError)?;
        self.labels.validate().map_err(ModelLoadError)?;

        let class_labels = load_class_labels(&self.labels.get_path())
            .map_err(|e| ModelLoadError(format!("failed to load labels: {}", e)))?;

        let init = match self.model.device {
            Device::Cuda => {
                ort::init().with_execution_providers([CUDAExecutionProvider::default().build()])
            }
            Device::Cpu => ort::init(),
        };
        init.commit()
            .map_err(|e| ModelLoadError(format!("failed to initialize onnx runtime: {}", e)))?;

        let sessions = (0..self.model.num_instances)
            .map(|_| {
                let session = Session::builder()?
                    .with_optimization_level(GraphOptimizationLevel::Level3)?
                    .commit_from_file(self.model.get_path())?;
                Ok(Arc::new(Mutex::new(session)))
            })
            .collect::<Result<Vec<_>, ort::Error>>()
            .map_err(|e| ModelLoadError(e.to_string()))?;

        tracing::info!(
            "Created {} ONNX sessions on {:?}",
            sessions.len(),
            self.model.device
        );

        let _ = self.runtime.set(OrtRuntime {
            sessions,
            counter: AtomicUsize::new(0),
            class_labels,
        });

        Ok(())
    }

    fn predict(&self, input: &Array<f32, Ix4>) -> Result<Vec<RawPrediction>, InferenceError> {
        let runtime = self.runtime.get().ok_or(InferenceError::NotLoaded)?;

        let index = runtime.counter.fetch_add(1, Ordering::SeqCst) % runtime.sessions.len();
        let mut session = runtime.sessions[index]
            .lock()
            .map_err(|e| InferenceError::Runtime(format!("session mutex poisoned: {}", e)))?;

        tracing::debug!("Handling request with session {}", index);
        let owned_buffer;
        let input_view = if input.view().is_standard_layout() {
            input.view()
        } else {
            owned_buffer = input.to_owned();
            owned_buffer.view()
        };

        let tensor_ref = TensorRef::from_array_view(input_view)
            .map_err(|e| InferenceError::Runtime(format!("failed to build tensor: {}", e)))?;

        let outputs = session
            .run(ort::inputs![tensor_ref])
            .map_err(|e| InferenceError::Runtime(format!("inference failed: {}", e)))?;

        let (shape, data) = outputs[DETECTION_OUTPUT]
            .try_extract_tensor::<f32>()
            .map_err(|e| InferenceError::Runtime(format!("failed to extract tensor: {}", e)))?;

        let ix = shape.to_ixdyn();
        let array = ArrayD::from_shape_vec(ix, data.to_vec())
            .map_err(|e| InferenceError::Output(format!("invalid tensor shape: {}", e)))?;

        parse_detections(&array, &runtime.class_labels)
    }
}

/// Turns the raw output tensor into candidates, mapping class indices to the
/// configured label list.
fn parse_detections(
    output: &ArrayD<f32>,
    class_labels: &[String],
) -> Result<Vec<RawPrediction>, InferenceError> {
    let rows: ArrayView2<f32> = match output.ndim() {
        2 => output
            .view()
            .into_dimensionality()
            .map_err(|e| InferenceError::Output(e.to_string()))?,
        3 if output.shape()[0] == 1 => output
            .index_axis(Axis(0), 0)
            .into_dimensionality()
            .map_err(|e| InferenceError::Output(e.to_string()))?,
        _ => {
            return Err(InferenceError::Output(format!(
                "unsupported output shape {:?}",
                output.shape()
            )))
        }
    };

    if rows.nrows() > 0 && rows.ncols() < 6 {
        return Err(InferenceError::Output(format!(
            "expected 6 values per detection row, got {}",
            rows.ncols()
        )));
    }

    let mut predictions = Vec::with_capacity(rows.nrows());
    for row in rows.axis_iter(Axis(0)) {
        let class_index = row[5].max(0.) as usize;
        let label = class_labels
            .get(class_index)
            .cloned()
            .unwrap_or_else(|| format!("class {}", class_index));

        predictions.push(RawPrediction {
            label,
            score: row[4],
            corners: [row[0], row[1], row[2], row[3]],
        });
    }

    Ok(predictions)
}

fn load_class_labels(filepath: &PathBuf) -> io::Result<Vec<String>> {
    let file = File::open(filepath)?;
    parse_labels(io::BufReader::new(file))
}

fn parse_labels<R: BufRead>(reader: R) -> io::Result<Vec<String>> {
    let mut labels = Vec::new();

    for line_result in reader.lines() {
        let line = line_result?;
        let label = line.trim();
        if label.is_empty() {
            continue;
        }
        labels.push(label.to_string());
    }

    Ok(labels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;
    use std::io::Cursor;

    #[test]
    fn test_parse_labels_skips_blank_lines() {
        let reader = Cursor::new("person\ncar\n\ntruck\n");

        let labels = parse_labels(reader).unwrap();

        assert_eq!(labels, vec!["person", "car", "truck"]);
    }

    #[test]
    fn test_parse_detections_batched_output() {
        let labels = vec!["person".to_string(), "car".to_string()];
        let output = Array3::from_shape_vec(
            (1, 2, 6),
            vec![
                10., 10., 50., 60., 0.9, 1., //
                0., 0., 5., 5., 0.3, 0.,
            ],
        )
        .unwrap()
        .into_dyn();

        let predictions = parse_detections(&output, &labels).unwrap();

        assert_eq!(predictions.len(), 2);
        assert_eq!(predictions[0].label, "car");
        assert_eq!(predictions[0].score, 0.9);
        assert_eq!(predictions[0].corners, [10., 10., 50., 60.]);
        assert_eq!(predictions[1].label, "person");
    }

    #[test]
    fn test_parse_detections_unknown_class_index() {
        let labels = vec!["person".to_string()];
        let output = ndarray::Array2::from_shape_vec((1, 6), vec![0., 0., 4., 4., 0.8, 7.])
            .unwrap()
            .into_dyn();

        let predictions = parse_detections(&output, &labels).unwrap();

        assert_eq!(predictions[0].label, "class 7");
    }

    #[test]
    fn test_parse_detections_rejects_unexpected_shape() {
        let labels = Vec::new();
        let output = ndarray::Array1::from_vec(vec![1., 2., 3.]).into_dyn();

        assert!(matches!(
            parse_detections(&output, &labels),
            Err(InferenceError::Output(_))
        ));
    }
}
