use crate::{
    annotator, detection,
    frame_codec::{self, CodecError},
    model_service::{InferenceError, Model, ModelAdapter},
    state::ServiceState,
};
use std::sync::Arc;
use thiserror::Error;
use tonic::{async_trait, Request, Response, Status};
use video_proto::{
    object_detector_server::ObjectDetector, ConfigRequest, ConfigResponse, DetectionResult, Frame,
    VideoFrame,
};

#[derive(Error, Debug)]
enum PipelineError {
    #[error("missing frame payload")]
    MissingFrame,
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Inference(#[from] InferenceError),
}

pub struct InferenceService<M: Model> {
    model_adapter: Arc<ModelAdapter<M>>,
    state: Arc<ServiceState>,
}

impl<M: Model> InferenceService<M> {
    pub fn new(model_adapter: Arc<ModelAdapter<M>>, state: Arc<ServiceState>) -> Self {
        Self {
            model_adapter,
            state,
        }
    }

    /// Decode, infer, filter, annotate, re-encode. The threshold is the
    /// snapshot taken by the caller; a concurrent Configure does not affect a
    /// call already past that point.
    fn run_detection(
        &self,
        video_frame: VideoFrame,
        threshold: f32,
    ) -> Result<DetectionResult, PipelineError> {
        let VideoFrame {
            frame,
            width,
            height,
            pixel_format,
        } = video_frame;
        let frame = frame.ok_or(PipelineError::MissingFrame)?;

        let mut pixels = frame_codec::decode(&frame.data, width, height, pixel_format)?;
        let raw_predictions = self.model_adapter.infer(&pixels)?;
        let detections = detection::filter_predictions(raw_predictions, threshold);
        annotator::draw_detections(&mut pixels, &detections);

        Ok(DetectionResult {
            detections,
            frame: Some(VideoFrame {
                frame: Some(Frame {
                    data: frame_codec::encode(&pixels),
                    timestamp: frame.timestamp,
                    format: pixel_format,
                    metadata: frame.metadata,
                }),
                width,
                height,
                pixel_format,
            }),
        })
    }
}

// Manual impl: the derived one would demand `M: Clone`, but only the Arcs are
// cloned here.
impl<M: Model> Clone for InferenceService<M> {
    fn clone(&self) -> Self {
        Self {
            model_adapter: self.model_adapter.clone(),
            state: self.state.clone(),
        }
    }
}

#[async_trait]
impl<M: Model> ObjectDetector for InferenceService<M> {
    async fn configure(
        &self,
        request: Request<ConfigRequest>,
    ) -> Result<Response<ConfigResponse>, Status> {
        let parameters = request.into_inner().parameters;

        // An absent key leaves the threshold unchanged and still succeeds.
        let Some(raw) = parameters.get("confidence_threshold") else {
            return Ok(Response::new(ConfigResponse {
                success: true,
                message: "Object detector configured successfully".to_string(),
            }));
        };

        let response = match raw.parse::<f32>() {
            Ok(value) if value.is_finite() => {
                let applied = self.state.set_confidence_threshold(value);
                tracing::info!("confidence threshold set to {}", applied);
                ConfigResponse {
                    success: true,
                    message: "Object detector configured successfully".to_string(),
                }
            }
            Ok(_) => ConfigResponse {
                success: false,
                message: "Configuration failed: confidence_threshold must be a finite number"
                    .to_string(),
            },
            Err(e) => ConfigResponse {
                success: false,
                message: format!("Configuration failed: {}", e),
            },
        };

        Ok(Response::new(response))
    }

    async fn detect(
        &self,
        request: Request<VideoFrame>,
    ) -> Result<Response<DetectionResult>, Status> {
        if !self.model_adapter.is_ready() {
            return Err(Status::failed_precondition("model not initialized"));
        }

        let video_frame = request.into_inner();
        let threshold = self.state.confidence_threshold();

        let result = self
            .run_detection(video_frame, threshold)
            .map_err(|e| {
                tracing::error!("Error in detection: {}", e);
                Status::internal(e.to_string())
            })?;

        tracing::debug!("Returning {} detections", result.detections.len());

        Ok(Response::new(result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model_service::{ModelLoadError, RawPrediction};
    use ndarray::{Array, Ix4};
    use std::collections::HashMap;
    use video_proto::PixelFormat;

    struct MockModel {
        predictions: Vec<RawPrediction>,
    }

    impl Model for MockModel {
        fn warmup(&self) -> Result<(), ModelLoadError> {
            Ok(())
        }

        fn predict(&self, _input: &Array<f32, Ix4>) -> Result<Vec<RawPrediction>, InferenceError> {
            Ok(self.predictions.clone())
        }
    }

    fn car_predictions() -> Vec<RawPrediction> {
        vec![
            RawPrediction {
                label: "car".to_string(),
                score: 0.9,
                corners: [1., 1., 5., 5.],
            },
            RawPrediction {
                label: "car".to_string(),
                score: 0.3,
                corners: [0., 0., 5., 5.],
            },
        ]
    }

    fn ready_service(
        predictions: Vec<RawPrediction>,
    ) -> (InferenceService<MockModel>, Arc<ServiceState>) {
        let adapter = Arc::new(ModelAdapter::new(MockModel { predictions }));
        adapter.warmup().unwrap();
        let state = Arc::new(ServiceState::default());

        (InferenceService::new(adapter, state.clone()), state)
    }

    fn rgb_frame(width: i32, height: i32, data: Vec<u8>) -> VideoFrame {
        VideoFrame {
            frame: Some(Frame {
                data,
                timestamp: 12345,
                format: PixelFormat::Rgb24 as i32,
                metadata: HashMap::from([("camera".to_string(), "cam-1".to_string())]),
            }),
            width,
            height,
            pixel_format: PixelFormat::Rgb24 as i32,
        }
    }

    #[tokio::test]
    async fn test_detect_before_warmup_returns_failed_precondition() {
        let adapter = Arc::new(ModelAdapter::new(MockModel {
            predictions: car_predictions(),
        }));
        let service = InferenceService::new(adapter, Arc::new(ServiceState::default()));

        let request = Request::new(rgb_frame(8, 8, vec![0; 8 * 8 * 3]));
        let status = service.detect(request).await.unwrap_err();

        assert_eq!(status.code(), tonic::Code::FailedPrecondition);
        assert_eq!(status.message(), "model not initialized");
    }

    #[tokio::test]
    async fn test_detect_filters_annotates_and_echoes_frame() {
        let (service, _) = ready_service(car_predictions());

        let request = Request::new(rgb_frame(8, 8, vec![0; 8 * 8 * 3]));
        let result = service.detect(request).await.unwrap().into_inner();

        assert_eq!(result.detections.len(), 1);
        let detection = &result.detections[0];
        assert_eq!(detection.object_class, "car");
        assert_eq!(detection.confidence, 0.9);
        let bbox = detection.bbox.as_ref().unwrap();
        assert_eq!((bbox.x, bbox.y, bbox.width, bbox.height), (1., 1., 4., 4.));

        let video_frame = result.frame.unwrap();
        assert_eq!(video_frame.width, 8);
        assert_eq!(video_frame.height, 8);
        assert_eq!(video_frame.pixel_format, PixelFormat::Rgb24 as i32);

        let frame = video_frame.frame.unwrap();
        assert_eq!(frame.timestamp, 12345);
        assert_eq!(frame.metadata.get("camera").unwrap(), "cam-1");
        assert_eq!(frame.data.len(), 8 * 8 * 3);

        // top-left box corner painted green, interior untouched
        let corner = (8 + 1) * 3;
        assert_eq!(frame.data[corner + 1], 255);
        let interior = (3 * 8 + 3) * 3;
        assert_eq!(&frame.data[interior..interior + 3], &[0, 0, 0]);
    }

    #[tokio::test]
    async fn test_detect_with_malformed_buffer_returns_internal_and_stays_ready() {
        let (service, _) = ready_service(car_predictions());

        let request = Request::new(rgb_frame(8, 8, vec![0; 17]));
        let status = service.detect(request).await.unwrap_err();
        assert_eq!(status.code(), tonic::Code::Internal);
        assert!(status.message().contains("malformed frame"));

        // the failed call must not knock the service out of the ready state
        let request = Request::new(rgb_frame(8, 8, vec![0; 8 * 8 * 3]));
        let result = service.detect(request).await.unwrap().into_inner();
        assert_eq!(result.detections.len(), 1);
    }

    #[tokio::test]
    async fn test_detect_without_frame_payload_returns_internal() {
        let (service, _) = ready_service(Vec::new());

        let request = Request::new(VideoFrame {
            frame: None,
            width: 8,
            height: 8,
            pixel_format: PixelFormat::Rgb24 as i32,
        });
        let status = service.detect(request).await.unwrap_err();

        assert_eq!(status.code(), tonic::Code::Internal);
        assert_eq!(status.message(), "missing frame payload");
    }

    #[tokio::test]
    async fn test_configure_clamps_out_of_range_threshold() {
        let (service, state) = ready_service(Vec::new());

        let request = Request::new(ConfigRequest {
            parameters: HashMap::from([("confidence_threshold".to_string(), "1.5".to_string())]),
        });
        let response = service.configure(request).await.unwrap().into_inner();

        assert!(response.success);
        assert_eq!(state.confidence_threshold(), 1.0);
    }

    #[tokio::test]
    async fn test_configure_rejects_unparseable_threshold() {
        let (service, state) = ready_service(Vec::new());

        let request = Request::new(ConfigRequest {
            parameters: HashMap::from([("confidence_threshold".to_string(), "fast".to_string())]),
        });
        let response = service.configure(request).await.unwrap().into_inner();

        assert!(!response.success);
        assert!(response.message.starts_with("Configuration failed"));
        assert_eq!(state.confidence_threshold(), 0.5);
    }

    #[tokio::test]
    async fn test_configure_rejects_non_finite_threshold() {
        let (service, state) = ready_service(Vec::new());

        for raw in ["NaN", "inf", "-inf"] {
            let request = Request::new(ConfigRequest {
                parameters: HashMap::from([(
                    "confidence_threshold".to_string(),
                    raw.to_string(),
                )]),
            });
            let response = service.configure(request).await.unwrap().into_inner();

            assert!(!response.success, "{} should be rejected", raw);
        }
        assert_eq!(state.confidence_threshold(), 0.5);
    }

    #[tokio::test]
    async fn test_configure_without_recognized_key_is_a_no_op_success() {
        let (service, state) = ready_service(Vec::new());

        let request = Request::new(ConfigRequest {
            parameters: HashMap::from([("brightness".to_string(), "11".to_string())]),
        });
        let response = service.configure(request).await.unwrap().into_inner();

        assert!(response.success);
        assert_eq!(state.confidence_threshold(), 0.5);
    }

    #[tokio::test]
    async fn test_configured_threshold_applies_to_subsequent_detect() {
        let (service, _) = ready_service(car_predictions());

        let request = Request::new(rgb_frame(8, 8, vec![0; 8 * 8 * 3]));
        let result = service.detect(request).await.unwrap().into_inner();
        assert_eq!(result.detections.len(), 1);

        let request = Request::new(ConfigRequest {
            parameters: HashMap::from([("confidence_threshold".to_string(), "0.2".to_string())]),
        });
        assert!(service.configure(request).await.unwrap().into_inner().success);

        let request = Request::new(rgb_frame(8, 8, vec![0; 8 * 8 * 3]));
        let result = service.detect(request).await.unwrap().into_inner();
        assert_eq!(result.detections.len(), 2);
    }
}
