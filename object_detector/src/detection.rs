use crate::model_service::RawPrediction;
use video_proto::{BoundingBox, Detection};

/// Applies the confidence threshold to raw model candidates and converts the
/// survivors' corner-form boxes to `x/y/width/height`. A score exactly equal
/// to the threshold is kept. Entries whose converted box has a negative
/// extent are dropped with a warning; one bad candidate never fails the call.
/// Output order is the model's output order.
pub fn filter_predictions(raw: Vec<RawPrediction>, threshold: f32) -> Vec<Detection> {
    let mut detections = Vec::new();

    for prediction in raw {
        if prediction.score < threshold {
            continue;
        }

        let [x1, y1, x2, y2] = prediction.corners;
        let width = x2 - x1;
        let height = y2 - y1;
        if width < 0. || height < 0. {
            tracing::warn!(
                label = %prediction.label,
                score = prediction.score,
                "dropping detection with inverted box [{}, {}, {}, {}]",
                x1,
                y1,
                x2,
                y2
            );
            continue;
        }

        detections.push(Detection {
            object_class: prediction.label,
            confidence: prediction.score,
            bbox: Some(BoundingBox {
                x: x1,
                y: y1,
                width,
                height,
            }),
        });
    }

    detections
}
