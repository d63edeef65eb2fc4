//! Person detection.
//!
//! The engine consumes the detector as a black box behind [`PersonDetector`].
//! The bundled implementation wraps a YOLO-family ONNX model through ONNX
//! Runtime. `Session::run` needs `&mut self` and the execution provider may
//! be a single GPU, so the session lives behind a mutex; camera tasks
//! serialize on it for the duration of one inference.

use image::RgbImage;
use ndarray::Array4;
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Value;
use parking_lot::Mutex;
use std::path::Path;
use tracing::debug;

use warden_types::{BBox, Detection, Frame};

use crate::{Error, Result};

/// Detects persons in a frame. Implementations must be callable from many
/// camera tasks concurrently.
pub trait PersonDetector: Send + Sync {
    fn detect(&self, frame: &Frame) -> Result<Vec<Detection>>;
}

/// YOLO-family ONNX person detector.
///
/// The frame is resized to the fixed network input (a throughput choice, not
/// a semantic one) and boxes are rescaled back to frame coordinates.
pub struct OnnxPersonDetector {
    session: Mutex<Session>,
    output_name: String,
    input_size: u32,
    min_confidence: f32,
    nms_iou: f32,
}

impl OnnxPersonDetector {
    pub fn new<P: AsRef<Path>>(model_path: P, min_confidence: f32) -> Result<Self> {
        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .commit_from_file(model_path.as_ref())?;
        let output_name = session
            .outputs
            .first()
            .map(|o| o.name.clone())
            .ok_or_else(|| Error::Inference("detector model has no outputs".into()))?;
        Ok(Self {
            session: Mutex::new(session),
            output_name,
            input_size: 640,
            min_confidence,
            nms_iou: 0.7,
        })
    }

    fn preprocess(&self, frame: &Frame) -> Result<Array4<f32>> {
        let s = self.input_size;
        let img = RgbImage::from_raw(frame.width, frame.height, frame.data.clone())
            .ok_or_else(|| Error::Decode("frame buffer mismatch".into()))?;
        let resized = image::imageops::resize(&img, s, s, image::imageops::FilterType::Triangle);

        let mut input = Array4::<f32>::zeros((1, 3, s as usize, s as usize));
        for (x, y, pixel) in resized.enumerate_pixels() {
            input[[0, 0, y as usize, x as usize]] = pixel[0] as f32 / 255.0;
            input[[0, 1, y as usize, x as usize]] = pixel[1] as f32 / 255.0;
            input[[0, 2, y as usize, x as usize]] = pixel[2] as f32 / 255.0;
        }
        Ok(input)
    }
}

impl PersonDetector for OnnxPersonDetector {
    fn detect(&self, frame: &Frame) -> Result<Vec<Detection>> {
        let input = self.preprocess(frame)?;
        let input_value = Value::from_array(input)?;

        let (shape, data) = {
            let mut session = self.session.lock();
            let outputs = session.run(ort::inputs![input_value])?;
            let (shape, data) = outputs[self.output_name.as_str()].try_extract_tensor::<f32>()?;
            (shape.to_vec(), data.to_vec())
        };

        // YOLOv8-style output: [1, 4 + num_classes, num_anchors], rows are
        // cx, cy, w, h followed by per-class scores; person is class 0.
        if shape.len() != 3 || shape[1] < 5 {
            return Err(Error::Inference(format!(
                "unexpected detector output shape {shape:?}"
            )));
        }
        let anchors = shape[2] as usize;
        let sx = frame.width as f32 / self.input_size as f32;
        let sy = frame.height as f32 / self.input_size as f32;

        let mut detections = Vec::new();
        for i in 0..anchors {
            let confidence = data[4 * anchors + i];
            if confidence < self.min_confidence {
                continue;
            }
            let cx = data[i];
            let cy = data[anchors + i];
            let w = data[2 * anchors + i];
            let h = data[3 * anchors + i];
            let bbox = BBox::new(
                ((cx - w / 2.0) * sx).clamp(0.0, frame.width as f32),
                ((cy - h / 2.0) * sy).clamp(0.0, frame.height as f32),
                ((cx + w / 2.0) * sx).clamp(0.0, frame.width as f32),
                ((cy + h / 2.0) * sy).clamp(0.0, frame.height as f32),
            );
            if !bbox.is_valid() {
                continue;
            }
            detections.push(Detection { bbox, confidence });
        }

        let kept = non_max_suppression(detections, self.nms_iou);
        debug!(
            camera = %frame.camera,
            frame_index = frame.frame_index,
            persons = kept.len(),
            "detector pass"
        );
        Ok(kept)
    }
}

/// Greedy non-maximum suppression, highest confidence first.
pub fn non_max_suppression(mut detections: Vec<Detection>, iou_floor: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let mut kept: Vec<Detection> = Vec::with_capacity(detections.len());
    for det in detections {
        if kept.iter().all(|k| k.bbox.iou(&det.bbox) <= iou_floor) {
            kept.push(det);
        }
    }
    kept
}
