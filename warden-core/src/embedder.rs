//! Appearance embedding extraction.
//!
//! Same black-box arrangement as the detector: the engine sees
//! [`AppearanceEmbedder`], the bundled implementation wraps a re-id ONNX
//! model (OSNet-style, 128x256 crops) whose output is L2-normalized into an
//! [`Embedding`].

use image::RgbImage;
use ndarray::Array4;
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Value;
use parking_lot::Mutex;
use std::path::Path;

use warden_types::{BBox, Embedding, Frame};

use crate::{Error, Result};

/// ImageNet normalization, the convention re-id models are trained with.
const MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Extracts a fixed-dimensional appearance vector from a person crop.
///
/// Deterministic up to floating-point noise. Implementations signal
/// extraction failure (invalid region, degenerate crop) through the error;
/// the caller keeps the track without a fresh embedding for that tick.
pub trait AppearanceEmbedder: Send + Sync {
    fn embed(&self, frame: &Frame, bbox: &BBox) -> Result<Embedding>;
}

pub struct OnnxAppearanceEmbedder {
    session: Mutex<Session>,
    output_name: String,
    input_w: u32,
    input_h: u32,
}

impl OnnxAppearanceEmbedder {
    pub fn new<P: AsRef<Path>>(model_path: P) -> Result<Self> {
        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .commit_from_file(model_path.as_ref())?;
        let output_name = session
            .outputs
            .first()
            .map(|o| o.name.clone())
            .ok_or_else(|| Error::Inference("embedder model has no outputs".into()))?;
        Ok(Self {
            session: Mutex::new(session),
            output_name,
            input_w: 128,
            input_h: 256,
        })
    }
}

impl AppearanceEmbedder for OnnxAppearanceEmbedder {
    fn embed(&self, frame: &Frame, bbox: &BBox) -> Result<Embedding> {
        let crop = frame.crop(bbox).ok_or(Error::CropTooSmall {
            width: bbox.width() as u32,
            height: bbox.height() as u32,
        })?;

        let img = RgbImage::from_raw(crop.width, crop.height, crop.data)
            .ok_or_else(|| Error::Decode("crop buffer mismatch".into()))?;
        let resized = image::imageops::resize(
            &img,
            self.input_w,
            self.input_h,
            image::imageops::FilterType::Triangle,
        );

        let (w, h) = (self.input_w as usize, self.input_h as usize);
        let mut input = Array4::<f32>::zeros((1, 3, h, w));
        for (x, y, pixel) in resized.enumerate_pixels() {
            for c in 0..3 {
                input[[0, c, y as usize, x as usize]] =
                    (pixel[c] as f32 / 255.0 - MEAN[c]) / STD[c];
            }
        }
        let input_value = Value::from_array(input)?;

        let raw: Vec<f32> = {
            let mut session = self.session.lock();
            let outputs = session.run(ort::inputs![input_value])?;
            let (_shape, data) = outputs[self.output_name.as_str()].try_extract_tensor::<f32>()?;
            data.to_vec()
        };

        Embedding::unit_norm(raw).map_err(|e| Error::Inference(e.to_string()))
    }
}
