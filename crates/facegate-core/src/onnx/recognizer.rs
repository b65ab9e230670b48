//! ArcFace embedding extractor (`w600k_r50.onnx`).

use super::alignment::{self, ALIGNED_SIDE};
use crate::engine::EngineError;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

// ArcFace normalizes symmetrically, unlike the detector.
const PIXEL_MEAN: f32 = 127.5;
const PIXEL_SCALE: f32 = 127.5;
pub const EMBEDDING_DIM: usize = 512;

pub struct Recognizer {
    session: Session,
}

impl Recognizer {
    pub fn load(path: &Path) -> Result<Self, EngineError> {
        if !path.exists() {
            return Err(EngineError::ModelNotFound(path.to_path_buf()));
        }
        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(path)?;
        tracing::info!(path = %path.display(), "recognizer loaded");
        Ok(Self { session })
    }

    /// Align the face at `landmarks` and return its unit-length embedding.
    pub fn embed(
        &mut self,
        gray: &[u8],
        width: u32,
        height: u32,
        landmarks: &[(f32, f32); 5],
    ) -> Result<Vec<f32>, EngineError> {
        let crop = alignment::align(gray, width as usize, height as usize, landmarks);
        let input = to_tensor(&crop);

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EngineError::Inference(format!("embedding: {e}")))?;

        if raw.len() != EMBEDDING_DIM {
            return Err(EngineError::Inference(format!(
                "embedding has {} values, expected {EMBEDDING_DIM}",
                raw.len()
            )));
        }
        Ok(unit(raw))
    }
}

fn to_tensor(crop: &[u8]) -> Array4<f32> {
    Array4::from_shape_fn((1, 3, ALIGNED_SIDE, ALIGNED_SIDE), |(_, _, y, x)| {
        let px = crop.get(y * ALIGNED_SIDE + x).copied().unwrap_or(0) as f32;
        (px - PIXEL_MEAN) / PIXEL_SCALE
    })
}

fn unit(raw: &[f32]) -> Vec<f32> {
    let norm = raw.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        raw.iter().map(|v| v / norm).collect()
    } else {
        raw.to_vec()
    }
}
