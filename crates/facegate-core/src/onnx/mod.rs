//! SCRFD + ArcFace engine on ONNX Runtime.

pub mod alignment;
pub mod detector;
pub mod recognizer;

pub use detector::{score_threshold, Detection};

use crate::engine::{EngineError, RecognitionEngine};
use crate::imaging::ImageHandle;
use crate::ledger::ResourceLedger;
use crate::template::{insert_geometry, pad_slots, TemplateRecord, TemplateSlot};
use crate::types::{Attributes, BoundingBox, Capability, CapabilitySet};
use detector::Detector;
use recognizer::Recognizer;
use std::path::Path;
use std::sync::Arc;

pub const DETECTOR_FILE: &str = "det_10g.onnx";
pub const RECOGNIZER_FILE: &str = "w600k_r50.onnx";

/// Landmark names in detector order.
const LANDMARK_NAMES: [&str; 5] = ["RightEye", "LeftEye", "Nose", "MouthRight", "MouthLeft"];

pub struct OnnxEngine {
    detector: Detector,
    recognizer: Recognizer,
    ledger: Arc<ResourceLedger>,
    supported: CapabilitySet,
}

impl OnnxEngine {
    /// Load both models from `model_dir`.
    pub fn load(model_dir: &Path) -> Result<Self, EngineError> {
        let detector = Detector::load(&model_dir.join(DETECTOR_FILE))?;
        let recognizer = Recognizer::load(&model_dir.join(RECOGNIZER_FILE))?;
        tracing::info!(model_dir = %model_dir.display(), "onnx engine ready");
        Ok(Self {
            detector,
            recognizer,
            ledger: ResourceLedger::new(),
            supported: [
                Capability::Frontal,
                Capability::Representation,
                Capability::Landmarks,
                Capability::Pose,
            ]
            .into_iter()
            .collect(),
        })
    }

    fn record(
        &mut self,
        gray: &[u8],
        image: &ImageHandle,
        det: &Detection,
        stages: &CapabilitySet,
    ) -> Result<TemplateRecord, EngineError> {
        let bbox = BoundingBox::from_f32(det.x1, det.y1, det.width(), det.height());
        let mut attributes = Attributes::new();
        insert_geometry(&mut attributes, &bbox);
        attributes.insert("Quality".into(), det.score.into());

        if stages.contains(Capability::Landmarks) {
            for (name, &(x, y)) in LANDMARK_NAMES.iter().zip(&det.landmarks) {
                attributes.insert(format!("{name}X"), x.into());
                attributes.insert(format!("{name}Y"), y.into());
            }
        }
        if stages.contains(Capability::Pose) {
            let (roll, yaw) = roll_and_yaw(&det.landmarks);
            attributes.insert("Roll".into(), roll.into());
            attributes.insert("Yaw".into(), yaw.into());
        }

        let features = if stages.contains(Capability::Representation) {
            self.recognizer
                .embed(gray, image.width(), image.height(), &det.landmarks)?
        } else {
            Vec::new()
        };

        Ok(TemplateRecord {
            stages: stages.clone(),
            bounding_box: Some(bbox),
            confidence: det.score,
            attributes,
            features,
        })
    }
}

impl RecognitionEngine for OnnxEngine {
    fn name(&self) -> &'static str {
        "onnx"
    }

    fn ledger(&self) -> &Arc<ResourceLedger> {
        &self.ledger
    }

    fn represent(
        &mut self,
        image: &ImageHandle,
        capabilities: &CapabilitySet,
        min_size: u32,
        max_faces: usize,
        false_detection_rate: f32,
    ) -> Result<Vec<TemplateSlot>, EngineError> {
        let gray = image.luma();
        let threshold = score_threshold(false_detection_rate);
        let detections = self
            .detector
            .detect(&gray, image.width(), image.height(), threshold)?;

        let stages = capabilities.intersection(&self.supported);
        let mut templates = Vec::new();
        for det in detections
            .iter()
            .filter(|d| d.width() >= min_size as f32)
            .take(max_faces)
        {
            let record = self.record(&gray, image, det, &stages)?;
            templates.push(self.issue_template(record));
        }

        tracing::debug!(faces = templates.len(), threshold, min_size, max_faces, "onnx: represent");
        Ok(pad_slots(templates, max_faces))
    }
}

/// In-plane roll from the eye line and a yaw estimate from the nose offset
/// against the eye midpoint, both in degrees.
fn roll_and_yaw(landmarks: &[(f32, f32); 5]) -> (f64, f64) {
    let (r, l, nose) = (landmarks[0], landmarks[1], landmarks[2]);
    let (dx, dy) = (l.0 - r.0, l.1 - r.1);
    let roll = dy.atan2(dx).to_degrees() as f64;

    let eye_span = (dx * dx + dy * dy).sqrt();
    if eye_span <= f32::EPSILON {
        return (roll, 0.0);
    }
    let mid_x = (r.0 + l.0) / 2.0;
    let offset = ((nose.0 - mid_x) / (eye_span / 2.0)).clamp(-1.0, 1.0);
    (roll, (offset.asin().to_degrees()) as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_face_has_no_roll_or_yaw() {
        let lm = [(40.0, 50.0), (80.0, 50.0), (60.0, 70.0), (45.0, 90.0), (75.0, 90.0)];
        let (roll, yaw) = roll_and_yaw(&lm);
        assert!(roll.abs() < 1e-6);
        assert!(yaw.abs() < 1e-6);
    }

    #[test]
    fn test_tilted_and_turned_face() {
        let lm = [(40.0, 50.0), (80.0, 90.0), (70.0, 80.0), (0.0, 0.0), (0.0, 0.0)];
        let (roll, yaw) = roll_and_yaw(&lm);
        assert!((roll - 45.0).abs() < 1e-4);
        assert!(yaw > 0.0);
    }

    #[test]
    fn test_missing_models_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = OnnxEngine::load(dir.path()).err().unwrap();
        match err {
            EngineError::ModelNotFound(path) => assert!(path.ends_with(DETECTOR_FILE)),
            other => panic!("unexpected error: {other}"),
        }
    }
}
