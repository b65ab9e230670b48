//! Capability interface over a biometric recognition engine.
//!
//! Engines are blocking and not assumed thread-safe: every method takes the
//! engine by reference from a single owner. Callers that share an engine
//! must serialize access themselves.

use crate::imaging::{ColorSpace, ImageHandle};
use crate::ledger::{ResourceKind, ResourceLedger};
use crate::template::{feature_similarity, Template, TemplateRecord, TemplateSlot};
use crate::types::CapabilitySet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("failed to decode image {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("image has no pixels: {0}")]
    EmptyImage(PathBuf),
    #[error("model file not found: {0} (download it from insightface into the model directory)")]
    ModelNotFound(PathBuf),
    #[error("inference failed: {0}")]
    Inference(String),
    #[cfg(feature = "onnx")]
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
    #[error("template serialization: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("engine fault: {0}")]
    Fatal(String),
}

impl EngineError {
    /// Input could not be decoded as an image. Recoverable per request.
    pub fn is_decode(&self) -> bool {
        matches!(self, EngineError::Decode { .. } | EngineError::EmptyImage(_))
    }
}

/// The operations the orchestration layer needs from a recognition engine.
pub trait RecognitionEngine: Send {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Ledger every image and template issued by this engine is counted in.
    fn ledger(&self) -> &Arc<ResourceLedger>;

    /// Decode an image file.
    fn read_image(&mut self, path: &Path, color_space: ColorSpace) -> Result<ImageHandle, EngineError> {
        ImageHandle::decode(path, color_space, self.ledger().issue(ResourceKind::Image))
    }

    /// Minimum detectable face size for `image`: `fraction` of the shorter
    /// side, never below `floor`, never above the shorter side.
    fn adaptive_minimum_size(&self, image: &ImageHandle, fraction: f32, floor: u32) -> u32 {
        let short_side = image.width().min(image.height());
        let relative = (fraction.max(0.0) * short_side as f32).round() as u32;
        relative.max(floor).min(short_side)
    }

    /// Detect up to `max_faces` faces of at least `min_size` pixels and run
    /// the requested stages on each.
    ///
    /// Returns at least one slot. Valid templates come first, ordered by the
    /// engine's detection order; the remainder is padded with
    /// [`TemplateSlot::Invalid`].
    fn represent(
        &mut self,
        image: &ImageHandle,
        capabilities: &CapabilitySet,
        min_size: u32,
        max_faces: usize,
        false_detection_rate: f32,
    ) -> Result<Vec<TemplateSlot>, EngineError>;

    /// Similarity of two valid templates in `[0, 1]`.
    fn compare(&self, a: &Template, b: &Template) -> f32 {
        feature_similarity(a.features(), b.features())
    }

    fn serialize_template(&self, template: &Template) -> Result<Vec<u8>, EngineError> {
        Ok(template.to_bytes()?)
    }

    fn deserialize_template(&self, bytes: &[u8]) -> Result<Template, EngineError> {
        let record: TemplateRecord = serde_json::from_slice(bytes)?;
        Ok(self.issue_template(record))
    }

    /// Wrap a record as a live template owned by the caller.
    fn issue_template(&self, record: TemplateRecord) -> Template {
        Template::new(record, self.ledger().issue(ResourceKind::Template))
    }

    /// Tear down engine state. Called once, after every resource is released.
    fn finalize(&mut self) -> Result<(), EngineError> {
        Ok(())
    }
}
