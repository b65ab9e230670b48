//! facegate-core: recognition engine gateway, gallery ranking, and the
//! verify / analyze / search / flatten pipelines built on them.
//!
//! Two engines ship with the crate: the SCRFD + ArcFace [`onnx::OnnxEngine`]
//! (feature `onnx`) and the model-free [`mock::MockEngine`].

pub mod engine;
pub mod gallery;
pub mod imaging;
pub mod ledger;
pub mod mock;
#[cfg(feature = "onnx")]
pub mod onnx;
pub mod pipeline;
pub mod template;
pub mod types;

pub use engine::{EngineError, RecognitionEngine};
pub use gallery::{Gallery, GalleryError};
pub use imaging::{ColorSpace, ImageHandle};
pub use ledger::ResourceLedger;
pub use mock::MockEngine;
pub use pipeline::{
    AnalysisParams, AnalysisResult, FlattenResult, ParamError, PipelineError, ResultCode, SearchParams,
    SearchResult, VerificationResult,
};
pub use template::{Template, TemplateSlot};
pub use types::{
    AttributeValue, Attributes, BoundingBox, Candidate, Capability, CapabilitySet, GalleryIndex, INVALID_SIMILARITY,
};
