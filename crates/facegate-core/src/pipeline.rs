//! Verify, analyze, search and flatten pipelines over a [`RecognitionEngine`].
//!
//! Every image and template a pipeline obtains is an owned value dropped
//! before the function returns, on success and on every early exit. Decode
//! failures and "no face" outcomes are normal results, not errors; only
//! engine faults and invalid parameters surface as [`PipelineError`].

use crate::engine::{EngineError, RecognitionEngine};
use crate::gallery::{Gallery, GalleryError};
use crate::imaging::{ColorSpace, ImageHandle};
use crate::template::{take_valid, Template};
use crate::types::{Attributes, BoundingBox, CapabilitySet, GalleryIndex, INVALID_SIMILARITY};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Fraction of the shorter image side used as the minimum face size.
pub const ADAPTIVE_FRACTION: f32 = 0.08;
/// Absolute floor for the adaptive minimum face size, in pixels.
pub const ADAPTIVE_FLOOR: u32 = 36;
/// False detection rate used by verify and search.
pub const DEFAULT_FDR: f32 = 0.02;
pub const DEFAULT_MIN_FACE_WIDTH: u32 = 36;
pub const DEFAULT_FACES_TO_DETECT: usize = 1;
pub const DEFAULT_GALLERY_FACES: usize = 10;
pub const DEFAULT_CANDIDATES: usize = 3;

const MAX_FACES_TO_DETECT: usize = 64;
const MAX_MIN_FACE_WIDTH: u32 = 4096;

/// Search accepts every candidate regardless of score.
const SEARCH_MIN_SIMILARITY: f32 = 0.0;

const NO_BOX: BoundingBox = BoundingBox {
    x: 0,
    y: 0,
    width: 0,
    height: 0,
};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParamError {
    #[error("invalid {name} '{value}': expected {expected}")]
    Invalid {
        name: &'static str,
        value: String,
        expected: &'static str,
    },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    #[error("{0}")]
    BadRequest(String),
    #[error("gallery is closed")]
    GalleryClosed,
    #[error("engine did not answer within {0:?}")]
    EngineTimeout(Duration),
    #[error("engine failure: {0}")]
    EngineFatal(String),
}

impl From<ParamError> for PipelineError {
    fn from(err: ParamError) -> Self {
        PipelineError::BadRequest(err.to_string())
    }
}

impl From<EngineError> for PipelineError {
    fn from(err: EngineError) -> Self {
        PipelineError::EngineFatal(err.to_string())
    }
}

impl From<GalleryError> for PipelineError {
    fn from(err: GalleryError) -> Self {
        match err {
            GalleryError::Closed => PipelineError::GalleryClosed,
            other => PipelineError::EngineFatal(other.to_string()),
        }
    }
}

/// Negative biometric outcomes reported inside a successful result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultCode {
    FaceNotDetected,
    ImageDecodeError,
}

/// Outcome of a negative pipeline branch: code plus human-readable message.
#[derive(Debug, Clone, PartialEq)]
pub struct Failure {
    pub code: ResultCode,
    pub message: String,
}

impl Failure {
    fn face_not_detected(message: impl Into<String>) -> Self {
        let message = message.into();
        tracing::info!(%message, "face not detected");
        Self {
            code: ResultCode::FaceNotDetected,
            message,
        }
    }

    fn decode(slot: usize, err: &EngineError) -> Self {
        let message = format!("Failed to decode image {slot}: {err}");
        tracing::info!(%message, "image decode failed");
        Self {
            code: ResultCode::ImageDecodeError,
            message,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationResult {
    /// Similarity in `[0, 1]`, or [`INVALID_SIMILARITY`] when not compared.
    pub similarity: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<ResultCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Image slot (0 or 1) that caused a failure.
    #[serde(skip)]
    pub failed_slot: Option<usize>,
}

impl VerificationResult {
    fn compared(similarity: f32) -> Self {
        Self {
            similarity,
            code: None,
            message: None,
            failed_slot: None,
        }
    }

    fn failed(slot: usize, failure: Failure) -> Self {
        Self {
            similarity: INVALID_SIMILARITY,
            code: Some(failure.code),
            message: Some(failure.message),
            failed_slot: Some(slot),
        }
    }

    pub fn is_compared(&self) -> bool {
        self.code.is_none()
    }

    /// Compared, and at or above `threshold`.
    pub fn is_match(&self, threshold: f32) -> bool {
        self.is_compared() && self.similarity >= threshold
    }
}

/// Validated analyze parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnalysisParams {
    fdr: f32,
    min_face_width: u32,
    faces_to_detect: usize,
}

impl Default for AnalysisParams {
    fn default() -> Self {
        Self {
            fdr: DEFAULT_FDR,
            min_face_width: DEFAULT_MIN_FACE_WIDTH,
            faces_to_detect: DEFAULT_FACES_TO_DETECT,
        }
    }
}

impl AnalysisParams {
    pub fn new(fdr: f32, min_face_width: u32, faces_to_detect: usize) -> Result<Self, ParamError> {
        check_fdr(fdr, &fdr.to_string())?;
        check_range("minFaceWidthInPixels", min_face_width as usize, 1, MAX_MIN_FACE_WIDTH as usize)?;
        check_range("numFacesToDetect", faces_to_detect, 1, MAX_FACES_TO_DETECT)?;
        Ok(Self {
            fdr,
            min_face_width,
            faces_to_detect,
        })
    }

    /// Parse raw query-string values; absent values take their defaults.
    pub fn from_query(
        fdr: Option<&str>,
        min_face_width: Option<&str>,
        faces_to_detect: Option<&str>,
    ) -> Result<Self, ParamError> {
        let defaults = Self::default();
        let fdr = match fdr {
            Some(raw) => parse_fdr(raw)?,
            None => defaults.fdr,
        };
        let min_face_width = match min_face_width {
            Some(raw) => parse_int("minFaceWidthInPixels", raw, 1, MAX_MIN_FACE_WIDTH as usize)? as u32,
            None => defaults.min_face_width,
        };
        let faces_to_detect = match faces_to_detect {
            Some(raw) => parse_int("numFacesToDetect", raw, 1, MAX_FACES_TO_DETECT)?,
            None => defaults.faces_to_detect,
        };
        Self::new(fdr, min_face_width, faces_to_detect)
    }

    pub fn fdr(&self) -> f32 {
        self.fdr
    }

    pub fn min_face_width(&self) -> u32 {
        self.min_face_width
    }

    pub fn faces_to_detect(&self) -> usize {
        self.faces_to_detect
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<ResultCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub fdr: f32,
    pub min_face_width_in_pixels: u32,
    pub num_faces_to_detect: usize,
    /// Valid faces found, up to `num_faces_to_detect`.
    pub faces_detected: usize,
    /// Attribute map of the first detected face.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis: Option<Attributes>,
}

impl AnalysisResult {
    fn new(params: &AnalysisParams) -> Self {
        Self {
            code: None,
            message: None,
            fdr: params.fdr,
            min_face_width_in_pixels: params.min_face_width,
            num_faces_to_detect: params.faces_to_detect,
            faces_detected: 0,
            analysis: None,
        }
    }

    fn failed(params: &AnalysisParams, failure: Failure) -> Self {
        Self {
            code: Some(failure.code),
            message: Some(failure.message),
            ..Self::new(params)
        }
    }
}

/// Validated search parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchParams {
    max_gallery_faces: usize,
    candidates: usize,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            max_gallery_faces: DEFAULT_GALLERY_FACES,
            candidates: DEFAULT_CANDIDATES,
        }
    }
}

impl SearchParams {
    pub fn new(max_gallery_faces: usize, candidates: usize) -> Result<Self, ParamError> {
        check_range("maxGalleryFaces", max_gallery_faces, 1, MAX_FACES_TO_DETECT)?;
        check_range("candidates", candidates, 1, MAX_FACES_TO_DETECT)?;
        Ok(Self {
            max_gallery_faces,
            candidates,
        })
    }

    pub fn from_query(max_gallery_faces: Option<&str>, candidates: Option<&str>) -> Result<Self, ParamError> {
        let defaults = Self::default();
        let max_gallery_faces = match max_gallery_faces {
            Some(raw) => parse_int("maxGalleryFaces", raw, 1, MAX_FACES_TO_DETECT)?,
            None => defaults.max_gallery_faces,
        };
        let candidates = match candidates {
            Some(raw) => parse_int("candidates", raw, 1, MAX_FACES_TO_DETECT)?,
            None => defaults.candidates,
        };
        Self::new(max_gallery_faces, candidates)
    }

    pub fn max_gallery_faces(&self) -> usize {
        self.max_gallery_faces
    }

    pub fn candidates(&self) -> usize {
        self.candidates
    }
}

/// One ranked gallery entry resolved back to its enrolled face box.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateMatch {
    pub index: GalleryIndex,
    pub similarity: f32,
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<ResultCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Faces enrolled from the gallery image.
    pub enrolled: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probe_quality: Option<f64>,
    pub candidates: Vec<CandidateMatch>,
}

impl SearchResult {
    fn failed(failure: Failure) -> Self {
        Self {
            code: Some(failure.code),
            message: Some(failure.message),
            enrolled: 0,
            probe_quality: None,
            candidates: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlattenResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<ResultCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Serialized template size in bytes.
    pub size: usize,
    /// Similarity of the restored template against the live one.
    pub round_trip_similarity: f32,
    #[serde(skip)]
    pub bytes: Vec<u8>,
}

impl FlattenResult {
    fn failed(failure: Failure) -> Self {
        Self {
            code: Some(failure.code),
            message: Some(failure.message),
            size: 0,
            round_trip_similarity: INVALID_SIMILARITY,
            bytes: Vec::new(),
        }
    }
}

/// Compare the single most prominent face in each of two images.
pub fn verify<E>(engine: &mut E, paths: [&Path; 2]) -> Result<VerificationResult, PipelineError>
where
    E: RecognitionEngine + ?Sized,
{
    tracing::debug!(engine = engine.name(), a = %paths[0].display(), b = %paths[1].display(), "verify");

    let mut images: Vec<ImageHandle> = Vec::with_capacity(2);
    for (slot, path) in paths.iter().enumerate() {
        match decode(engine, path, slot)? {
            Ok(image) => images.push(image),
            Err(failure) => return Ok(VerificationResult::failed(slot, failure)),
        }
    }

    let mut templates: Vec<Template> = Vec::with_capacity(2);
    for (slot, image) in images.iter().enumerate() {
        match represent_one(engine, image)? {
            Some(template) => templates.push(template),
            None => {
                return Ok(VerificationResult::failed(
                    slot,
                    Failure::face_not_detected(format!("Failed to detect face in image {slot}")),
                ))
            }
        }
    }

    let similarity = engine.compare(&templates[0], &templates[1]);
    tracing::info!(similarity, "verify: compared");
    Ok(VerificationResult::compared(similarity))
}

/// Run every extraction stage over the faces in one image and report the
/// first face's attributes.
pub fn analyze<E>(engine: &mut E, path: &Path, params: &AnalysisParams) -> Result<AnalysisResult, PipelineError>
where
    E: RecognitionEngine + ?Sized,
{
    tracing::debug!(
        engine = engine.name(),
        path = %path.display(),
        fdr = params.fdr,
        min_face_width = params.min_face_width,
        faces = params.faces_to_detect,
        "analyze"
    );

    let image = match decode(engine, path, 0)? {
        Ok(image) => image,
        Err(failure) => return Ok(AnalysisResult::failed(params, failure)),
    };

    let slots = engine.represent(
        &image,
        &CapabilitySet::analysis(),
        params.min_face_width,
        params.faces_to_detect,
        params.fdr,
    )?;
    let templates = take_valid(slots);
    let Some(first) = templates.first() else {
        return Ok(AnalysisResult::failed(
            params,
            Failure::face_not_detected("Failed to detect face in image"),
        ));
    };

    let mut result = AnalysisResult::new(params);
    result.faces_detected = templates.len();
    result.analysis = Some(first.attributes().clone());
    tracing::info!(faces = templates.len(), stages = first.stages().len(), "analyze: done");
    Ok(result)
}

/// Enroll every face of a gallery image, then rank them against the single
/// face of a probe image.
pub fn search<E>(
    engine: &mut E,
    gallery_path: &Path,
    probe_path: &Path,
    params: &SearchParams,
) -> Result<SearchResult, PipelineError>
where
    E: RecognitionEngine + ?Sized,
{
    tracing::debug!(
        engine = engine.name(),
        gallery = %gallery_path.display(),
        probe = %probe_path.display(),
        max_gallery_faces = params.max_gallery_faces,
        candidates = params.candidates,
        "search"
    );

    let gallery_image = match decode(engine, gallery_path, 0)? {
        Ok(image) => image,
        Err(failure) => return Ok(SearchResult::failed(failure)),
    };
    let probe_image = match decode(engine, probe_path, 1)? {
        Ok(image) => image,
        Err(failure) => return Ok(SearchResult::failed(failure)),
    };

    let min_size = engine.adaptive_minimum_size(&gallery_image, ADAPTIVE_FRACTION, ADAPTIVE_FLOOR);
    let slots = engine.represent(
        &gallery_image,
        &CapabilitySet::verification(),
        min_size,
        params.max_gallery_faces,
        DEFAULT_FDR,
    )?;
    let gallery_templates = take_valid(slots);
    if gallery_templates.is_empty() {
        return Ok(SearchResult::failed(Failure::face_not_detected(
            "Failed to find a face in the gallery image",
        )));
    }

    let gallery = Gallery::open();
    for template in &gallery_templates {
        gallery.enroll(template)?;
    }

    let Some(probe) = represent_one(engine, &probe_image)? else {
        gallery.close()?;
        return Ok(SearchResult::failed(Failure::face_not_detected(
            "Failed to find a face in the probe image",
        )));
    };

    let engine_ref: &E = engine;
    let ranked = gallery.search(&probe, params.candidates, SEARCH_MIN_SIMILARITY, |a, b| {
        engine_ref.compare(a, b)
    })?;

    let mut candidates = Vec::with_capacity(params.candidates);
    for candidate in ranked {
        let Some(candidate) = candidate else {
            break;
        };
        let enrolled = gallery.at(candidate.index)?;
        let bbox = enrolled.bounding_box().unwrap_or(NO_BOX);
        candidates.push(CandidateMatch {
            index: candidate.index,
            similarity: candidate.similarity,
            x: bbox.x,
            y: bbox.y,
            width: bbox.width,
            height: bbox.height,
        });
    }

    let enrolled = gallery.close()?;
    tracing::info!(enrolled, candidates = candidates.len(), "search: ranked");

    Ok(SearchResult {
        code: None,
        message: None,
        enrolled,
        probe_quality: probe.attribute("Quality").and_then(|v| v.as_f64()),
        candidates,
    })
}

/// Represent one face, serialize it, and check that the restored template
/// matches the live one.
pub fn flatten<E>(engine: &mut E, path: &Path) -> Result<FlattenResult, PipelineError>
where
    E: RecognitionEngine + ?Sized,
{
    let image = match decode(engine, path, 0)? {
        Ok(image) => image,
        Err(failure) => return Ok(FlattenResult::failed(failure)),
    };
    let Some(template) = represent_one(engine, &image)? else {
        return Ok(FlattenResult::failed(Failure::face_not_detected(
            "Failed to detect face in image",
        )));
    };

    let bytes = engine.serialize_template(&template)?;
    let restored = engine.deserialize_template(&bytes)?;
    let round_trip_similarity = engine.compare(&template, &restored);
    tracing::info!(size = bytes.len(), round_trip_similarity, "flatten: done");

    Ok(FlattenResult {
        code: None,
        message: None,
        size: bytes.len(),
        round_trip_similarity,
        bytes,
    })
}

/// Decode one GRAY8 image. Decode failures become a [`Failure`] for `slot`;
/// any other engine error is fatal.
fn decode<E>(engine: &mut E, path: &Path, slot: usize) -> Result<Result<ImageHandle, Failure>, PipelineError>
where
    E: RecognitionEngine + ?Sized,
{
    match engine.read_image(path, ColorSpace::Gray8) {
        Ok(image) => Ok(Ok(image)),
        Err(err) if err.is_decode() => Ok(Err(Failure::decode(slot, &err))),
        Err(err) => Err(err.into()),
    }
}

/// Detect and represent the single most prominent face, if any.
fn represent_one<E>(engine: &mut E, image: &ImageHandle) -> Result<Option<Template>, PipelineError>
where
    E: RecognitionEngine + ?Sized,
{
    let min_size = engine.adaptive_minimum_size(image, ADAPTIVE_FRACTION, ADAPTIVE_FLOOR);
    let slots = engine.represent(image, &CapabilitySet::verification(), min_size, 1, DEFAULT_FDR)?;
    Ok(take_valid(slots).into_iter().next())
}

fn parse_fdr(raw: &str) -> Result<f32, ParamError> {
    let value: f32 = raw.trim().parse().map_err(|_| ParamError::Invalid {
        name: "fdr",
        value: raw.to_string(),
        expected: "a number in (0, 1]",
    })?;
    check_fdr(value, raw)?;
    Ok(value)
}

fn check_fdr(value: f32, raw: &str) -> Result<(), ParamError> {
    if value.is_finite() && value > 0.0 && value <= 1.0 {
        Ok(())
    } else {
        Err(ParamError::Invalid {
            name: "fdr",
            value: raw.to_string(),
            expected: "a number in (0, 1]",
        })
    }
}

fn parse_int(name: &'static str, raw: &str, min: usize, max: usize) -> Result<usize, ParamError> {
    let value: usize = raw.trim().parse().map_err(|_| ParamError::Invalid {
        name,
        value: raw.to_string(),
        expected: "a positive integer",
    })?;
    check_range(name, value, min, max)?;
    Ok(value)
}

fn check_range(name: &'static str, value: usize, min: usize, max: usize) -> Result<(), ParamError> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(ParamError::Invalid {
            name,
            value: value.to_string(),
            expected: range_description(name),
        })
    }
}

fn range_description(name: &str) -> &'static str {
    match name {
        "minFaceWidthInPixels" => "an integer in 1..=4096",
        _ => "an integer in 1..=64",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockEngine;
    use image::{GrayImage, Luma};
    use std::path::PathBuf;
    use tempfile::TempDir;

    /// Square pattern images the mock engine reads as one face each.
    fn pattern(kind: u8, side: u32) -> GrayImage {
        GrayImage::from_fn(side, side, |x, y| {
            let v = match kind {
                0 => x * 255 / (side - 1),
                1 => y * 255 / (side - 1),
                2 => ((x / 8 + y / 8) % 2) * 255,
                _ => ((x + y) * 255 / (2 * (side - 1))).min(255),
            };
            Luma([v as u8])
        })
    }

    fn save(dir: &TempDir, name: &str, img: &GrayImage) -> PathBuf {
        let path = dir.path().join(name);
        img.save(&path).unwrap();
        path
    }

    fn strip(kinds: &[u8], side: u32) -> GrayImage {
        let mut out = GrayImage::new(side * kinds.len() as u32, side);
        for (i, &k) in kinds.iter().enumerate() {
            let tile = pattern(k, side);
            for (x, y, px) in tile.enumerate_pixels() {
                out.put_pixel(i as u32 * side + x, y, *px);
            }
        }
        out
    }

    #[test]
    fn test_verify_same_face_matches() {
        let dir = TempDir::new().unwrap();
        let a = save(&dir, "a.png", &pattern(0, 96));
        let b = save(&dir, "b.png", &pattern(0, 96));
        let mut engine = MockEngine::new();

        let result = verify(&mut engine, [a.as_path(), b.as_path()]).unwrap();
        assert!(result.is_compared());
        assert!(result.similarity >= 0.8, "similarity {}", result.similarity);
        assert!(result.is_match(0.8));
        assert!(engine.ledger().is_quiescent());
    }

    #[test]
    fn test_verify_different_faces_do_not_match() {
        let dir = TempDir::new().unwrap();
        let a = save(&dir, "a.png", &pattern(0, 96));
        let b = save(&dir, "b.png", &pattern(1, 96));
        let mut engine = MockEngine::new();

        let result = verify(&mut engine, [a.as_path(), b.as_path()]).unwrap();
        assert!(result.is_compared());
        assert!((0.0..=1.0).contains(&result.similarity));
        assert!(!result.is_match(0.8));
    }

    #[test]
    fn test_verify_reports_failing_slot_without_comparing() {
        let dir = TempDir::new().unwrap();
        let face = save(&dir, "face.png", &pattern(2, 96));
        let blank = save(&dir, "blank.png", &GrayImage::from_pixel(96, 96, Luma([128])));

        for (paths, slot) in [([&face, &blank], 1usize), ([&blank, &face], 0usize)] {
            let mut engine = MockEngine::new();
            let result = verify(&mut engine, [paths[0].as_path(), paths[1].as_path()]).unwrap();
            assert_eq!(result.code, Some(ResultCode::FaceNotDetected));
            assert_eq!(result.failed_slot, Some(slot));
            assert_eq!(result.similarity, INVALID_SIMILARITY);
            assert_eq!(
                result.message.as_deref(),
                Some(format!("Failed to detect face in image {slot}").as_str())
            );
            assert_eq!(engine.compare_calls(), 0);
            assert!(engine.ledger().is_quiescent());
        }
    }

    #[test]
    fn test_verify_decode_failure_is_a_result() {
        let dir = TempDir::new().unwrap();
        let face = save(&dir, "face.png", &pattern(0, 64));
        let junk = dir.path().join("junk.png");
        std::fs::write(&junk, b"definitely not a png").unwrap();
        let mut engine = MockEngine::new();

        let result = verify(&mut engine, [face.as_path(), junk.as_path()]).unwrap();
        assert_eq!(result.code, Some(ResultCode::ImageDecodeError));
        assert_eq!(result.failed_slot, Some(1));
        assert!(result.message.unwrap().starts_with("Failed to decode image 1"));
        assert_eq!(engine.represent_calls(), 0);
        assert!(engine.ledger().is_quiescent());
    }

    #[test]
    fn test_verify_result_json_shape() {
        let ok = serde_json::to_value(VerificationResult::compared(0.5)).unwrap();
        assert_eq!(ok, serde_json::json!({ "similarity": 0.5 }));

        let failed = VerificationResult::failed(1, Failure::face_not_detected("Failed to detect face in image 1"));
        let json = serde_json::to_value(failed).unwrap();
        assert_eq!(json["similarity"], -1.0);
        assert_eq!(json["code"], "FaceNotDetected");
        assert_eq!(json["message"], "Failed to detect face in image 1");
        assert!(json.get("failed_slot").is_none());
    }

    #[test]
    fn test_analysis_defaults_equal_explicit_values() {
        let from_empty = AnalysisParams::from_query(None, None, None).unwrap();
        let explicit = AnalysisParams::from_query(Some("0.02"), Some("36"), Some("1")).unwrap();
        assert_eq!(from_empty, explicit);
        assert_eq!(from_empty, AnalysisParams::default());
        assert_eq!(from_empty, AnalysisParams::new(0.02, 36, 1).unwrap());
    }

    #[test]
    fn test_analysis_params_reject_bad_values() {
        let cases = [
            (Some("abc"), None, None, "fdr"),
            (Some("0"), None, None, "fdr"),
            (Some("1.5"), None, None, "fdr"),
            (Some("NaN"), None, None, "fdr"),
            (None, Some("-3"), None, "minFaceWidthInPixels"),
            (None, Some("0"), None, "minFaceWidthInPixels"),
            (None, Some("4.5"), None, "minFaceWidthInPixels"),
            (None, None, Some("0"), "numFacesToDetect"),
            (None, None, Some("65"), "numFacesToDetect"),
        ];
        for (fdr, width, faces, name) in cases {
            let err = AnalysisParams::from_query(fdr, width, faces).unwrap_err();
            let ParamError::Invalid { name: got, .. } = &err;
            assert_eq!(*got, name, "{fdr:?} {width:?} {faces:?}");
            assert!(PipelineError::from(err).to_string().contains(name));
        }
    }

    #[test]
    fn test_analyze_reports_attributes_and_parameters() {
        let dir = TempDir::new().unwrap();
        let path = save(&dir, "a.png", &pattern(0, 96));
        let mut engine = MockEngine::new();
        let params = AnalysisParams::new(0.05, 40, 2).unwrap();

        let result = analyze(&mut engine, &path, &params).unwrap();
        assert_eq!(result.code, None);
        assert_eq!(result.faces_detected, 1);
        assert_eq!(result.min_face_width_in_pixels, 40);
        let analysis = result.analysis.as_ref().unwrap();
        assert!(analysis.contains_key("Age"));
        assert!(analysis.contains_key("RightEyeX"));

        let json = serde_json::to_value(&result).unwrap();
        assert!((json["fdr"].as_f64().unwrap() - 0.05).abs() < 1e-6);
        assert_eq!(json["minFaceWidthInPixels"], 40);
        assert_eq!(json["numFacesToDetect"], 2);
        assert!(engine.ledger().is_quiescent());
    }

    #[test]
    fn test_analyze_blank_image() {
        let dir = TempDir::new().unwrap();
        let path = save(&dir, "blank.png", &GrayImage::from_pixel(64, 64, Luma([0])));
        let mut engine = MockEngine::new();

        let result = analyze(&mut engine, &path, &AnalysisParams::default()).unwrap();
        assert_eq!(result.code, Some(ResultCode::FaceNotDetected));
        assert!(result.analysis.is_none());
        assert!(engine.ledger().is_quiescent());
    }

    #[test]
    fn test_search_probe_identical_to_enrolled_face_ranks_first() {
        let dir = TempDir::new().unwrap();
        let kinds = [0u8, 1, 2, 3];
        let gallery = save(&dir, "gallery.png", &strip(&kinds, 64));

        for (i, &k) in kinds.iter().enumerate() {
            let probe = save(&dir, &format!("probe{i}.png"), &pattern(k, 64));
            let mut engine = MockEngine::new();
            let result = search(&mut engine, &gallery, &probe, &SearchParams::default()).unwrap();

            assert_eq!(result.enrolled, 4);
            assert!(result.candidates.len() <= 3);
            let top = &result.candidates[0];
            assert_eq!(top.index, GalleryIndex(i as u64));
            assert!(top.similarity > 0.99);
            assert_eq!(top.x, 64 * i as i32);
            assert_eq!(top.width, 64);
            assert!(result.probe_quality.is_some());
            assert!(engine.ledger().is_quiescent());
        }
    }

    #[test]
    fn test_search_stops_at_padding() {
        let dir = TempDir::new().unwrap();
        let gallery = save(&dir, "gallery.png", &strip(&[0, 1], 64));
        let probe = save(&dir, "probe.png", &pattern(1, 64));
        let mut engine = MockEngine::new();

        let params = SearchParams::new(10, 5).unwrap();
        let result = search(&mut engine, &gallery, &probe, &params).unwrap();
        assert_eq!(result.candidates.len(), 2);
        assert_eq!(result.candidates[0].index, GalleryIndex(1));
        assert!(result.candidates[0].similarity >= result.candidates[1].similarity);
    }

    #[test]
    fn test_search_failures() {
        let dir = TempDir::new().unwrap();
        let blank = save(&dir, "blank.png", &GrayImage::from_pixel(64, 64, Luma([10])));
        let face = save(&dir, "face.png", &pattern(0, 64));

        let mut engine = MockEngine::new();
        let result = search(&mut engine, &blank, &face, &SearchParams::default()).unwrap();
        assert_eq!(result.message.as_deref(), Some("Failed to find a face in the gallery image"));

        let result = search(&mut engine, &face, &blank, &SearchParams::default()).unwrap();
        assert_eq!(result.message.as_deref(), Some("Failed to find a face in the probe image"));
        assert_eq!(result.code, Some(ResultCode::FaceNotDetected));
        assert!(engine.ledger().is_quiescent());
    }

    #[test]
    fn test_flatten_round_trip_is_max_similarity() {
        let dir = TempDir::new().unwrap();
        let path = save(&dir, "a.png", &pattern(2, 80));
        let mut engine = MockEngine::new();

        let result = flatten(&mut engine, &path).unwrap();
        assert_eq!(result.code, None);
        assert_eq!(result.size, result.bytes.len());
        assert!((result.round_trip_similarity - 1.0).abs() < 1e-5);

        let restored = engine.deserialize_template(&result.bytes).unwrap();
        assert!(restored.stages().contains(crate::types::Capability::Representation));
        drop(restored);
        assert!(engine.ledger().is_quiescent());
    }

    #[test]
    fn test_search_params_validation() {
        assert_eq!(SearchParams::from_query(None, None).unwrap(), SearchParams::default());
        assert!(SearchParams::from_query(Some("0"), None).is_err());
        assert!(SearchParams::from_query(None, Some("x")).is_err());
        assert_eq!(SearchParams::from_query(Some("4"), Some("2")).unwrap(), SearchParams::new(4, 2).unwrap());
    }

    #[test]
    fn test_error_conversions() {
        assert_eq!(PipelineError::from(GalleryError::Closed), PipelineError::GalleryClosed);
        assert!(matches!(
            PipelineError::from(EngineError::Fatal("x".into())),
            PipelineError::EngineFatal(_)
        ));
    }
}
