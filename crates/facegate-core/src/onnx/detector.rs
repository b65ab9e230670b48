//! SCRFD face detector (`det_10g.onnx`).
//!
//! The frame is letterboxed into a 640×640 canvas anchored at the top-left,
//! run once, and decoded per stride: each grid cell carries two anchors with
//! a score, a distance-encoded box and five distance-encoded landmarks.

use crate::engine::EngineError;
use image::imageops::{self, FilterType};
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

const CANVAS: usize = 640;
const PIXEL_MEAN: f32 = 127.5;
const PIXEL_SCALE: f32 = 128.0;
const STRIDES: [usize; 3] = [8, 16, 32];
const ANCHORS_PER_CELL: usize = 2;
const OVERLAP_LIMIT: f32 = 0.4;

/// Confidence floor for a false detection rate. The default rate 0.02 maps
/// to the detector's stock 0.5 threshold.
pub fn score_threshold(false_detection_rate: f32) -> f32 {
    (1.0 - false_detection_rate * 25.0).clamp(0.05, 0.95)
}

/// One detected face in source-image coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub score: f32,
    pub landmarks: [(f32, f32); 5],
}

impl Detection {
    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    fn area(&self) -> f32 {
        self.width().max(0.0) * self.height().max(0.0)
    }

    pub fn overlap(&self, other: &Detection) -> f32 {
        let w = (self.x2.min(other.x2) - self.x1.max(other.x1)).max(0.0);
        let h = (self.y2.min(other.y2) - self.y1.max(other.y1)).max(0.0);
        let inter = w * h;
        let union = self.area() + other.area() - inter;
        if union > 0.0 {
            inter / union
        } else {
            0.0
        }
    }
}

/// Which session output holds scores, boxes and landmarks for each stride.
type OutputLayout = [[usize; 3]; 3];

pub struct Detector {
    session: Session,
    layout: OutputLayout,
}

impl Detector {
    pub fn load(path: &Path) -> Result<Self, EngineError> {
        if !path.exists() {
            return Err(EngineError::ModelNotFound(path.to_path_buf()));
        }
        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(path)?;

        let names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        if names.len() < 9 {
            return Err(EngineError::Inference(format!(
                "detector needs 9 outputs, model has {}",
                names.len()
            )));
        }
        let layout = output_layout(&names);
        tracing::info!(path = %path.display(), outputs = ?names, ?layout, "detector loaded");

        Ok(Self { session, layout })
    }

    /// Faces scoring above `threshold`, best first, overlaps suppressed.
    pub fn detect(
        &mut self,
        gray: &[u8],
        width: u32,
        height: u32,
        threshold: f32,
    ) -> Result<Vec<Detection>, EngineError> {
        let (input, scale) = letterbox(gray, width, height)?;
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut found = Vec::new();
        for (level, &stride) in STRIDES.iter().enumerate() {
            let [si, bi, ki] = self.layout[level];
            let extract = |idx: usize, what: &str| {
                outputs[idx]
                    .try_extract_tensor::<f32>()
                    .map(|(_, data)| data)
                    .map_err(|e| EngineError::Inference(format!("{what} at stride {stride}: {e}")))
            };
            let scores = extract(si, "scores")?;
            let boxes = extract(bi, "boxes")?;
            let points = extract(ki, "landmarks")?;
            found.extend(decode_level(scores, boxes, points, stride, scale, threshold));
        }

        let kept = suppress(found, OVERLAP_LIMIT);
        tracing::debug!(faces = kept.len(), threshold, "detector: done");
        Ok(kept)
    }
}

/// Map output names such as `score_8` or `kps_32` onto stride slots.
/// Unrecognized names fall back to the stock export order: three score
/// tensors, then three box tensors, then three landmark tensors.
fn output_layout(names: &[String]) -> OutputLayout {
    let mut slots = [[None::<usize>; 3]; 3];
    for (idx, name) in names.iter().enumerate() {
        let Some((kind, stride)) = name.split_once('_') else {
            continue;
        };
        let column = match kind {
            "score" => 0,
            "bbox" => 1,
            "kps" => 2,
            _ => continue,
        };
        let Some(level) = stride
            .parse::<usize>()
            .ok()
            .and_then(|s| STRIDES.iter().position(|&x| x == s))
        else {
            continue;
        };
        slots[level][column] = Some(idx);
    }

    let mut layout = [[0usize; 3]; 3];
    for level in 0..3 {
        for column in 0..3 {
            match slots[level][column] {
                Some(idx) => layout[level][column] = idx,
                None => return [[0, 3, 6], [1, 4, 7], [2, 5, 8]],
            }
        }
    }
    layout
}

/// Resize into the top-left of the canvas and normalize; returns the tensor
/// and the resize factor.
fn letterbox(gray: &[u8], width: u32, height: u32) -> Result<(Array4<f32>, f32), EngineError> {
    let frame = GrayImage::from_raw(width, height, gray.to_vec())
        .ok_or_else(|| EngineError::Inference("frame buffer does not match its size".into()))?;

    let scale = (CANVAS as f32 / width as f32).min(CANVAS as f32 / height as f32);
    let new_w = ((width as f32 * scale).round() as u32).clamp(1, CANVAS as u32);
    let new_h = ((height as f32 * scale).round() as u32).clamp(1, CANVAS as u32);
    let resized = imageops::resize(&frame, new_w, new_h, FilterType::Triangle);

    let tensor = Array4::from_shape_fn((1, 3, CANVAS, CANVAS), |(_, _, y, x)| {
        let px = if (x as u32) < new_w && (y as u32) < new_h {
            resized.get_pixel(x as u32, y as u32)[0] as f32
        } else {
            PIXEL_MEAN
        };
        (px - PIXEL_MEAN) / PIXEL_SCALE
    });
    Ok((tensor, scale))
}

fn decode_level(
    scores: &[f32],
    boxes: &[f32],
    points: &[f32],
    stride: usize,
    scale: f32,
    threshold: f32,
) -> Vec<Detection> {
    let grid = CANVAS / stride;
    let step = stride as f32;
    let to_source = |v: f32| v / scale;

    scores
        .iter()
        .take(grid * grid * ANCHORS_PER_CELL)
        .enumerate()
        .filter(|(_, &s)| s > threshold)
        .filter_map(|(i, &score)| {
            let b = boxes.get(i * 4..i * 4 + 4)?;
            let k = points.get(i * 10..i * 10 + 10)?;
            let cell = i / ANCHORS_PER_CELL;
            let (ax, ay) = ((cell % grid) as f32 * step, (cell / grid) as f32 * step);

            let mut landmarks = [(0.0, 0.0); 5];
            for (j, lm) in landmarks.iter_mut().enumerate() {
                *lm = (
                    to_source(ax + k[j * 2] * step),
                    to_source(ay + k[j * 2 + 1] * step),
                );
            }
            Some(Detection {
                x1: to_source(ax - b[0] * step),
                y1: to_source(ay - b[1] * step),
                x2: to_source(ax + b[2] * step),
                y2: to_source(ay + b[3] * step),
                score,
                landmarks,
            })
        })
        .collect()
}

/// Greedy non-maximum suppression, highest score first.
fn suppress(mut found: Vec<Detection>, overlap_limit: f32) -> Vec<Detection> {
    found.sort_by(|a, b| b.score.total_cmp(&a.score));
    let mut kept: Vec<Detection> = Vec::with_capacity(found.len());
    for det in found {
        if kept.iter().all(|k| k.overlap(&det) <= overlap_limit) {
            kept.push(det);
        }
    }
    kept
}
