//! Deterministic, model-free engine.
//!
//! Lets the service and its tests run without native models. An image is
//! read as a grid of square tiles whose side is the image's shorter
//! dimension, scanned row by row; every tile with enough contrast counts as
//! one face. Features are a mean-pooled, mean-centred 8×8 patch, so an
//! identical tile always compares at 1.0 and structurally different tiles
//! compare low.

use crate::engine::{EngineError, RecognitionEngine};
use crate::imaging::{crop_square, mean_and_std, ImageHandle};
use crate::ledger::ResourceLedger;
use crate::template::{feature_similarity, insert_geometry, pad_slots, Template, TemplateRecord, TemplateSlot};
use crate::types::{Attributes, BoundingBox, Capability, CapabilitySet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Tiles at or below this pixel standard deviation are blank.
const FLATNESS_FLOOR: f32 = 8.0;
/// Side of the pooled feature patch.
const PATCH_SIDE: usize = 8;
/// Pooled patches with less energy than this carry no structure.
const MIN_PATCH_ENERGY: f32 = 1e-3;

pub struct MockEngine {
    ledger: Arc<ResourceLedger>,
    represent_calls: AtomicUsize,
    compare_calls: AtomicUsize,
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MockEngine {
    pub fn new() -> Self {
        Self::with_ledger(ResourceLedger::new())
    }

    pub fn with_ledger(ledger: Arc<ResourceLedger>) -> Self {
        Self {
            ledger,
            represent_calls: AtomicUsize::new(0),
            compare_calls: AtomicUsize::new(0),
        }
    }

    pub fn represent_calls(&self) -> usize {
        self.represent_calls.load(Ordering::SeqCst)
    }

    pub fn compare_calls(&self) -> usize {
        self.compare_calls.load(Ordering::SeqCst)
    }

    fn tile_record(
        tile: &[u8],
        side: usize,
        bbox: BoundingBox,
        capabilities: &CapabilitySet,
    ) -> Option<TemplateRecord> {
        let (mean, std) = mean_and_std(tile);
        if std <= FLATNESS_FLOOR {
            return None;
        }
        let features = pooled_features(tile, side)?;

        let mut attributes = Attributes::new();
        insert_geometry(&mut attributes, &bbox);
        attributes.insert("Quality".into(), ((std / 128.0).min(1.0) as f64).into());
        attributes.insert("Engine".into(), "mock".into());

        if capabilities.contains(Capability::Demographics) {
            attributes.insert("Age".into(), (18.0 + (mean as f64 / 255.0 * 60.0).round()).into());
        }
        if capabilities.contains(Capability::Pose) {
            let (cx, cy) = intensity_centroid(tile, side);
            attributes.insert("Yaw".into(), ((cx - 0.5) * 90.0).into());
            attributes.insert("Pitch".into(), ((cy - 0.5) * 90.0).into());
            attributes.insert("Roll".into(), 0.0f64.into());
        }
        if capabilities.contains(Capability::Spoof) {
            attributes.insert("SpoofScore".into(), 0.0f64.into());
        }
        if capabilities.contains(Capability::Glasses) {
            attributes.insert("Glasses".into(), false.into());
        }
        if capabilities.contains(Capability::Landmarks) {
            let at = |fx: f64, fy: f64| {
                (
                    bbox.x as f64 + fx * bbox.width as f64,
                    bbox.y as f64 + fy * bbox.height as f64,
                )
            };
            for (name, (x, y)) in [
                ("RightEye", at(0.3, 0.4)),
                ("LeftEye", at(0.7, 0.4)),
                ("Nose", at(0.5, 0.6)),
                ("MouthRight", at(0.35, 0.8)),
                ("MouthLeft", at(0.65, 0.8)),
            ] {
                attributes.insert(format!("{name}X"), x.into());
                attributes.insert(format!("{name}Y"), y.into());
            }
        }
        if capabilities.contains(Capability::Lips) {
            attributes.insert("LipsApart".into(), false.into());
        }

        let features = if capabilities.contains(Capability::Representation) {
            features
        } else {
            Vec::new()
        };

        Some(TemplateRecord {
            stages: capabilities.clone(),
            bounding_box: Some(bbox),
            confidence: (std / 128.0).min(1.0),
            attributes,
            features,
        })
    }
}

impl RecognitionEngine for MockEngine {
    fn name(&self) -> &'static str {
        "mock"
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
        self.represent_calls.fetch_add(1, Ordering::SeqCst);

        let (width, height) = (image.width() as usize, image.height() as usize);
        let side = width.min(height);
        let gray = image.luma();

        let mut templates: Vec<Template> = Vec::new();
        if side > 0 && side >= min_size as usize {
            'scan: for row in 0..height / side {
                for col in 0..width / side {
                    if templates.len() >= max_faces {
                        break 'scan;
                    }
                    let (x0, y0) = (col * side, row * side);
                    let tile = crop_square(&gray, width, x0, y0, side);
                    let bbox = BoundingBox {
                        x: x0 as i32,
                        y: y0 as i32,
                        width: side as u32,
                        height: side as u32,
                    };
                    if let Some(record) = Self::tile_record(&tile, side, bbox, capabilities) {
                        templates.push(self.issue_template(record));
                    }
                }
            }
        }

        tracing::debug!(
            faces = templates.len(),
            max_faces,
            min_size,
            false_detection_rate,
            "mock: represent"
        );

        Ok(pad_slots(templates, max_faces))
    }

    fn compare(&self, a: &Template, b: &Template) -> f32 {
        self.compare_calls.fetch_add(1, Ordering::SeqCst);
        feature_similarity(a.features(), b.features())
    }
}

/// Mean-pool a square tile to `PATCH_SIDE`², centre it and L2-normalise it.
fn pooled_features(tile: &[u8], side: usize) -> Option<Vec<f32>> {
    let cell = side as f32 / PATCH_SIDE as f32;
    let mut pooled = vec![0.0f32; PATCH_SIDE * PATCH_SIDE];
    let mut counts = vec![0u32; PATCH_SIDE * PATCH_SIDE];

    for y in 0..side {
        let py = ((y as f32 / cell) as usize).min(PATCH_SIDE - 1);
        for x in 0..side {
            let px = ((x as f32 / cell) as usize).min(PATCH_SIDE - 1);
            pooled[py * PATCH_SIDE + px] += tile[y * side + x] as f32;
            counts[py * PATCH_SIDE + px] += 1;
        }
    }
    for (v, &n) in pooled.iter_mut().zip(&counts) {
        if n > 0 {
            *v /= n as f32;
        }
    }

    let mean = pooled.iter().sum::<f32>() / pooled.len() as f32;
    for v in pooled.iter_mut() {
        *v -= mean;
    }
    let norm = pooled.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm < MIN_PATCH_ENERGY {
        return None;
    }
    for v in pooled.iter_mut() {
        *v /= norm;
    }
    Some(pooled)
}

/// Brightness-weighted centre of a tile, as fractions of its side.
fn intensity_centroid(tile: &[u8], side: usize) -> (f64, f64) {
    let (mut sx, mut sy, mut total) = (0.0f64, 0.0f64, 0.0f64);
    for y in 0..side {
        for x in 0..side {
            let w = tile[y * side + x] as f64;
            sx += w * x as f64;
            sy += w * y as f64;
            total += w;
        }
    }
    if total == 0.0 || side < 2 {
        return (0.5, 0.5);
    }
    let span = (side - 1) as f64;
    (sx / total / span, sy / total / span)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imaging::ColorSpace;
    use crate::ledger::ResourceKind;
    use crate::template::take_valid;

    fn handle(engine: &MockEngine, data: Vec<u8>, width: u32, height: u32) -> ImageHandle {
        ImageHandle::from_parts(data, width, height, ColorSpace::Gray8, engine.ledger().issue(ResourceKind::Image))
    }

    fn gradient(side: usize, horizontal: bool) -> Vec<u8> {
        (0..side * side)
            .map(|i| {
                let (x, y) = (i % side, i / side);
                let t = if horizontal { x } else { y };
                (t * 255 / (side - 1)) as u8
            })
            .collect()
    }

    #[test]
    fn test_blank_image_has_no_face() {
        let mut engine = MockEngine::new();
        let image = handle(&engine, vec![200; 64 * 64], 64, 64);
        let slots = engine
            .represent(&image, &CapabilitySet::verification(), 36, 1, 0.02)
            .unwrap();
        assert_eq!(slots.len(), 1);
        assert!(!slots[0].is_valid());
    }

    #[test]
    fn test_identical_tiles_compare_at_max() {
        let mut engine = MockEngine::new();
        let a = handle(&engine, gradient(64, true), 64, 64);
        let b = handle(&engine, gradient(64, true), 64, 64);
        let ta = take_valid(engine.represent(&a, &CapabilitySet::verification(), 36, 1, 0.02).unwrap());
        let tb = take_valid(engine.represent(&b, &CapabilitySet::verification(), 36, 1, 0.02).unwrap());
        assert!((engine.compare(&ta[0], &tb[0]) - 1.0).abs() < 1e-5);
        assert_eq!(engine.compare_calls(), 1);
    }

    #[test]
    fn test_orthogonal_patterns_compare_low() {
        let mut engine = MockEngine::new();
        let a = handle(&engine, gradient(64, true), 64, 64);
        let b = handle(&engine, gradient(64, false), 64, 64);
        let ta = take_valid(engine.represent(&a, &CapabilitySet::verification(), 36, 1, 0.02).unwrap());
        let tb = take_valid(engine.represent(&b, &CapabilitySet::verification(), 36, 1, 0.02).unwrap());
        assert!(engine.compare(&ta[0], &tb[0]) < 0.1);
    }

    #[test]
    fn test_strip_yields_one_face_per_tile_padded() {
        let mut engine = MockEngine::new();
        let side = 40usize;
        let mut strip = vec![0u8; side * 3 * side];
        let tiles = [gradient(side, true), vec![90; side * side], gradient(side, false)];
        for y in 0..side {
            for (t, tile) in tiles.iter().enumerate() {
                let dst = y * side * 3 + t * side;
                strip[dst..dst + side].copy_from_slice(&tile[y * side..(y + 1) * side]);
            }
        }
        let image = handle(&engine, strip, (side * 3) as u32, side as u32);
        let slots = engine
            .represent(&image, &CapabilitySet::verification(), 36, 5, 0.02)
            .unwrap();
        assert_eq!(slots.len(), 5);
        let valid = take_valid(slots);
        // The flat middle tile is skipped.
        assert_eq!(valid.len(), 2);
        assert_eq!(valid[0].bounding_box().unwrap().x, 0);
        assert_eq!(valid[1].bounding_box().unwrap().x, 80);
    }

    #[test]
    fn test_faces_smaller_than_minimum_are_ignored() {
        let mut engine = MockEngine::new();
        let image = handle(&engine, gradient(30, true), 30, 30);
        let slots = engine
            .represent(&image, &CapabilitySet::verification(), 36, 1, 0.02)
            .unwrap();
        assert!(!slots[0].is_valid());
    }

    #[test]
    fn test_attributes_follow_capabilities() {
        let mut engine = MockEngine::new();
        let image = handle(&engine, gradient(64, true), 64, 64);

        let basic = take_valid(engine.represent(&image, &CapabilitySet::verification(), 36, 1, 0.02).unwrap());
        assert!(basic[0].attribute("Quality").is_some());
        assert!(basic[0].attribute("Age").is_none());
        assert!(basic[0].attribute("Yaw").is_none());

        let full = take_valid(engine.represent(&image, &CapabilitySet::analysis(), 36, 1, 0.02).unwrap());
        let t = &full[0];
        for key in ["Age", "Yaw", "Pitch", "Roll", "SpoofScore", "Glasses", "RightEyeX", "LipsApart"] {
            assert!(t.attribute(key).is_some(), "{key} missing");
        }
        assert_eq!(t.stages(), &CapabilitySet::analysis());
        // Brightness grows to the right, so the centroid sits right of centre.
        assert!(t.attribute("Yaw").and_then(|v| v.as_f64()).unwrap() > 0.0);
    }

    #[test]
    fn test_represent_releases_nothing_it_returns() {
        let mut engine = MockEngine::new();
        let image = handle(&engine, gradient(64, true), 64, 64);
        let slots = engine.represent(&image, &CapabilitySet::verification(), 36, 3, 0.02).unwrap();
        assert_eq!(engine.ledger().live_templates(), 1);
        drop(slots);
        drop(image);
        assert!(engine.ledger().is_quiescent());
    }
}
