//! Face templates: the engine's representation of one detected face.

use crate::ledger::LedgerToken;
use crate::types::{AttributeValue, Attributes, BoundingBox, CapabilitySet, MAX_SIMILARITY, MIN_SIMILARITY};
use serde::{Deserialize, Serialize};

/// Serializable content of a template, without its ownership token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateRecord {
    /// Stages that ran to produce this template.
    pub stages: CapabilitySet,
    pub bounding_box: Option<BoundingBox>,
    /// Detector confidence in [0, 1].
    pub confidence: f32,
    #[serde(default)]
    pub attributes: Attributes,
    /// Comparison features. Empty when representation did not run.
    #[serde(default)]
    pub features: Vec<f32>,
}

/// A valid face template owned by the operation that obtained it.
///
/// Released on drop. `clone` is a shallow payload copy that registers a
/// second live template with the same ledger.
#[derive(Debug)]
pub struct Template {
    record: TemplateRecord,
    token: LedgerToken,
}

impl Template {
    pub fn new(record: TemplateRecord, token: LedgerToken) -> Self {
        Self { record, token }
    }

    pub fn stages(&self) -> &CapabilitySet {
        &self.record.stages
    }

    pub fn bounding_box(&self) -> Option<BoundingBox> {
        self.record.bounding_box
    }

    pub fn confidence(&self) -> f32 {
        self.record.confidence
    }

    pub fn attributes(&self) -> &Attributes {
        &self.record.attributes
    }

    pub fn attribute(&self, key: &str) -> Option<&AttributeValue> {
        self.record.attributes.get(key)
    }

    pub fn features(&self) -> &[f32] {
        &self.record.features
    }

    pub fn record(&self) -> &TemplateRecord {
        &self.record
    }

    /// Flatten to a self-describing byte buffer.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.record)
    }
}

impl Clone for Template {
    fn clone(&self) -> Self {
        Self {
            record: self.record.clone(),
            token: self.token.reissue(),
        }
    }
}

/// One entry of a detection result. Engines pad results with `Invalid`
/// when fewer faces exist than were requested.
#[derive(Debug)]
pub enum TemplateSlot {
    Valid(Template),
    Invalid,
}

impl TemplateSlot {
    pub fn is_valid(&self) -> bool {
        matches!(self, TemplateSlot::Valid(_))
    }

    pub fn into_template(self) -> Option<Template> {
        match self {
            TemplateSlot::Valid(t) => Some(t),
            TemplateSlot::Invalid => None,
        }
    }
}

/// Consume slots up to, not including, the first invalid one. Everything
/// after it is dropped unread.
pub fn take_valid(slots: Vec<TemplateSlot>) -> Vec<Template> {
    slots
        .into_iter()
        .map_while(TemplateSlot::into_template)
        .collect()
}

/// Pad `templates` with invalid slots up to `requested` entries.
pub fn pad_slots(templates: Vec<Template>, requested: usize) -> Vec<TemplateSlot> {
    let mut slots: Vec<TemplateSlot> = templates.into_iter().map(TemplateSlot::Valid).collect();
    while slots.len() < requested.max(1) {
        slots.push(TemplateSlot::Invalid);
    }
    slots
}

/// Cosine similarity of two feature vectors, clamped to the similarity range.
///
/// Empty or zero vectors compare at the bottom of the range.
pub fn feature_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return MIN_SIMILARITY;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = (norm_a * norm_b).sqrt();
    if denom > 0.0 {
        (dot / denom).clamp(MIN_SIMILARITY, MAX_SIMILARITY)
    } else {
        MIN_SIMILARITY
    }
}

/// Record a face box as `X`/`Y`/`Width`/`Height` attributes.
pub fn insert_geometry(attributes: &mut Attributes, bbox: &BoundingBox) {
    attributes.insert("X".into(), (bbox.x as f64).into());
    attributes.insert("Y".into(), (bbox.y as f64).into());
    attributes.insert("Width".into(), (bbox.width as f64).into());
    attributes.insert("Height".into(), (bbox.height as f64).into());
}
