use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Similarity reported on the wire when a comparison was not attempted.
pub const INVALID_SIMILARITY: f32 = -1.0;

/// Lowest similarity an engine may report for an attempted comparison.
pub const MIN_SIMILARITY: f32 = 0.0;

/// Highest similarity an engine may report; identical templates compare here.
pub const MAX_SIMILARITY: f32 = 1.0;

/// Bounding box for a detected face, in source-image pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl BoundingBox {
    /// Round a floating-point detection box to whole pixels.
    pub fn from_f32(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x: x.round() as i32,
            y: y.round() as i32,
            width: width.max(0.0).round() as u32,
            height: height.max(0.0).round() as u32,
        }
    }

    pub fn center(&self) -> (f32, f32) {
        (
            self.x as f32 + self.width as f32 / 2.0,
            self.y as f32 + self.height as f32 / 2.0,
        )
    }
}

/// One extraction stage an engine can run over a detected face.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Capability {
    /// Frontal face detection.
    Frontal,
    /// Feature-template representation used for comparison.
    Representation,
    /// Age and ethnicity estimates.
    Demographics,
    /// Pitch / yaw / roll estimates.
    Pose,
    /// Presentation-attack (spoof) scoring.
    Spoof,
    /// Eyewear classification.
    Glasses,
    /// Facial landmark points.
    Landmarks,
    /// Lip state (open / closed).
    Lips,
}

impl Capability {
    pub const ALL: [Capability; 8] = [
        Capability::Frontal,
        Capability::Representation,
        Capability::Demographics,
        Capability::Pose,
        Capability::Spoof,
        Capability::Glasses,
        Capability::Landmarks,
        Capability::Lips,
    ];
}

/// A set of extraction stages, either requested from an engine or recorded
/// on a template as the stages that actually ran.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilitySet(BTreeSet<Capability>);

impl CapabilitySet {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Detection plus representation: what verify and search request.
    pub fn verification() -> Self {
        [Capability::Frontal, Capability::Representation]
            .into_iter()
            .collect()
    }

    /// Every stage: what analyze requests.
    pub fn analysis() -> Self {
        Capability::ALL.into_iter().collect()
    }

    pub fn contains(&self, capability: Capability) -> bool {
        self.0.contains(&capability)
    }

    pub fn insert(&mut self, capability: Capability) -> bool {
        self.0.insert(capability)
    }

    pub fn with(mut self, capability: Capability) -> Self {
        self.0.insert(capability);
        self
    }

    /// Stages present in both sets.
    pub fn intersection(&self, other: &CapabilitySet) -> CapabilitySet {
        self.0.intersection(&other.0).copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        self.0.iter().copied()
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Scalar value of one analysis attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Flag(bool),
    Number(f64),
    Text(String),
}

impl AttributeValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AttributeValue::Number(n) => Some(*n),
            _ => None,
        }
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        AttributeValue::Number(value)
    }
}

impl From<f32> for AttributeValue {
    fn from(value: f32) -> Self {
        AttributeValue::Number(value as f64)
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        AttributeValue::Flag(value)
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        AttributeValue::Text(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        AttributeValue::Text(value)
    }
}

/// Open attribute map attached to a template. Which keys appear depends on
/// the stages that ran.
pub type Attributes = BTreeMap<String, AttributeValue>;

/// Stable position of a template inside a gallery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GalleryIndex(pub u64);

impl fmt::Display for GalleryIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A gallery entry returned by a search, with its similarity to the probe.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub index: GalleryIndex,
    pub similarity: f32,
}
