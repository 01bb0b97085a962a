use serde::{Deserialize, Serialize};

use crate::matcher::MatchError;

/// Label reported for a probe face that matches no enrolled identity.
pub const UNKNOWN_LABEL: &str = "unknown";

/// Maximum Euclidean distance accepted as a match.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.6;

/// Descriptor length produced by the reference 128-d face embedding network.
pub const DEFAULT_DESCRIPTOR_DIM: usize = 128;

/// Face descriptor: a fixed-length embedding for one detected face.
///
/// Serializes as a bare array of floats.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Descriptor(Vec<f32>);

impl Descriptor {
    pub fn new(values: Vec<f32>) -> Self {
        Self(values)
    }

    pub fn dimension(&self) -> usize {
        self.0.len()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn into_inner(self) -> Vec<f32> {
        self.0
    }

    /// L2 norm of the component-wise difference.
    ///
    /// Both descriptors must have the same dimension.
    pub fn euclidean_distance(&self, other: &Descriptor) -> Result<f32, MatchError> {
        if self.0.len() != other.0.len() {
            return Err(MatchError::DimensionMismatch {
                expected: self.0.len(),
                actual: other.0.len(),
            });
        }

        Ok(self
            .0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt())
    }
}

impl From<Vec<f32>> for Descriptor {
    fn from(values: Vec<f32>) -> Self {
        Self(values)
    }
}

/// An enrolled identity with every descriptor captured at enrollment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GalleryRecord {
    pub id: String,
    pub label: String,
    pub descriptors: Vec<Descriptor>,
    pub note: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl GalleryRecord {
    /// Dimension shared by the record's descriptors, `None` if it has none.
    pub fn dimension(&self) -> Option<usize> {
        self.descriptors.first().map(Descriptor::dimension)
    }
}

/// Outcome of classifying one probe descriptor against the gallery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    /// Best-matching label, or [`UNKNOWN_LABEL`] when nothing is within threshold.
    pub label: String,
    /// Distance to the nearest gallery descriptor, reported even on rejection.
    /// `f32::INFINITY` when the gallery is empty, which serializes to JSON `null`.
    pub distance: f32,
}

impl MatchResult {
    pub fn unknown(distance: f32) -> Self {
        Self {
            label: UNKNOWN_LABEL.to_string(),
            distance,
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.label == UNKNOWN_LABEL
    }
}
