//! Nearest-neighbour matching of probe descriptors against the gallery.

use crate::types::{Descriptor, GalleryRecord, MatchResult};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MatchError {
    #[error("descriptor dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// Strategy for classifying probe descriptors against a gallery snapshot.
pub trait Matcher {
    fn find_best_match(&self, probe: &Descriptor) -> Result<MatchResult, MatchError>;

    /// Classify every probe, preserving the order the extractor detected them in.
    fn match_all(&self, probes: &[Descriptor]) -> Result<Vec<MatchResult>, MatchError> {
        probes.iter().map(|p| self.find_best_match(p)).collect()
    }
}

/// One label and every descriptor enrolled under it.
#[derive(Debug, Clone)]
struct LabeledDescriptors {
    label: String,
    descriptors: Vec<Descriptor>,
}

/// Euclidean nearest-neighbour matcher with per-label min-pooling.
///
/// A label's distance to a probe is the distance to its closest enrolled
/// descriptor. The label with the smallest such distance wins; it is reported
/// only if that distance is `<= threshold`, otherwise the result is `unknown`
/// with the distance still filled in.
///
/// Ties between labels go to the record that comes first in the snapshot.
/// With an empty gallery every probe is `unknown` at `f32::INFINITY`.
///
/// Built per request from a fresh gallery read, so it always reflects the
/// latest enrollments and deletions.
pub struct EuclideanMatcher {
    gallery: Vec<LabeledDescriptors>,
    threshold: f32,
}

impl EuclideanMatcher {
    pub fn new(records: Vec<GalleryRecord>, threshold: f32) -> Self {
        let gallery = records
            .into_iter()
            .map(|r| LabeledDescriptors {
                label: r.label,
                descriptors: r.descriptors,
            })
            .collect();
        Self { gallery, threshold }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn labels(&self) -> usize {
        self.gallery.len()
    }

    /// Distance from `probe` to the closest of `descriptors`.
    fn pooled_distance(probe: &Descriptor, descriptors: &[Descriptor]) -> Result<f32, MatchError> {
        let mut best = f32::INFINITY;
        for d in descriptors {
            let dist = d.euclidean_distance(probe)?;
            if dist < best {
                best = dist;
            }
        }
        Ok(best)
    }
}

impl Matcher for EuclideanMatcher {
    fn find_best_match(&self, probe: &Descriptor) -> Result<MatchResult, MatchError> {
        let mut best_dist = f32::INFINITY;
        let mut best_idx: Option<usize> = None;

        for (i, entry) in self.gallery.iter().enumerate() {
            let dist = Self::pooled_distance(probe, &entry.descriptors)?;
            // Strict `<`: an equal distance never displaces an earlier label.
            if dist < best_dist {
                best_dist = dist;
                best_idx = Some(i);
            }
        }

        let result = match best_idx {
            Some(idx) if best_dist <= self.threshold => MatchResult {
                label: self.gallery[idx].label.clone(),
                distance: best_dist,
            },
            _ => MatchResult::unknown(best_dist),
        };

        tracing::trace!(
            label = %result.label,
            distance = result.distance,
            threshold = self.threshold,
            "probe classified"
        );

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DEFAULT_MATCH_THRESHOLD, UNKNOWN_LABEL};

    fn record(label: &str, descriptors: Vec<Vec<f32>>) -> GalleryRecord {
        GalleryRecord {
            id: format!("id-{label}"),
            label: label.into(),
            descriptors: descriptors.into_iter().map(Descriptor::new).collect(),
            note: None,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    fn probe(values: Vec<f32>) -> Descriptor {
        Descriptor::new(values)
    }

    #[test]
    fn test_threshold_is_inclusive() {
        // sqrt(0.6 * 0.6) rounds back to exactly 0.6 in f32.
        let matcher = EuclideanMatcher::new(
            vec![record("alice", vec![vec![0.0, 0.0]])],
            DEFAULT_MATCH_THRESHOLD,
        );
        let result = matcher.find_best_match(&probe(vec![0.6, 0.0])).unwrap();
        assert_eq!(result.distance, 0.6);
        assert_eq!(result.label, "alice");
    }

    #[test]
    fn test_just_past_threshold_is_unknown() {
        let matcher = EuclideanMatcher::new(
            vec![record("alice", vec![vec![0.0, 0.0]])],
            DEFAULT_MATCH_THRESHOLD,
        );
        let result = matcher.find_best_match(&probe(vec![0.6001, 0.0])).unwrap();
        assert_eq!(result.label, UNKNOWN_LABEL);
        assert!((result.distance - 0.6001).abs() < 1e-6);
    }

    #[test]
    fn test_min_pooling_uses_closest_descriptor() {
        // Two captures of the same person: one 0.8 away, one 0.3 away.
        let matcher = EuclideanMatcher::new(
            vec![record("alice", vec![vec![0.8, 0.0], vec![0.0, 0.3]])],
            DEFAULT_MATCH_THRESHOLD,
        );
        let result = matcher.find_best_match(&probe(vec![0.0, 0.0])).unwrap();
        assert_eq!(result.label, "alice");
        // Not the mean (0.55) or the max (0.8).
        assert!((result.distance - 0.3).abs() < 1e-6);
    }

    #[test]
    fn test_nearest_label_wins() {
        let matcher = EuclideanMatcher::new(
            vec![
                record("decoy1", vec![vec![0.0, 0.5, 0.0]]),
                record("decoy2", vec![vec![0.0, 0.0, 0.45]]),
                record("match", vec![vec![0.9, 0.0, 0.0], vec![0.1, 0.0, 0.0]]),
            ],
            DEFAULT_MATCH_THRESHOLD,
        );
        let result = matcher.find_best_match(&probe(vec![0.0, 0.0, 0.0])).unwrap();
        assert_eq!(result.label, "match");
        assert!((result.distance - 0.1).abs() < 1e-6);
    }

    #[test]
    fn test_rejection_still_reports_distance() {
        let matcher = EuclideanMatcher::new(
            vec![record("bob", vec![vec![3.0, 4.0]])],
            DEFAULT_MATCH_THRESHOLD,
        );
        let result = matcher.find_best_match(&probe(vec![0.0, 0.0])).unwrap();
        assert!(result.is_unknown());
        assert!((result.distance - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_tie_goes_to_first_record() {
        let same = vec![vec![0.1, 0.2, 0.3]];
        let matcher = EuclideanMatcher::new(
            vec![record("first", same.clone()), record("second", same.clone())],
            DEFAULT_MATCH_THRESHOLD,
        );
        let result = matcher.find_best_match(&probe(vec![0.1, 0.2, 0.35])).unwrap();
        assert_eq!(result.label, "first");

        // Reversing the snapshot order reverses the winner.
        let matcher = EuclideanMatcher::new(
            vec![record("second", same.clone()), record("first", same)],
            DEFAULT_MATCH_THRESHOLD,
        );
        let result = matcher.find_best_match(&probe(vec![0.1, 0.2, 0.35])).unwrap();
        assert_eq!(result.label, "second");
    }

    #[test]
    fn test_deterministic_across_calls() {
        let matcher = EuclideanMatcher::new(
            vec![
                record("a", vec![vec![0.2, 0.1], vec![0.3, 0.3]]),
                record("b", vec![vec![-0.2, 0.1]]),
            ],
            DEFAULT_MATCH_THRESHOLD,
        );
        let p = probe(vec![0.0, 0.1]);
        let first = matcher.find_best_match(&p).unwrap();
        for _ in 0..10 {
            assert_eq!(matcher.find_best_match(&p).unwrap(), first);
        }
    }

    #[test]
    fn test_empty_gallery_is_unknown_at_infinity() {
        let matcher = EuclideanMatcher::new(vec![], DEFAULT_MATCH_THRESHOLD);
        for faces in [0usize, 1, 3] {
            let probes: Vec<Descriptor> = (0..faces).map(|i| probe(vec![i as f32, 0.0])).collect();
            let results = matcher.match_all(&probes).unwrap();
            assert_eq!(results.len(), faces);
            for r in results {
                assert!(r.is_unknown());
                assert_eq!(r.distance, f32::INFINITY);
            }
        }
    }

    #[test]
    fn test_match_all_preserves_detection_order() {
        let matcher = EuclideanMatcher::new(
            vec![
                record("left", vec![vec![-1.0, 0.0]]),
                record("right", vec![vec![1.0, 0.0]]),
            ],
            DEFAULT_MATCH_THRESHOLD,
        );
        let results = matcher
            .match_all(&[
                probe(vec![1.0, 0.1]),
                probe(vec![10.0, 10.0]),
                probe(vec![-1.0, -0.1]),
            ])
            .unwrap();
        let labels: Vec<&str> = results.iter().map(|r| r.label.as_str()).collect();
        assert_eq!(labels, ["right", UNKNOWN_LABEL, "left"]);
    }

    #[test]
    fn test_no_probes_yields_no_results() {
        let matcher = EuclideanMatcher::new(
            vec![record("alice", vec![vec![0.0, 0.0]])],
            DEFAULT_MATCH_THRESHOLD,
        );
        assert!(matcher.match_all(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_probe_dimension_mismatch_is_an_error() {
        let matcher = EuclideanMatcher::new(
            vec![record("alice", vec![vec![0.0; 128]])],
            DEFAULT_MATCH_THRESHOLD,
        );
        let err = matcher.find_best_match(&probe(vec![0.0; 64])).unwrap_err();
        assert_eq!(
            err,
            MatchError::DimensionMismatch {
                expected: 128,
                actual: 64
            }
        );
    }
}
