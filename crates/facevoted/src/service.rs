//! Enrollment and verification orchestration.
//!
//! Images go through the extraction engine; descriptors go to the gallery
//! store (enrollment) or to a matcher built over a fresh gallery read
//! (verification).

use crate::engine::{EngineError, EngineHandle};
use facevote_core::{EuclideanMatcher, ExtractMode, ExtractorError, MatchError, MatchResult, Matcher};
use facevote_store::{GalleryStore, StoreError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("label must not be empty")]
    InvalidLabel,
    #[error("expected {expected} enrollment images, got {actual}")]
    WrongImageCount { expected: usize, actual: usize },
    #[error("extraction failed for image {index}: {source}")]
    ExtractionFailed {
        index: usize,
        #[source]
        source: EngineError,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("internal matcher error: {0}")]
    Match(#[from] MatchError),
}

/// Turns a batch of enrollment photos into one gallery record, all or nothing.
#[derive(Clone)]
pub struct EnrollmentService {
    engine: EngineHandle,
    store: GalleryStore,
    images_required: usize,
}

impl EnrollmentService {
    pub fn new(engine: EngineHandle, store: GalleryStore, images_required: usize) -> Self {
        Self {
            engine,
            store,
            images_required,
        }
    }

    /// Enroll `label` from exactly `images_required` photos, each showing one face.
    ///
    /// Any photo without exactly one detectable face aborts the enrollment
    /// before anything is written. Returns the new record id.
    pub async fn enroll_identity(
        &self,
        label: &str,
        images: Vec<Vec<u8>>,
    ) -> Result<String, ServiceError> {
        let label = label.trim();
        if label.is_empty() {
            return Err(ServiceError::InvalidLabel);
        }
        if images.len() != self.images_required {
            return Err(ServiceError::WrongImageCount {
                expected: self.images_required,
                actual: images.len(),
            });
        }

        tracing::info!(label, images = images.len(), "enrollment started");

        let mut descriptors = Vec::with_capacity(images.len());
        for (index, image) in images.into_iter().enumerate() {
            let descriptor = self
                .engine
                .extract(image, ExtractMode::Single)
                .await
                .and_then(|faces| {
                    faces
                        .into_iter()
                        .next()
                        .ok_or(EngineError::Extractor(ExtractorError::NoFace))
                })
                .map_err(|source| {
                    tracing::warn!(label, index, error = %source, "enrollment image rejected");
                    ServiceError::ExtractionFailed { index, source }
                })?;
            descriptors.push(descriptor);
        }

        let id = self.store.enroll(label, descriptors).await?;
        tracing::info!(label, id = %id, "enrollment complete");
        Ok(id)
    }
}

/// Classifies every face in a probe photo against the current gallery.
#[derive(Clone)]
pub struct VerificationService {
    engine: EngineHandle,
    store: GalleryStore,
    threshold: f32,
}

impl VerificationService {
    pub fn new(engine: EngineHandle, store: GalleryStore, threshold: f32) -> Self {
        Self {
            engine,
            store,
            threshold,
        }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// One result per detected face, in detection order.
    ///
    /// An empty result means no face was found, which is distinct from a face
    /// that matched nobody (`unknown`).
    pub async fn verify_image(&self, image: Vec<u8>) -> Result<Vec<MatchResult>, ServiceError> {
        let probes = self
            .engine
            .extract(image, ExtractMode::All)
            .await
            .map_err(|source| ServiceError::ExtractionFailed { index: 0, source })?;

        if probes.is_empty() {
            tracing::info!("verification: no face in probe image");
            return Ok(Vec::new());
        }

        let gallery = self.store.list_all().await?;
        let matcher = EuclideanMatcher::new(gallery, self.threshold);
        let results = matcher.match_all(&probes).map_err(|e| {
            tracing::error!(error = %e, "probe descriptor does not fit the gallery");
            e
        })?;

        tracing::info!(
            faces = results.len(),
            identities = matcher.labels(),
            matched = results.iter().filter(|r| !r.is_unknown()).count(),
            best_distance = results.iter().map(|r| r.distance).fold(f32::INFINITY, f32::min),
            "verification finished"
        );

        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::spawn_engine;
    use facevote_core::{Descriptor, DescriptorExtractor, UNKNOWN_LABEL};
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;

    const DIM: usize = 4;

    /// Returns a fixed list of faces per image payload.
    struct ScriptedExtractor {
        faces: HashMap<Vec<u8>, Vec<Descriptor>>,
    }

    impl ScriptedExtractor {
        fn new(script: Vec<(&str, Vec<[f32; DIM]>)>) -> Self {
            let faces = script
                .into_iter()
                .map(|(image, faces)| {
                    (
                        image.as_bytes().to_vec(),
                        faces.into_iter().map(|f| Descriptor::new(f.to_vec())).collect(),
                    )
                })
                .collect();
            Self { faces }
        }
    }

    impl DescriptorExtractor for ScriptedExtractor {
        fn dimension(&self) -> usize {
            DIM
        }

        fn extract_all(&self, image: &[u8]) -> Result<Vec<Descriptor>, ExtractorError> {
            self.faces
                .get(image)
                .cloned()
                .ok_or_else(|| ExtractorError::InvalidImage("unscripted payload".into()))
        }
    }

    /// Alice's three enrollment captures cluster near the origin.
    const ALICE_1: [f32; DIM] = [0.0, 0.0, 0.0, 0.0];
    const ALICE_2: [f32; DIM] = [0.0, 0.1, 0.0, 0.0];
    const ALICE_3: [f32; DIM] = [0.0, 0.0, 0.1, 0.0];

    struct Harness {
        enrollment: EnrollmentService,
        verification: VerificationService,
        store: GalleryStore,
    }

    async fn harness() -> Harness {
        let extractor = ScriptedExtractor::new(vec![
            ("alice-1", vec![ALICE_1]),
            ("alice-2", vec![ALICE_2]),
            ("alice-3", vec![ALICE_3]),
            ("bob-1", vec![[2.0, 0.0, 0.0, 0.0]]),
            ("bob-2", vec![[2.0, 0.1, 0.0, 0.0]]),
            ("bob-3", vec![[2.0, 0.0, 0.1, 0.0]]),
            ("empty-room", vec![]),
            ("crowd", vec![[0.0; DIM], [0.0; DIM]]),
            // 0.4 from ALICE_1, farther from the other two.
            ("alice-probe", vec![[-0.4, 0.0, 0.0, 0.0]]),
            // 0.9 from ALICE_1, farther from the other two.
            ("stranger", vec![[-0.9, 0.0, 0.0, 0.0]]),
            ("alice-and-stranger", vec![[-0.9, 0.0, 0.0, 0.0], [-0.4, 0.0, 0.0, 0.0]]),
        ]);
        let engine = spawn_engine(Arc::new(extractor), 2, 8, Duration::from_secs(5)).unwrap();
        let store = GalleryStore::open_in_memory(DIM).await.unwrap();
        Harness {
            enrollment: EnrollmentService::new(engine.clone(), store.clone(), 3),
            verification: VerificationService::new(engine, store.clone(), 0.6),
            store,
        }
    }

    fn images(names: &[&str]) -> Vec<Vec<u8>> {
        names.iter().map(|n| n.as_bytes().to_vec()).collect()
    }

    async fn enroll_alice(h: &Harness) -> String {
        h.enrollment
            .enroll_identity("Alice", images(&["alice-1", "alice-2", "alice-3"]))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_end_to_end_match_and_reject() {
        let h = harness().await;
        enroll_alice(&h).await;

        let results = h.verification.verify_image(b"alice-probe".to_vec()).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].label, "Alice");
        assert!((results[0].distance - 0.4).abs() < 1e-6);

        let results = h.verification.verify_image(b"stranger".to_vec()).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].label, UNKNOWN_LABEL);
        assert!((results[0].distance - 0.9).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_results_follow_detection_order() {
        let h = harness().await;
        enroll_alice(&h).await;

        let results = h
            .verification
            .verify_image(b"alice-and-stranger".to_vec())
            .await
            .unwrap();
        let labels: Vec<&str> = results.iter().map(|r| r.label.as_str()).collect();
        assert_eq!(labels, [UNKNOWN_LABEL, "Alice"]);
    }

    #[tokio::test]
    async fn test_no_face_is_empty_not_error() {
        let h = harness().await;
        enroll_alice(&h).await;
        let results = h.verification.verify_image(b"empty-room".to_vec()).await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_empty_gallery_every_face_unknown() {
        let h = harness().await;
        for (probe, faces) in [("empty-room", 0), ("alice-probe", 1), ("crowd", 2)] {
            let results = h
                .verification
                .verify_image(probe.as_bytes().to_vec())
                .await
                .unwrap();
            assert_eq!(results.len(), faces);
            assert!(results.iter().all(|r| r.is_unknown() && r.distance == f32::INFINITY));
        }
    }

    #[tokio::test]
    async fn test_duplicate_label_rejected() {
        let h = harness().await;
        enroll_alice(&h).await;
        let err = h
            .enrollment
            .enroll_identity("Alice", images(&["bob-1", "bob-2", "bob-3"]))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Store(StoreError::DuplicateLabel(_))), "{err:?}");

        let all = h.store.list_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].descriptors[0].as_slice(), &ALICE_1);
    }

    #[tokio::test]
    async fn test_one_faceless_image_aborts_enrollment() {
        let h = harness().await;
        let err = h
            .enrollment
            .enroll_identity("Alice", images(&["alice-1", "empty-room", "alice-3"]))
            .await
            .unwrap_err();
        assert!(
            matches!(
                err,
                ServiceError::ExtractionFailed {
                    index: 1,
                    source: EngineError::Extractor(ExtractorError::NoFace)
                }
            ),
            "{err:?}"
        );
        assert_eq!(h.store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_group_photo_aborts_enrollment() {
        let h = harness().await;
        let err = h
            .enrollment
            .enroll_identity("Alice", images(&["alice-1", "alice-2", "crowd"]))
            .await
            .unwrap_err();
        assert!(
            matches!(
                err,
                ServiceError::ExtractionFailed {
                    index: 2,
                    source: EngineError::Extractor(ExtractorError::MultipleFaces(2))
                }
            ),
            "{err:?}"
        );
        assert_eq!(h.store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_enrollment_requires_configured_image_count() {
        let h = harness().await;
        let err = h
            .enrollment
            .enroll_identity("Alice", images(&["alice-1", "alice-2"]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ServiceError::WrongImageCount {
                expected: 3,
                actual: 2
            }
        ));
        assert_eq!(h.store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_blank_label_rejected() {
        let h = harness().await;
        let err = h
            .enrollment
            .enroll_identity("  ", images(&["alice-1", "alice-2", "alice-3"]))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidLabel));
    }

    #[tokio::test]
    async fn test_unreadable_probe_is_extraction_failure() {
        let h = harness().await;
        let err = h
            .verification
            .verify_image(b"not-scripted".to_vec())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ServiceError::ExtractionFailed {
                index: 0,
                source: EngineError::Extractor(ExtractorError::InvalidImage(_))
            }
        ));
    }

    #[tokio::test]
    async fn test_deleted_identity_no_longer_matches() {
        let h = harness().await;
        let id = enroll_alice(&h).await;
        h.store.delete(&id).await.unwrap();

        let results = h.verification.verify_image(b"alice-probe".to_vec()).await.unwrap();
        assert!(results[0].is_unknown());
    }

    #[tokio::test]
    async fn test_nearest_of_two_identities() {
        let h = harness().await;
        enroll_alice(&h).await;
        h.enrollment
            .enroll_identity("Bob", images(&["bob-1", "bob-2", "bob-3"]))
            .await
            .unwrap();

        let results = h.verification.verify_image(b"alice-probe".to_vec()).await.unwrap();
        assert_eq!(results[0].label, "Alice");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_enrollments_of_same_label() {
        let h = harness().await;
        let mut tasks = Vec::new();
        for _ in 0..4 {
            let enrollment = h.enrollment.clone();
            tasks.push(tokio::spawn(async move {
                enrollment
                    .enroll_identity("Alice", images(&["alice-1", "alice-2", "alice-3"]))
                    .await
            }));
        }

        let mut created = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => created += 1,
                Err(ServiceError::Store(StoreError::DuplicateLabel(_))) => {}
                Err(e) => panic!("unexpected error: {e:?}"),
            }
        }
        assert_eq!(created, 1);
        assert_eq!(h.store.count().await.unwrap(), 1);
    }
}
