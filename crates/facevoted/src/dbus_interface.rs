use crate::engine::EngineError;
use crate::service::{EnrollmentService, ServiceError, VerificationService};
use facevote_core::{ExtractorError, GalleryRecord};
use facevote_store::{GalleryStore, RecordUpdate, StoreError};
use serde::Serialize;
use zbus::{fdo, interface};

pub const BUS_NAME: &str = "org.facevote.Gallery1";
pub const OBJECT_PATH: &str = "/org/facevote/Gallery1";

/// D-Bus interface for the facevote gallery daemon.
///
/// Bus name: org.facevote.Gallery1
/// Object path: /org/facevote/Gallery1
pub struct GalleryService {
    enrollment: EnrollmentService,
    verification: VerificationService,
    store: GalleryStore,
    workers: usize,
}

impl GalleryService {
    pub fn new(
        enrollment: EnrollmentService,
        verification: VerificationService,
        store: GalleryStore,
        workers: usize,
    ) -> Self {
        Self {
            enrollment,
            verification,
            store,
            workers,
        }
    }
}

#[interface(name = "org.facevote.Gallery1")]
impl GalleryService {
    /// Enroll a voter from a set of single-face photos. Returns the record id.
    async fn enroll(&self, label: &str, images: Vec<Vec<u8>>) -> fdo::Result<String> {
        tracing::info!(label, images = images.len(), "enroll requested");
        self.enrollment
            .enroll_identity(label, images)
            .await
            .map_err(service_to_fdo)
    }

    /// Classify every face in a photo. Returns a JSON array of `{label, distance}`.
    ///
    /// `distance` is a number, or `null` when the gallery is empty and there
    /// was nothing to measure against (the label is then `unknown`).
    async fn verify(&self, image: Vec<u8>) -> fdo::Result<String> {
        tracing::info!(bytes = image.len(), "verify requested");
        let results = self
            .verification
            .verify_image(image)
            .await
            .map_err(service_to_fdo)?;
        to_json(&results)
    }

    /// List enrolled voters without their descriptors.
    async fn list_voters(&self) -> fdo::Result<String> {
        let records = self.store.list_all().await.map_err(store_to_fdo)?;
        let voters: Vec<VoterSummary> = records.iter().map(VoterSummary::from).collect();
        tracing::info!(count = voters.len(), "list_voters requested");
        to_json(&voters)
    }

    async fn remove_voter(&self, id: &str) -> fdo::Result<bool> {
        tracing::info!(id, "remove_voter requested");
        self.store.delete(id).await.map_err(store_to_fdo)?;
        Ok(true)
    }

    /// Change a voter's label and/or note. Empty strings leave a field unchanged.
    async fn update_voter(&self, id: &str, label: &str, note: &str) -> fdo::Result<String> {
        tracing::info!(id, "update_voter requested");
        let update = RecordUpdate {
            label: non_empty(label),
            note: non_empty(note).map(Some),
        };
        let record = self.store.update(id, update).await.map_err(store_to_fdo)?;
        to_json(&VoterSummary::from(&record))
    }

    /// Return daemon status information.
    async fn status(&self) -> fdo::Result<String> {
        let enrolled = self.store.count().await.map_err(store_to_fdo)?;
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "enrolled": enrolled,
            "threshold": self.verification.threshold(),
            "dimension": self.store.dimension(),
            "workers": self.workers,
        })
        .to_string())
    }
}

/// Voter record as exposed over the bus: descriptor count instead of vectors.
#[derive(Debug, Serialize)]
pub struct VoterSummary {
    pub id: String,
    pub label: String,
    pub descriptors: usize,
    pub note: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl From<&GalleryRecord> for VoterSummary {
    fn from(record: &GalleryRecord) -> Self {
        Self {
            id: record.id.clone(),
            label: record.label.clone(),
            descriptors: record.descriptors.len(),
            note: record.note.clone(),
            created_at: record.created_at.clone(),
            updated_at: record.updated_at.clone(),
        }
    }
}

fn non_empty(value: &str) -> Option<String> {
    Some(value.to_string()).filter(|v| !v.trim().is_empty())
}

fn to_json<T: Serialize>(value: &T) -> fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| fdo::Error::Failed(e.to_string()))
}

fn service_to_fdo(err: ServiceError) -> fdo::Error {
    match err {
        ServiceError::Store(e) => store_to_fdo(e),
        ServiceError::InvalidLabel | ServiceError::WrongImageCount { .. } => {
            fdo::Error::InvalidArgs(err.to_string())
        }
        ServiceError::ExtractionFailed {
            source: EngineError::Extractor(ref e),
            ..
        } if !matches!(e, ExtractorError::Failed(_) | ExtractorError::Timeout(_)) => {
            fdo::Error::InvalidArgs(err.to_string())
        }
        ServiceError::ExtractionFailed { .. } | ServiceError::Match(_) => {
            tracing::error!(error = %err, "request failed");
            fdo::Error::Failed(err.to_string())
        }
    }
}

fn store_to_fdo(err: StoreError) -> fdo::Error {
    match err {
        StoreError::DuplicateLabel(_) => fdo::Error::FileExists(err.to_string()),
        StoreError::NotFound(_) => fdo::Error::UnknownObject(err.to_string()),
        ref e if e.is_infrastructure() => {
            tracing::error!(error = %err, "gallery store failure");
            fdo::Error::Failed(err.to_string())
        }
        StoreError::Encode(_) => fdo::Error::Failed(err.to_string()),
        _ => fdo::Error::InvalidArgs(err.to_string()),
    }
}
