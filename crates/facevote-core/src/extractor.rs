//! Descriptor extraction capability.
//!
//! Face detection and embedding happen outside this crate. Implementations
//! wrap whatever model or process produces the descriptors and are built
//! once at startup, then shared read-only.

use crate::types::Descriptor;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExtractorError {
    #[error("no face detected")]
    NoFace,
    #[error("expected exactly one face, detected {0}")]
    MultipleFaces(usize),
    #[error("payload is not a supported image: {0}")]
    InvalidImage(String),
    #[error("extraction failed: {0}")]
    Failed(String),
    #[error("extraction timed out after {0:?}")]
    Timeout(Duration),
}

/// How many faces the caller expects in an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractMode {
    /// Exactly one face; zero or several is an error.
    Single,
    /// Every detected face, possibly none.
    All,
}

/// Turns an image payload into one descriptor per detected face.
pub trait DescriptorExtractor: Send + Sync {
    /// Length of every descriptor this extractor produces.
    fn dimension(&self) -> usize;

    /// All faces in detection order. An image without faces yields an empty vec.
    fn extract_all(&self, image: &[u8]) -> Result<Vec<Descriptor>, ExtractorError>;

    fn extract(&self, image: &[u8], mode: ExtractMode) -> Result<Vec<Descriptor>, ExtractorError> {
        let descriptors = self.extract_all(image)?;
        match mode {
            ExtractMode::All => Ok(descriptors),
            ExtractMode::Single => match descriptors.len() {
                0 => Err(ExtractorError::NoFace),
                1 => Ok(descriptors),
                n => Err(ExtractorError::MultipleFaces(n)),
            },
        }
    }
}
