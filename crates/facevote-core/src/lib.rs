//! facevote-core: face descriptor gallery matching.
//!
//! Descriptors come from an external extractor; this crate defines the
//! descriptor and gallery types and the Euclidean nearest-neighbour matcher
//! used to confirm or reject a claimed identity.

pub mod extractor;
pub mod matcher;
pub mod types;

pub use extractor::{DescriptorExtractor, ExtractMode, ExtractorError};
pub use matcher::{EuclideanMatcher, MatchError, Matcher};
pub use types::{
    Descriptor, GalleryRecord, MatchResult, DEFAULT_DESCRIPTOR_DIM, DEFAULT_MATCH_THRESHOLD,
    UNKNOWN_LABEL,
};
