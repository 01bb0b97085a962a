//! facevote-store: persistent gallery of enrolled face descriptors.
//!
//! One SQLite row per identity label. Label uniqueness is a table
//! constraint, so concurrent enrollments of the same label cannot both land.

pub mod gallery;

pub use gallery::{GalleryStore, RecordUpdate, StoreError};
