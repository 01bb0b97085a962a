//! SQLite-backed gallery store.
//!
//! Descriptors are stored as a JSON array of float arrays so they round-trip
//! exactly. Every read re-validates them against the configured dimension.

use facevote_core::{Descriptor, GalleryRecord};
use rusqlite::{params, OptionalExtension};
use std::path::Path;
use thiserror::Error;
use tokio_rusqlite::Connection;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS gallery (
    id          TEXT PRIMARY KEY,
    label       TEXT NOT NULL UNIQUE,
    dimension   INTEGER NOT NULL,
    descriptors TEXT NOT NULL,
    note        TEXT,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);
";

const SELECT_COLUMNS: &str =
    "SELECT id, label, dimension, descriptors, note, created_at, updated_at FROM gallery";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("label must not be empty")]
    EmptyLabel,
    #[error("label already enrolled: {0}")]
    DuplicateLabel(String),
    #[error("no descriptors to enroll")]
    EmptyDescriptorSet,
    #[error("descriptor {index} has dimension {actual}, expected {expected}")]
    DimensionMismatch {
        index: usize,
        expected: usize,
        actual: usize,
    },
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("record {id} is corrupt: {reason}")]
    CorruptRecord { id: String, reason: String },
    #[error("descriptor encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("database: {0}")]
    Database(#[from] tokio_rusqlite::Error),
}

impl StoreError {
    /// True for persistence-layer failures, as opposed to domain rejections.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            StoreError::Io(_) | StoreError::Database(_) | StoreError::CorruptRecord { .. }
        )
    }
}

/// Metadata changes for an existing record. `None` leaves a field as is.
/// Descriptors are never modified after enrollment.
#[derive(Debug, Clone, Default)]
pub struct RecordUpdate {
    pub label: Option<String>,
    /// `Some(None)` clears the note.
    pub note: Option<Option<String>>,
}

/// Result of a single write statement, decided inside the connection thread.
enum WriteOutcome {
    Done,
    Missing,
    DuplicateLabel,
}

/// Row as read from SQLite, before validation.
struct RawRecord {
    id: String,
    label: String,
    dimension: i64,
    descriptors: String,
    note: Option<String>,
    created_at: String,
    updated_at: String,
}

/// Handle to the gallery database. Cheap to clone; all clones share one
/// background connection.
#[derive(Clone)]
pub struct GalleryStore {
    conn: Connection,
    dimension: usize,
}

impl GalleryStore {
    /// Open (or create) the gallery database at `path`.
    pub async fn open(path: &Path, dimension: usize) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let conn = Connection::open(path).await?;
        tracing::info!(path = %path.display(), dimension, "gallery database opened");
        Self::init(conn, dimension).await
    }

    /// Volatile gallery, used by tests and dry runs.
    pub async fn open_in_memory(dimension: usize) -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().await?;
        Self::init(conn, dimension).await
    }

    async fn init(conn: Connection, dimension: usize) -> Result<Self, StoreError> {
        conn.call(|conn| {
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await?;
        Ok(Self { conn, dimension })
    }

    /// Descriptor dimension every record must have.
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Create a record for `label`. Returns the new record id.
    pub async fn enroll(
        &self,
        label: &str,
        descriptors: Vec<Descriptor>,
    ) -> Result<String, StoreError> {
        let label = label.trim().to_string();
        if label.is_empty() {
            return Err(StoreError::EmptyLabel);
        }
        if descriptors.is_empty() {
            return Err(StoreError::EmptyDescriptorSet);
        }
        if let Some((index, d)) = descriptors
            .iter()
            .enumerate()
            .find(|(_, d)| d.dimension() != self.dimension)
        {
            return Err(StoreError::DimensionMismatch {
                index,
                expected: self.dimension,
                actual: d.dimension(),
            });
        }

        let encoded = serde_json::to_string(&descriptors)?;
        let id = uuid::Uuid::new_v4().to_string();
        let now = chrono::Utc::now().to_rfc3339();
        let dimension = self.dimension as i64;
        let count = descriptors.len();

        let (row_id, row_label) = (id.clone(), label.clone());
        let outcome = self
            .conn
            .call(move |conn| {
                let inserted = conn.execute(
                    "INSERT INTO gallery (id, label, dimension, descriptors, note, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, NULL, ?5, ?5)",
                    params![row_id, row_label, dimension, encoded, now],
                );
                match inserted {
                    Ok(_) => Ok(WriteOutcome::Done),
                    Err(e) if is_unique_violation(&e) => Ok(WriteOutcome::DuplicateLabel),
                    Err(e) => Err(e.into()),
                }
            })
            .await?;

        match outcome {
            WriteOutcome::Done => {
                tracing::info!(id = %id, label = %label, descriptors = count, "gallery record created");
                Ok(id)
            }
            _ => {
                tracing::warn!(label = %label, "enrollment rejected: duplicate label");
                Err(StoreError::DuplicateLabel(label))
            }
        }
    }

    /// Every record, in enrollment order, read as one snapshot.
    pub async fn list_all(&self) -> Result<Vec<GalleryRecord>, StoreError> {
        let rows = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(&format!("{SELECT_COLUMNS} ORDER BY rowid"))?;
                let rows = stmt
                    .query_map([], read_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        rows.into_iter().map(|raw| self.decode(raw)).collect()
    }

    pub async fn get(&self, id: &str) -> Result<GalleryRecord, StoreError> {
        let key = id.to_string();
        let row = self
            .conn
            .call(move |conn| {
                let row = conn
                    .query_row(&format!("{SELECT_COLUMNS} WHERE id = ?1"), params![key], read_row)
                    .optional()?;
                Ok(row)
            })
            .await?;

        match row {
            Some(raw) => self.decode(raw),
            None => Err(StoreError::NotFound(id.to_string())),
        }
    }

    pub async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let key = id.to_string();
        let removed = self
            .conn
            .call(move |conn| Ok(conn.execute("DELETE FROM gallery WHERE id = ?1", params![key])?))
            .await?;

        if removed == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        tracing::info!(id, "gallery record deleted");
        Ok(())
    }

    /// Replace metadata on a record and return the updated record.
    pub async fn update(
        &self,
        id: &str,
        update: RecordUpdate,
    ) -> Result<GalleryRecord, StoreError> {
        let label = match update.label {
            Some(l) => {
                let l = l.trim().to_string();
                if l.is_empty() {
                    return Err(StoreError::EmptyLabel);
                }
                Some(l)
            }
            None => None,
        };
        let set_note = update.note.is_some();
        let note = update.note.flatten();
        let now = chrono::Utc::now().to_rfc3339();

        let (key, new_label) = (id.to_string(), label.clone());
        let outcome = self
            .conn
            .call(move |conn| {
                let updated = conn.execute(
                    "UPDATE gallery
                     SET label = COALESCE(?2, label),
                         note = CASE WHEN ?3 THEN ?4 ELSE note END,
                         updated_at = ?5
                     WHERE id = ?1",
                    params![key, new_label, set_note, note, now],
                );
                match updated {
                    Ok(0) => Ok(WriteOutcome::Missing),
                    Ok(_) => Ok(WriteOutcome::Done),
                    Err(e) if is_unique_violation(&e) => Ok(WriteOutcome::DuplicateLabel),
                    Err(e) => Err(e.into()),
                }
            })
            .await?;

        match outcome {
            WriteOutcome::Done => {
                tracing::info!(id, "gallery record updated");
                self.get(id).await
            }
            WriteOutcome::Missing => Err(StoreError::NotFound(id.to_string())),
            WriteOutcome::DuplicateLabel => Err(StoreError::DuplicateLabel(label.unwrap_or_default())),
        }
    }

    /// Number of enrolled identities.
    pub async fn count(&self) -> Result<usize, StoreError> {
        let n = self
            .conn
            .call(|conn| {
                let n: i64 = conn.query_row("SELECT COUNT(*) FROM gallery", [], |row| row.get(0))?;
                Ok(n)
            })
            .await?;
        Ok(n as usize)
    }

    /// Validate a stored row. Malformed rows are rejected, never coerced.
    fn decode(&self, raw: RawRecord) -> Result<GalleryRecord, StoreError> {
        let corrupt = |reason: String| StoreError::CorruptRecord {
            id: raw.id.clone(),
            reason,
        };

        if raw.dimension != self.dimension as i64 {
            return Err(corrupt(format!(
                "stored dimension {} does not match expected {}",
                raw.dimension, self.dimension
            )));
        }
        let descriptors: Vec<Descriptor> = serde_json::from_str(&raw.descriptors)
            .map_err(|e| corrupt(format!("descriptors do not parse: {e}")))?;
        if descriptors.is_empty() {
            return Err(corrupt("no descriptors".into()));
        }
        if let Some((index, d)) = descriptors
            .iter()
            .enumerate()
            .find(|(_, d)| d.dimension() != self.dimension)
        {
            return Err(corrupt(format!(
                "descriptor {index} has dimension {}",
                d.dimension()
            )));
        }

        Ok(GalleryRecord {
            id: raw.id,
            label: raw.label,
            descriptors,
            note: raw.note,
            created_at: raw.created_at,
            updated_at: raw.updated_at,
        })
    }
}

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRecord> {
    Ok(RawRecord {
        id: row.get(0)?,
        label: row.get(1)?,
        dimension: row.get(2)?,
        descriptors: row.get(3)?,
        note: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}
