//! Recording catalog
//!
//! Same conflict rules as the parameter registry, keyed by the recording's
//! content identity instead of a fingerprint.

use sqlx::SqlitePool;
use tracing::info;

use crate::db::recordings;
use crate::error::{Result, SortError};
use crate::models::{Recording, RecordingId, RecordingSpec};

#[derive(Clone)]
pub struct RecordingCatalog {
    db: SqlitePool,
}

impl RecordingCatalog {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Register a recording; idempotent for an identical description
    pub async fn add(&self, spec: RecordingSpec) -> Result<Recording> {
        spec.validate()?;
        let id = spec.identity()?;

        if let Some(existing) = self.check_existing(&spec.name, &id).await? {
            return Ok(existing);
        }

        let recording = Recording {
            id,
            spec,
            created_at: ephys_common::time::now(),
        };

        if recordings::insert_recording(&self.db, &recording).await? {
            info!(recording = %recording.spec.name, id = %recording.id, "Added recording");
            return Ok(recording);
        }

        self.check_existing(&recording.spec.name, &recording.id)
            .await?
            .ok_or_else(|| {
                SortError::Common(ephys_common::Error::Internal(format!(
                    "recording '{}' neither inserted nor found",
                    recording.spec.name
                )))
            })
    }

    async fn check_existing(&self, name: &str, id: &RecordingId) -> Result<Option<Recording>> {
        if let Some(existing) = recordings::load_recording_by_name(&self.db, name).await? {
            return if &existing.id == id {
                Ok(Some(existing))
            } else {
                Err(SortError::DuplicateNameConflict {
                    name: name.to_string(),
                })
            };
        }

        if let Some(existing) = recordings::load_recording(&self.db, id).await? {
            return Err(SortError::DuplicateContentConflict {
                existing: existing.spec.name,
            });
        }

        Ok(None)
    }

    pub async fn get(&self, id: &RecordingId) -> Result<Recording> {
        recordings::load_recording(&self.db, id)
            .await?
            .ok_or_else(|| SortError::UnresolvedDependency(format!("recording {}", id)))
    }

    pub async fn get_by_name(&self, name: &str) -> Result<Recording> {
        recordings::load_recording_by_name(&self.db, name)
            .await?
            .ok_or_else(|| SortError::UnresolvedDependency(format!("recording '{}'", name)))
    }

    pub async fn list(&self) -> Result<Vec<Recording>> {
        Ok(recordings::list_recordings(&self.db).await?)
    }
}
