//! Recording catalog persistence

use ephys_common::time::{format_timestamp, parse_timestamp};
use ephys_common::{Error, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::models::{Recording, RecordingId, RecordingSpec};
use crate::utils::retry_on_lock;

/// Insert a recording unless its id or name is already taken
///
/// Returns `true` when this call inserted the row.
pub async fn insert_recording(pool: &SqlitePool, recording: &Recording) -> Result<bool> {
    let id = recording.id.0.clone();
    let name = recording.spec.name.clone();
    let source_path = recording.spec.source_path.clone();
    let spec = serde_json::to_string(&recording.spec)?;
    let created_at = format_timestamp(recording.created_at);

    let max_wait_ms = super::max_lock_wait_ms(pool).await?;

    retry_on_lock("insert_recording", max_wait_ms, || async {
        let result = sqlx::query(
            r#"
            INSERT INTO recordings (id, name, source_path, spec, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(&id)
        .bind(&name)
        .bind(&source_path)
        .bind(&spec)
        .bind(&created_at)
        .execute(pool)
        .await?;

        Ok(result.rows_affected() > 0)
    })
    .await
}

pub async fn load_recording(pool: &SqlitePool, id: &RecordingId) -> Result<Option<Recording>> {
    let row = sqlx::query("SELECT id, spec, created_at FROM recordings WHERE id = ?")
        .bind(id.as_str())
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(row_to_recording).transpose()
}

pub async fn load_recording_by_name(pool: &SqlitePool, name: &str) -> Result<Option<Recording>> {
    let row = sqlx::query("SELECT id, spec, created_at FROM recordings WHERE name = ?")
        .bind(name)
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(row_to_recording).transpose()
}

pub async fn list_recordings(pool: &SqlitePool) -> Result<Vec<Recording>> {
    let rows = sqlx::query("SELECT id, spec, created_at FROM recordings ORDER BY name")
        .fetch_all(pool)
        .await?;

    rows.iter().map(row_to_recording).collect()
}

fn row_to_recording(row: &SqliteRow) -> Result<Recording> {
    let spec: String = row.get("spec");
    let spec: RecordingSpec = serde_json::from_str(&spec)
        .map_err(|e| Error::Internal(format!("Failed to deserialize recording spec: {}", e)))?;
    let created_at: String = row.get("created_at");

    Ok(Recording {
        id: RecordingId(row.get("id")),
        spec,
        created_at: parse_timestamp(&created_at)?,
    })
}
