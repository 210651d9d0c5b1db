//! Parameter set persistence

use chrono::{DateTime, Utc};
use ephys_common::time::{format_timestamp, parse_timestamp};
use ephys_common::{Error, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::models::{Fingerprint, Options, ParameterSet, ParameterSetId};
use crate::utils::retry_on_lock;

const COLUMNS: &str = "id, name, sorter_name, description, options, fingerprint, created_at";

/// Row to insert; the id is assigned by SQLite
pub struct NewParameterSet<'a> {
    pub name: &'a str,
    pub sorter_name: &'a str,
    pub description: &'a str,
    pub options: &'a Options,
    pub fingerprint: &'a Fingerprint,
    pub created_at: DateTime<Utc>,
}

/// Insert unless the name or fingerprint is taken; returns the new id if inserted
pub async fn insert_parameter_set(pool: &SqlitePool, new: &NewParameterSet<'_>) -> Result<Option<ParameterSetId>> {
    let options = serde_json::to_string(new.options)?;
    let created_at = format_timestamp(new.created_at);

    let max_wait_ms = super::max_lock_wait_ms(pool).await?;

    retry_on_lock("insert_parameter_set", max_wait_ms, || async {
        let result = sqlx::query(
            r#"
            INSERT INTO parameter_sets (name, sorter_name, description, options, fingerprint, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(new.name)
        .bind(new.sorter_name)
        .bind(new.description)
        .bind(&options)
        .bind(new.fingerprint.as_str())
        .bind(&created_at)
        .execute(pool)
        .await?;

        if result.rows_affected() == 0 {
            Ok(None)
        } else {
            Ok(Some(ParameterSetId(result.last_insert_rowid())))
        }
    })
    .await
}

pub async fn load_parameter_set(pool: &SqlitePool, id: ParameterSetId) -> Result<Option<ParameterSet>> {
    let sql = format!("SELECT {} FROM parameter_sets WHERE id = ?", COLUMNS);
    let row = sqlx::query(&sql).bind(id.0).fetch_optional(pool).await?;
    row.as_ref().map(row_to_parameter_set).transpose()
}

pub async fn load_parameter_set_by_name(pool: &SqlitePool, name: &str) -> Result<Option<ParameterSet>> {
    let sql = format!("SELECT {} FROM parameter_sets WHERE name = ?", COLUMNS);
    let row = sqlx::query(&sql).bind(name).fetch_optional(pool).await?;
    row.as_ref().map(row_to_parameter_set).transpose()
}

pub async fn load_parameter_set_by_fingerprint(
    pool: &SqlitePool,
    fingerprint: &Fingerprint,
) -> Result<Option<ParameterSet>> {
    let sql = format!("SELECT {} FROM parameter_sets WHERE fingerprint = ?", COLUMNS);
    let row = sqlx::query(&sql)
        .bind(fingerprint.as_str())
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(row_to_parameter_set).transpose()
}

pub async fn list_parameter_sets(pool: &SqlitePool) -> Result<Vec<ParameterSet>> {
    let sql = format!("SELECT {} FROM parameter_sets ORDER BY id", COLUMNS);
    let rows = sqlx::query(&sql).fetch_all(pool).await?;
    rows.iter().map(row_to_parameter_set).collect()
}

fn row_to_parameter_set(row: &SqliteRow) -> Result<ParameterSet> {
    let options: String = row.get("options");
    let options: Options = serde_json::from_str(&options)
        .map_err(|e| Error::Internal(format!("Failed to deserialize options: {}", e)))?;
    let created_at: String = row.get("created_at");

    Ok(ParameterSet {
        id: ParameterSetId(row.get("id")),
        name: row.get("name"),
        sorter_name: row.get("sorter_name"),
        description: row.get("description"),
        options,
        fingerprint: Fingerprint(row.get("fingerprint")),
        created_at: parse_timestamp(&created_at)?,
    })
}
