//! Job row persistence
//!
//! Every state change is a single `UPDATE .. WHERE identity = ? AND state = ?`
//! statement. Callers inspect the affected row count: 0 means another worker
//! (or process) moved the job first.

use chrono::{DateTime, Utc};
use ephys_common::time::{format_timestamp, parse_optional_timestamp, parse_timestamp};
use ephys_common::{Error, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::path::{Path, PathBuf};

use crate::error::FailureKind;
use crate::models::{Job, JobIdentity, JobState, ParameterSetId, RecordingId};
use crate::utils::retry_on_lock;

const COLUMNS: &str = r#"
    identity, recording_id, paramset_id, sorter_name, tool_version, state, attempt,
    working_dir, output_dir, diagnostic, failure_kind, cancel_requested, worker_id,
    created_at, started_at, finished_at, heartbeat_at, updated_at
"#;

/// Fields of a newly registered job
pub struct NewJob<'a> {
    pub identity: &'a JobIdentity,
    pub recording_id: &'a RecordingId,
    pub paramset_id: ParameterSetId,
    pub sorter_name: &'a str,
    pub tool_version: &'a str,
    pub created_at: DateTime<Utc>,
}

/// Insert a PENDING row unless one already exists; returns `true` if inserted
pub async fn insert_job(pool: &SqlitePool, new: &NewJob<'_>) -> Result<bool> {
    let created_at = format_timestamp(new.created_at);
    let max_wait_ms = super::max_lock_wait_ms(pool).await?;

    retry_on_lock("insert_job", max_wait_ms, || async {
        let result = sqlx::query(
            r#"
            INSERT INTO jobs (
                identity, recording_id, paramset_id, sorter_name, tool_version,
                state, attempt, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, 'PENDING', 1, ?, ?)
            ON CONFLICT(identity) DO NOTHING
            "#,
        )
        .bind(new.identity.as_str())
        .bind(new.recording_id.as_str())
        .bind(new.paramset_id.0)
        .bind(new.sorter_name)
        .bind(new.tool_version)
        .bind(&created_at)
        .bind(&created_at)
        .execute(pool)
        .await?;

        Ok(result.rows_affected() > 0)
    })
    .await
}

pub async fn load_job(pool: &SqlitePool, identity: &JobIdentity) -> Result<Option<Job>> {
    let sql = format!("SELECT {} FROM jobs WHERE identity = ?", COLUMNS);
    let row = sqlx::query(&sql)
        .bind(identity.as_str())
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(row_to_job).transpose()
}

/// All jobs, optionally filtered by state, oldest first
pub async fn list_jobs(pool: &SqlitePool, state: Option<JobState>) -> Result<Vec<Job>> {
    let rows = match state {
        Some(state) => {
            let sql = format!("SELECT {} FROM jobs WHERE state = ? ORDER BY created_at, identity", COLUMNS);
            sqlx::query(&sql).bind(state.as_str()).fetch_all(pool).await?
        }
        None => {
            let sql = format!("SELECT {} FROM jobs ORDER BY created_at, identity", COLUMNS);
            sqlx::query(&sql).fetch_all(pool).await?
        }
    };

    rows.iter().map(row_to_job).collect()
}

/// RUNNING jobs whose last heartbeat is older than `cutoff`
pub async fn list_stale_running(pool: &SqlitePool, cutoff: DateTime<Utc>) -> Result<Vec<Job>> {
    let sql = format!(
        "SELECT {} FROM jobs WHERE state = 'RUNNING' AND (heartbeat_at IS NULL OR heartbeat_at < ?)",
        COLUMNS
    );
    let rows = sqlx::query(&sql)
        .bind(format_timestamp(cutoff))
        .fetch_all(pool)
        .await?;

    rows.iter().map(row_to_job).collect()
}

/// Plain compare-and-set of the state column, stamping start/finish times
pub async fn update_state(pool: &SqlitePool, identity: &JobIdentity, from: JobState, to: JobState) -> Result<u64> {
    let now = ephys_common::time::timestamp_now();
    let max_wait_ms = super::max_lock_wait_ms(pool).await?;

    retry_on_lock("update_job_state", max_wait_ms, || async {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET
                state = ?,
                started_at = CASE WHEN ? = 'RUNNING' THEN ? ELSE started_at END,
                finished_at = CASE WHEN ? IN ('SUCCEEDED', 'FAILED') THEN ? ELSE finished_at END,
                updated_at = ?
            WHERE identity = ? AND state = ?
            "#,
        )
        .bind(to.as_str())
        .bind(to.as_str())
        .bind(&now)
        .bind(to.as_str())
        .bind(&now)
        .bind(&now)
        .bind(identity.as_str())
        .bind(from.as_str())
        .execute(pool)
        .await?;

        Ok(result.rows_affected())
    })
    .await
}

/// PENDING → RUNNING for `worker_id`, clearing results of earlier attempts
pub async fn claim(pool: &SqlitePool, identity: &JobIdentity, worker_id: &str) -> Result<u64> {
    let now = ephys_common::time::timestamp_now();
    let max_wait_ms = super::max_lock_wait_ms(pool).await?;

    retry_on_lock("claim_job", max_wait_ms, || async {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET
                state = 'RUNNING',
                worker_id = ?,
                started_at = ?,
                heartbeat_at = ?,
                finished_at = NULL,
                output_dir = NULL,
                diagnostic = NULL,
                failure_kind = NULL,
                updated_at = ?
            WHERE identity = ? AND state = 'PENDING'
            "#,
        )
        .bind(worker_id)
        .bind(&now)
        .bind(&now)
        .bind(&now)
        .bind(identity.as_str())
        .execute(pool)
        .await?;

        Ok(result.rows_affected())
    })
    .await
}

/// RUNNING → SUCCEEDED with the validated output location, only for the owning worker
pub async fn complete(pool: &SqlitePool, identity: &JobIdentity, worker_id: &str, output_dir: &Path) -> Result<u64> {
    let now = ephys_common::time::timestamp_now();
    let output_dir = output_dir.to_string_lossy().into_owned();
    let max_wait_ms = super::max_lock_wait_ms(pool).await?;

    retry_on_lock("complete_job", max_wait_ms, || async {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET
                state = 'SUCCEEDED',
                output_dir = ?,
                diagnostic = NULL,
                failure_kind = NULL,
                finished_at = ?,
                updated_at = ?
            WHERE identity = ? AND state = 'RUNNING' AND worker_id = ?
            "#,
        )
        .bind(&output_dir)
        .bind(&now)
        .bind(&now)
        .bind(identity.as_str())
        .bind(worker_id)
        .execute(pool)
        .await?;

        Ok(result.rows_affected())
    })
    .await
}

/// `from` → FAILED with a failure kind and diagnostic
///
/// With `worker_id` set the update only applies while that worker owns the row.
pub async fn fail(
    pool: &SqlitePool,
    identity: &JobIdentity,
    from: JobState,
    worker_id: Option<&str>,
    kind: FailureKind,
    diagnostic: &str,
) -> Result<u64> {
    let now = ephys_common::time::timestamp_now();
    let max_wait_ms = super::max_lock_wait_ms(pool).await?;

    retry_on_lock("fail_job", max_wait_ms, || async {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET
                state = 'FAILED',
                failure_kind = ?,
                diagnostic = ?,
                finished_at = ?,
                updated_at = ?
            WHERE identity = ? AND state = ? AND (? IS NULL OR worker_id = ?)
            "#,
        )
        .bind(kind.as_str())
        .bind(diagnostic)
        .bind(&now)
        .bind(&now)
        .bind(identity.as_str())
        .bind(from.as_str())
        .bind(worker_id)
        .bind(worker_id)
        .execute(pool)
        .await?;

        Ok(result.rows_affected())
    })
    .await
}

/// FAILED → PENDING, bumping the attempt counter and clearing the last run
pub async fn reset(pool: &SqlitePool, identity: &JobIdentity) -> Result<u64> {
    let now = ephys_common::time::timestamp_now();
    let max_wait_ms = super::max_lock_wait_ms(pool).await?;

    retry_on_lock("reset_job", max_wait_ms, || async {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET
                state = 'PENDING',
                attempt = attempt + 1,
                output_dir = NULL,
                diagnostic = NULL,
                failure_kind = NULL,
                cancel_requested = 0,
                worker_id = NULL,
                started_at = NULL,
                finished_at = NULL,
                heartbeat_at = NULL,
                updated_at = ?
            WHERE identity = ? AND state = 'FAILED'
            "#,
        )
        .bind(&now)
        .bind(identity.as_str())
        .execute(pool)
        .await?;

        Ok(result.rows_affected())
    })
    .await
}

/// RUNNING → PENDING for a job whose worker disappeared
pub async fn requeue(pool: &SqlitePool, identity: &JobIdentity, diagnostic: &str) -> Result<u64> {
    let now = ephys_common::time::timestamp_now();
    let max_wait_ms = super::max_lock_wait_ms(pool).await?;

    retry_on_lock("requeue_job", max_wait_ms, || async {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET
                state = 'PENDING',
                diagnostic = ?,
                worker_id = NULL,
                heartbeat_at = NULL,
                updated_at = ?
            WHERE identity = ? AND state = 'RUNNING'
            "#,
        )
        .bind(diagnostic)
        .bind(&now)
        .bind(identity.as_str())
        .execute(pool)
        .await?;

        Ok(result.rows_affected())
    })
    .await
}

/// Flag a RUNNING job for cancellation; the owning trigger polls the flag
pub async fn set_cancel_requested(pool: &SqlitePool, identity: &JobIdentity) -> Result<u64> {
    let now = ephys_common::time::timestamp_now();
    let max_wait_ms = super::max_lock_wait_ms(pool).await?;

    retry_on_lock("request_cancel", max_wait_ms, || async {
        let result = sqlx::query(
            "UPDATE jobs SET cancel_requested = 1, updated_at = ? WHERE identity = ? AND state = 'RUNNING'",
        )
        .bind(&now)
        .bind(identity.as_str())
        .execute(pool)
        .await?;

        Ok(result.rows_affected())
    })
    .await
}

pub async fn cancel_requested(pool: &SqlitePool, identity: &JobIdentity) -> Result<bool> {
    let flag: Option<i64> = sqlx::query_scalar("SELECT cancel_requested FROM jobs WHERE identity = ?")
        .bind(identity.as_str())
        .fetch_optional(pool)
        .await?;

    Ok(flag.unwrap_or(0) != 0)
}

/// Refresh the heartbeat of a RUNNING job owned by `worker_id`
pub async fn touch_heartbeat(pool: &SqlitePool, identity: &JobIdentity, worker_id: &str) -> Result<u64> {
    let now = ephys_common::time::timestamp_now();
    let max_wait_ms = super::max_lock_wait_ms(pool).await?;

    retry_on_lock("heartbeat", max_wait_ms, || async {
        let result = sqlx::query(
            "UPDATE jobs SET heartbeat_at = ? WHERE identity = ? AND state = 'RUNNING' AND worker_id = ?",
        )
        .bind(&now)
        .bind(identity.as_str())
        .bind(worker_id)
        .execute(pool)
        .await?;

        Ok(result.rows_affected())
    })
    .await
}

pub async fn set_working_dir(pool: &SqlitePool, identity: &JobIdentity, working_dir: &Path) -> Result<u64> {
    let now = ephys_common::time::timestamp_now();
    let working_dir = working_dir.to_string_lossy().into_owned();
    let max_wait_ms = super::max_lock_wait_ms(pool).await?;

    retry_on_lock("set_working_dir", max_wait_ms, || async {
        let result = sqlx::query("UPDATE jobs SET working_dir = ?, updated_at = ? WHERE identity = ?")
            .bind(&working_dir)
            .bind(&now)
            .bind(identity.as_str())
            .execute(pool)
            .await?;

        Ok(result.rows_affected())
    })
    .await
}

fn row_to_job(row: &SqliteRow) -> Result<Job> {
    let state: String = row.get("state");
    let state: JobState = state
        .parse()
        .map_err(|_| Error::Internal(format!("Invalid job state in database: {}", state)))?;

    let failure_kind: Option<String> = row.get("failure_kind");
    let failure_kind = failure_kind
        .map(|k| {
            k.parse::<FailureKind>()
                .map_err(|_| Error::Internal(format!("Invalid failure kind in database: {}", k)))
        })
        .transpose()?;

    let attempt: i64 = row.get("attempt");
    let cancel_requested: i64 = row.get("cancel_requested");
    let created_at: String = row.get("created_at");
    let updated_at: String = row.get("updated_at");
    let started_at: Option<String> = row.get("started_at");
    let finished_at: Option<String> = row.get("finished_at");
    let heartbeat_at: Option<String> = row.get("heartbeat_at");
    let working_dir: Option<String> = row.get("working_dir");
    let output_dir: Option<String> = row.get("output_dir");

    Ok(Job {
        identity: JobIdentity(row.get("identity")),
        recording_id: RecordingId(row.get("recording_id")),
        paramset_id: ParameterSetId(row.get("paramset_id")),
        sorter_name: row.get("sorter_name"),
        tool_version: row.get("tool_version"),
        state,
        attempt: attempt.max(1) as u32,
        working_dir: working_dir.map(PathBuf::from),
        output_dir: output_dir.map(PathBuf::from),
        diagnostic: row.get("diagnostic"),
        failure_kind,
        cancel_requested: cancel_requested != 0,
        worker_id: row.get("worker_id"),
        created_at: parse_timestamp(&created_at)?,
        started_at: parse_optional_timestamp(started_at.as_deref())?,
        finished_at: parse_optional_timestamp(finished_at.as_deref())?,
        heartbeat_at: parse_optional_timestamp(heartbeat_at.as_deref())?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}
