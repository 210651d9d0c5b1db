//! Database initialization
//!
//! Creates the SQLite database on first run and brings the schema up to date:
//! 1. `CREATE TABLE IF NOT EXISTS` for every table
//! 2. Versioned migrations for older databases
//! 3. Default settings
//!
//! The job store is shared by every orchestrator worker (and every orchestrator
//! process pointed at the same root folder), so each pooled connection runs in
//! WAL mode with a busy timeout and foreign keys enabled.

use crate::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Busy timeout applied to every connection before settings are readable
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5000;

/// Initialize database connection and create tables if needed
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS))
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(16)
        .min_connections(1)
        .connect_with(options)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    create_schema(&pool).await?;

    // Manual migrations run after CREATE TABLE so fresh databases skip them cheaply
    crate::db::migrations::run_migrations(&pool).await?;

    init_default_settings(&pool).await?;

    Ok(pool)
}

/// Create every table (idempotent)
pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    create_schema_version_table(pool).await?;
    create_settings_table(pool).await?;
    create_recordings_table(pool).await?;
    create_parameter_sets_table(pool).await?;
    create_jobs_table(pool).await?;
    Ok(())
}

async fn create_schema_version_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the settings table
///
/// Stores application configuration key-value pairs.
pub async fn create_settings_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Recordings: immutable references to raw acquisition sessions
///
/// `id` is the content digest of the acquisition metadata; `spec` holds the
/// full JSON description (probe geometry, sampling rate, ...).
async fn create_recordings_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS recordings (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            source_path TEXT NOT NULL,
            spec TEXT NOT NULL,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Parameter sets: named sorter configurations, unique by name and by fingerprint
async fn create_parameter_sets_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS parameter_sets (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            sorter_name TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            options TEXT NOT NULL,
            fingerprint TEXT NOT NULL UNIQUE,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Jobs: one lifecycle row per job identity
async fn create_jobs_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            identity TEXT PRIMARY KEY,
            recording_id TEXT NOT NULL REFERENCES recordings(id),
            paramset_id INTEGER NOT NULL REFERENCES parameter_sets(id),
            sorter_name TEXT NOT NULL,
            tool_version TEXT NOT NULL,
            state TEXT NOT NULL DEFAULT 'PENDING'
                CHECK (state IN ('PENDING', 'RUNNING', 'SUCCEEDED', 'FAILED')),
            attempt INTEGER NOT NULL DEFAULT 1,
            working_dir TEXT,
            output_dir TEXT,
            diagnostic TEXT,
            failure_kind TEXT,
            cancel_requested INTEGER NOT NULL DEFAULT 0,
            worker_id TEXT,
            created_at TEXT NOT NULL,
            started_at TEXT,
            finished_at TEXT,
            heartbeat_at TEXT,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_state ON jobs(state)")
        .execute(pool)
        .await?;

    Ok(())
}

/// Initialize default settings (existing values are never overwritten)
async fn init_default_settings(pool: &SqlitePool) -> Result<()> {
    crate::db::settings::ensure_setting(pool, "db_max_lock_wait_ms", "5000").await?;
    Ok(())
}
