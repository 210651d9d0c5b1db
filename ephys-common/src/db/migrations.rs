//! Database schema migrations
//!
//! Versioned, idempotent upgrades for databases created by older builds.
//! Fresh databases are created with the current schema by `init.rs`; each
//! migration therefore checks before it alters anything.
//!
//! # Migration Guidelines
//!
//! 1. Never modify an existing migration, add a new one
//! 2. Prefer `ALTER TABLE .. ADD COLUMN` over DROP/CREATE
//! 3. Bump `CURRENT_SCHEMA_VERSION` together with the new migration

use crate::Result;
use sqlx::SqlitePool;
use tracing::{info, warn};

/// Current schema version
///
/// **IMPORTANT:** Increment this when adding new migrations
const CURRENT_SCHEMA_VERSION: i32 = 2;

/// Get current schema version from database
///
/// Returns 0 if schema_version table doesn't exist or has no rows
async fn get_schema_version(pool: &SqlitePool) -> Result<i32> {
    let table_exists: bool = sqlx::query_scalar(
        r#"
        SELECT EXISTS(
            SELECT 1 FROM sqlite_master
            WHERE type='table' AND name='schema_version'
        )
        "#,
    )
    .fetch_one(pool)
    .await?;

    if !table_exists {
        return Ok(0);
    }

    let version: Option<i32> =
        sqlx::query_scalar("SELECT version FROM schema_version ORDER BY version DESC LIMIT 1")
            .fetch_optional(pool)
            .await?;

    Ok(version.unwrap_or(0))
}

/// Set schema version in database
async fn set_schema_version(pool: &SqlitePool, version: i32) -> Result<()> {
    sqlx::query("INSERT OR IGNORE INTO schema_version (version) VALUES (?)")
        .bind(version)
        .execute(pool)
        .await?;

    Ok(())
}

/// Run all pending migrations
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    let current_version = get_schema_version(pool).await?;

    if current_version == CURRENT_SCHEMA_VERSION {
        info!("Database schema is up to date (v{})", current_version);
        return Ok(());
    }

    if current_version > CURRENT_SCHEMA_VERSION {
        warn!(
            "Database schema version ({}) is newer than code version ({})",
            current_version, CURRENT_SCHEMA_VERSION
        );
        return Ok(());
    }

    info!(
        "Running database migrations: v{} -> v{}",
        current_version, CURRENT_SCHEMA_VERSION
    );

    if current_version < 1 {
        migrate_v1(pool).await?;
        set_schema_version(pool, 1).await?;
        info!("Migration v1 completed");
    }

    if current_version < 2 {
        migrate_v2(pool).await?;
        set_schema_version(pool, 2).await?;
        info!("Migration v2 completed");
    }

    Ok(())
}

async fn table_exists(pool: &SqlitePool, table: &str) -> Result<bool> {
    let exists: bool = sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name=?)",
    )
    .bind(table)
    .fetch_one(pool)
    .await?;
    Ok(exists)
}

async fn has_column(pool: &SqlitePool, table: &str, column: &str) -> Result<bool> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM pragma_table_info(?) WHERE name = ?")
            .bind(table)
            .bind(column)
            .fetch_one(pool)
            .await?;
    Ok(count > 0)
}

/// Add a column if missing, tolerating a concurrent initializer adding it first
async fn add_column_if_missing(pool: &SqlitePool, table: &str, column: &str, decl: &str) -> Result<()> {
    if !table_exists(pool, table).await? {
        info!("  {} table doesn't exist yet - skipping", table);
        return Ok(());
    }

    if has_column(pool, table, column).await? {
        info!("  {}.{} already exists - skipping", table, column);
        return Ok(());
    }

    let sql = format!("ALTER TABLE {} ADD COLUMN {} {}", table, column, decl);
    match sqlx::query(&sql).execute(pool).await {
        Ok(_) => {
            info!("  Added {}.{}", table, column);
            Ok(())
        }
        Err(sqlx::Error::Database(db_err)) if db_err.message().contains("duplicate column") => {
            info!("  {}.{} added by concurrent initializer - skipping", table, column);
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Migration v1: record why a job failed separately from the diagnostic text
async fn migrate_v1(pool: &SqlitePool) -> Result<()> {
    info!("Running migration v1: Add failure_kind column to jobs");
    add_column_if_missing(pool, "jobs", "failure_kind", "TEXT").await
}

/// Migration v2: worker heartbeats, used to requeue jobs orphaned by a crash
async fn migrate_v2(pool: &SqlitePool) -> Result<()> {
    info!("Running migration v2: Add heartbeat_at column to jobs");
    add_column_if_missing(pool, "jobs", "heartbeat_at", "TEXT").await
}
