//! Database operations
//!
//! Free functions over a `SqlitePool`, one module per table. Writes go
//! through [`crate::utils::retry_on_lock`]; semantic checks (conflicts,
//! state machine) live in `services`.

pub mod jobs;
pub mod parameter_sets;
pub mod recordings;

use ephys_common::Result;
use sqlx::SqlitePool;

/// Setting key bounding lock-contention retries
pub const MAX_LOCK_WAIT_SETTING: &str = "db_max_lock_wait_ms";

const DEFAULT_MAX_LOCK_WAIT_MS: u64 = 5000;

/// Maximum time a write keeps retrying while the database is locked
pub async fn max_lock_wait_ms(pool: &SqlitePool) -> Result<u64> {
    ephys_common::db::get_setting_u64(pool, MAX_LOCK_WAIT_SETTING, DEFAULT_MAX_LOCK_WAIT_MS).await
}
