//! Configuration for ephys-sort
//!
//! `ephys-sort.toml`:
//!
//! ```toml
//! root_folder = "/data/ephys"
//!
//! [logging]
//! level = "info"
//!
//! [pipeline]
//! max_concurrent_jobs = 4
//!
//! [[sorter]]
//! name = "kilosort2.5"
//! version = "2.5.2"
//! program = "/opt/sorters/run_kilosort.sh"
//! args = ["{recording_file}", "{params_file}", "{output_dir}"]
//! ```
//!
//! Root folder priority: `--root-folder` → `EPHYS_ROOT_FOLDER` → `root_folder`
//! key → OS default. Everything else comes from the TOML file or compiled
//! defaults.

use ephys_common::config::{LoggingConfig, RootFolderResolver};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::services::name_adapter::AdapterConfig;
use crate::services::quality_metrics::MetricParams;
use crate::services::sorter_catalog::SorterTool;
use crate::utils::IoRetryPolicy;

pub const APP_NAME: &str = "ephys-sort";

/// Top-level config file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SortConfig {
    pub root_folder: Option<PathBuf>,
    pub logging: LoggingConfig,
    pub pipeline: PipelineSettings,
    pub metrics: MetricParams,
    pub sorter: Vec<SorterTool>,
    pub adapter: Vec<AdapterConfig>,
}

impl SortConfig {
    /// Load from `path`, falling back to defaults when the file is missing
    pub fn load(path: &Path) -> ephys_common::Result<Self> {
        ephys_common::config::load_toml_config(path)
    }

    /// Root folder following the documented priority order
    pub fn resolve_root(&self, cli_arg: Option<&Path>) -> PathBuf {
        RootFolderResolver::new(APP_NAME).resolve(cli_arg, self.root_folder.as_deref())
    }
}

/// `[pipeline]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Upper bound on sorter processes running at once
    pub max_concurrent_jobs: usize,
    /// Work root for per-job directories; `<root>/work` when unset
    pub work_dir: Option<PathBuf>,
    /// Database file name inside the root folder
    pub database_file: String,
    pub heartbeat_interval_ms: u64,
    /// RUNNING jobs without a heartbeat for this long are requeued at startup
    pub stale_after_s: u64,
    pub io_retry_attempts: u32,
    pub io_retry_initial_ms: u64,
    /// Lines of sorter log kept in a failure diagnostic
    pub log_tail_lines: usize,
    /// Wall-clock limit for sorters that declare none
    pub default_timeout_secs: Option<u64>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 4,
            work_dir: None,
            database_file: "ephys-sort.db".to_string(),
            heartbeat_interval_ms: 5000,
            stale_after_s: 300,
            io_retry_attempts: 5,
            io_retry_initial_ms: 50,
            log_tail_lines: 40,
            default_timeout_secs: None,
        }
    }
}

impl PipelineSettings {
    pub fn database_path(&self, root: &Path) -> PathBuf {
        root.join(&self.database_file)
    }

    pub fn work_root(&self, root: &Path) -> PathBuf {
        self.work_dir.clone().unwrap_or_else(|| root.join("work"))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(10))
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_s)
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout_secs.map(Duration::from_secs)
    }

    pub fn io_retry(&self) -> IoRetryPolicy {
        IoRetryPolicy {
            max_attempts: self.io_retry_attempts.max(1),
            initial_backoff: Duration::from_millis(self.io_retry_initial_ms),
        }
    }
}
