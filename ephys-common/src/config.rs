//! Configuration loading and root folder resolution
//!
//! Root folder priority order:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable
//! 3. TOML config file (`root_folder` key)
//! 4. OS-dependent compiled default (fallback)
//!
//! A missing or unreadable TOML file never aborts startup: a warning is logged
//! and compiled defaults are used instead.

use crate::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Environment variable consulted for the root folder
pub const ROOT_FOLDER_ENV: &str = "EPHYS_ROOT_FOLDER";

/// Logging section shared by every config file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when RUST_LOG is not set (e.g. "info", "ephys_sort=debug")
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Resolves the root folder holding the database and sorter working directories
#[derive(Debug, Clone)]
pub struct RootFolderResolver {
    app_name: String,
    env_var: String,
}

impl RootFolderResolver {
    pub fn new(app_name: &str) -> Self {
        Self {
            app_name: app_name.to_string(),
            env_var: ROOT_FOLDER_ENV.to_string(),
        }
    }

    /// Override the environment variable name (tests use a private name)
    pub fn with_env_var(mut self, env_var: &str) -> Self {
        self.env_var = env_var.to_string();
        self
    }

    /// Resolve following the documented priority order
    pub fn resolve(&self, cli_arg: Option<&Path>, toml_root: Option<&Path>) -> PathBuf {
        if let Some(path) = cli_arg {
            info!(root_folder = %path.display(), "Root folder from command line");
            return path.to_path_buf();
        }

        if let Ok(path) = std::env::var(&self.env_var) {
            if !path.trim().is_empty() {
                info!(root_folder = %path, env = %self.env_var, "Root folder from environment");
                return PathBuf::from(path);
            }
        }

        if let Some(path) = toml_root {
            info!(root_folder = %path.display(), "Root folder from config file");
            return path.to_path_buf();
        }

        let fallback = default_root_folder(&self.app_name);
        info!(root_folder = %fallback.display(), "Root folder from compiled default");
        fallback
    }
}

/// Create the root folder if missing
pub fn ensure_directory(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path).map_err(|e| {
        Error::Config(format!("Failed to create directory {}: {}", path.display(), e))
    })
}

/// OS-dependent default root folder
pub fn default_root_folder(app_name: &str) -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join(app_name))
        .unwrap_or_else(|| PathBuf::from(format!("./{}_data", app_name)))
}

/// Default config file location: `<config_dir>/ephys/<app_name>.toml`
pub fn default_config_path(app_name: &str) -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("ephys").join(format!("{}.toml", app_name)))
}

/// Read and parse a TOML config file
///
/// Missing file: warning + `T::default()`. Present but malformed: error, since
/// silently ignoring a broken config would run with unexpected settings.
pub fn load_toml_config<T>(path: &Path) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    if !path.exists() {
        warn!(path = %path.display(), "Config file not found, using defaults");
        return Ok(T::default());
    }

    let content = std::fs::read_to_string(path)?;
    let config = toml::from_str::<T>(&content)
        .map_err(|e| Error::Config(format!("Failed to parse {}: {}", path.display(), e)))?;

    info!(path = %path.display(), "Loaded config file");
    Ok(config)
}

/// Serialize a config to TOML, writing via a temp file + rename
pub fn write_toml_config<T: Serialize>(config: &T, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)
        .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let tmp = path.with_extension("toml.tmp");
    std::fs::write(&tmp, content)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
    struct Sample {
        root_folder: Option<PathBuf>,
        #[serde(default)]
        logging: LoggingConfig,
    }

    #[test]
    #[serial]
    fn test_cli_argument_wins() {
        std::env::set_var("EPHYS_TEST_ROOT_A", "/from/env");
        let resolver = RootFolderResolver::new("ephys-test").with_env_var("EPHYS_TEST_ROOT_A");
        let resolved = resolver.resolve(Some(Path::new("/from/cli")), Some(Path::new("/from/toml")));
        assert_eq!(resolved, PathBuf::from("/from/cli"));
        std::env::remove_var("EPHYS_TEST_ROOT_A");
    }

    #[test]
    #[serial]
    fn test_env_beats_toml() {
        std::env::set_var("EPHYS_TEST_ROOT_B", "/from/env");
        let resolver = RootFolderResolver::new("ephys-test").with_env_var("EPHYS_TEST_ROOT_B");
        let resolved = resolver.resolve(None, Some(Path::new("/from/toml")));
        assert_eq!(resolved, PathBuf::from("/from/env"));
        std::env::remove_var("EPHYS_TEST_ROOT_B");
    }

    #[test]
    #[serial]
    fn test_falls_back_to_default() {
        std::env::remove_var("EPHYS_TEST_ROOT_C");
        let resolver = RootFolderResolver::new("ephys-test").with_env_var("EPHYS_TEST_ROOT_C");
        let resolved = resolver.resolve(None, None);
        assert!(resolved.to_string_lossy().contains("ephys-test"));
    }

    #[test]
    fn test_missing_config_file_yields_default() {
        let dir = TempDir::new().unwrap();
        let loaded: Sample = load_toml_config(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(loaded, Sample::default());
        assert_eq!(loaded.logging.level, "info");
    }

    #[test]
    fn test_malformed_config_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.toml");
        std::fs::write(&path, "root_folder = [not toml").unwrap();
        let result: Result<Sample> = load_toml_config(&path);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_write_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let sample = Sample {
            root_folder: Some(PathBuf::from("/data/ephys")),
            logging: LoggingConfig {
                level: "debug".to_string(),
            },
        };
        write_toml_config(&sample, &path).unwrap();
        let loaded: Sample = load_toml_config(&path).unwrap();
        assert_eq!(loaded, sample);
    }
}
