//! External sorter process

use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::{Child, Command};

use crate::error::{Result, SortError};

/// Everything needed to start the sorter
#[derive(Debug, Clone)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub current_dir: PathBuf,
    pub log_file: PathBuf,
}

/// Start the sorter with stdout and stderr appended to the log file
///
/// The child is killed if its handle is dropped, so an aborted trigger never
/// leaves an orphaned sorter behind.
pub fn spawn(invocation: &Invocation) -> Result<Child> {
    let log = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&invocation.log_file)
        .map_err(|e| {
            SortError::ToolLaunchFailure(format!(
                "cannot open log file {}: {}",
                invocation.log_file.display(),
                e
            ))
        })?;
    let log_err = log
        .try_clone()
        .map_err(|e| SortError::ToolLaunchFailure(format!("cannot share log file handle: {}", e)))?;

    Command::new(&invocation.program)
        .args(&invocation.args)
        .envs(invocation.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .current_dir(&invocation.current_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err))
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| SortError::ToolLaunchFailure(format!("failed to start '{}': {}", invocation.program, e)))
}

/// Last `lines` lines of the sorter log, empty when unreadable
pub async fn log_tail(path: &Path, lines: usize) -> String {
    let content = match tokio::fs::read(path).await {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(_) => return String::new(),
    };
    let all: Vec<&str> = content.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}
