//! Error types for ephys-sort
//!
//! Identity and validation errors (`DuplicateNameConflict`,
//! `UnresolvedDependency`, `SchemaMismatch`, ...) are returned synchronously
//! and never retried. Execution errors are additionally recorded on the job
//! row as a `FailureKind` plus diagnostic text.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Orchestration error type
#[derive(Debug, Error)]
pub enum SortError {
    /// A parameter set or recording name is already bound to different content
    #[error("Name '{name}' is already registered with different content")]
    DuplicateNameConflict { name: String },

    /// Identical content is already registered under another name
    #[error("Identical content is already registered as '{existing}'")]
    DuplicateContentConflict { existing: String },

    /// Referenced recording, parameter set or sorter does not exist
    #[error("Unresolved dependency: {0}")]
    UnresolvedDependency(String),

    /// Compare-and-set on job state lost
    #[error("Invalid transition for job {identity}: expected {expected}, found {actual}")]
    InvalidTransition {
        identity: String,
        expected: String,
        actual: String,
    },

    /// Sorter output does not match the declared output contract
    #[error("Schema mismatch in {artifact}: {detail}")]
    SchemaMismatch { artifact: String, detail: String },

    /// The sorter could not be started
    #[error("Tool launch failure: {0}")]
    ToolLaunchFailure(String),

    /// The sorter ran but did not produce a valid result
    #[error("Tool runtime failure: {0}")]
    ToolRuntimeFailure(String),

    /// Filesystem operation still failing after bounded retries
    #[error("Transient I/O failure after {attempts} attempts: {source}")]
    TransientIOFailure {
        attempts: u32,
        #[source]
        source: std::io::Error,
    },

    /// Job was cancelled while pending or running
    #[error("Cancellation requested")]
    CancellationRequested,

    /// Requested resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Results requested for a job that has not succeeded
    #[error("Job {0} has not succeeded")]
    NotSucceeded(String),

    /// ephys-common error (database, config, ...)
    #[error("Common error: {0}")]
    Common(#[from] ephys_common::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<sqlx::Error> for SortError {
    fn from(err: sqlx::Error) -> Self {
        SortError::Common(ephys_common::Error::Database(err))
    }
}

impl SortError {
    pub fn schema(artifact: impl Into<String>, detail: impl Into<String>) -> Self {
        SortError::SchemaMismatch {
            artifact: artifact.into(),
            detail: detail.into(),
        }
    }

    /// Failure classification recorded on the job row, for execution errors only
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            SortError::ToolLaunchFailure(_) => Some(FailureKind::ToolLaunch),
            SortError::ToolRuntimeFailure(_) | SortError::SchemaMismatch { .. } => {
                Some(FailureKind::ToolRuntime)
            }
            SortError::TransientIOFailure { .. } => Some(FailureKind::TransientIo),
            SortError::CancellationRequested => Some(FailureKind::Cancelled),
            _ => None,
        }
    }
}

/// Result type for orchestration operations
pub type Result<T> = std::result::Result<T, SortError>;

/// Why a job ended up FAILED
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    ToolLaunch,
    ToolRuntime,
    TransientIo,
    Cancelled,
    /// Orchestrator stopped while the job was running and a cancel was pending
    Interrupted,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::ToolLaunch => "tool_launch",
            FailureKind::ToolRuntime => "tool_runtime",
            FailureKind::TransientIo => "transient_io",
            FailureKind::Cancelled => "cancelled",
            FailureKind::Interrupted => "interrupted",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureKind {
    type Err = SortError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "tool_launch" => Ok(FailureKind::ToolLaunch),
            "tool_runtime" => Ok(FailureKind::ToolRuntime),
            "transient_io" => Ok(FailureKind::TransientIo),
            "cancelled" => Ok(FailureKind::Cancelled),
            "interrupted" => Ok(FailureKind::Interrupted),
            other => Err(SortError::Common(ephys_common::Error::Internal(format!(
                "Unknown failure kind: {}",
                other
            )))),
        }
    }
}
