//! Job lifecycle record
//!
//! PENDING → RUNNING → {SUCCEEDED, FAILED}
//!
//! Besides the forward path, the store allows three recovery edges:
//! FAILED → PENDING (explicit reset), RUNNING → PENDING (stale requeue) and
//! PENDING → FAILED (cancel before start).

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use super::{JobIdentity, ParameterSetId, RecordingId};
use crate::error::{FailureKind, SortError};

/// Job lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobState {
    /// Registered, not yet claimed by a worker
    Pending,
    /// Claimed; the external tool may be running
    Running,
    /// Output validated and recorded
    Succeeded,
    /// Terminal until explicit reset
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "PENDING",
            JobState::Running => "RUNNING",
            JobState::Succeeded => "SUCCEEDED",
            JobState::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed)
    }

    /// Whether the store accepts a move from `self` to `to`
    pub fn can_transition_to(&self, to: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, to),
            (Pending, Running)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Pending, Failed)
                | (Failed, Pending)
                | (Running, Pending)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = SortError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(JobState::Pending),
            "RUNNING" => Ok(JobState::Running),
            "SUCCEEDED" => Ok(JobState::Succeeded),
            "FAILED" => Ok(JobState::Failed),
            other => Err(SortError::Common(ephys_common::Error::InvalidInput(format!(
                "Unknown job state: {}",
                other
            )))),
        }
    }
}

/// Persisted job row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub identity: JobIdentity,
    pub recording_id: RecordingId,
    pub paramset_id: ParameterSetId,
    pub sorter_name: String,
    pub tool_version: String,
    pub state: JobState,
    /// Starts at 1, incremented by every reset
    pub attempt: u32,
    pub working_dir: Option<PathBuf>,
    /// Validated output set, set only on success
    pub output_dir: Option<PathBuf>,
    pub diagnostic: Option<String>,
    pub failure_kind: Option<FailureKind>,
    pub cancel_requested: bool,
    pub worker_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Wall-clock time of the last run, once it has finished
    pub fn execution_duration(&self) -> Option<Duration> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) if end >= start => Some(end - start),
            _ => None,
        }
    }
}
