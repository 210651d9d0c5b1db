//! Per-job working directory
//!
//! ```text
//! <work_root>/<recording>/<method>_<paramset>/<identity[0..16]>/
//!     job.json            manifest: full identity, attempt
//!     input/recording.json
//!     input/params.json
//!     scratch/            tool scratch space, removed when the job ends
//!     output/             tool output set
//!     output/.complete    written once the tool exited cleanly
//!     logs/sorter.log     captured stdout + stderr
//! ```

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::models::{JobIdentity, ParameterSet, Recording};
use crate::services::sorter_catalog::SorterTool;
use crate::utils::{retry_transient_io, IoRetryPolicy};

pub const MANIFEST_FILE: &str = "job.json";
pub const COMPLETE_MARKER: &str = ".complete";

/// Contents of `job.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub identity: JobIdentity,
    pub attempt: u32,
    pub sorter: String,
    pub tool_version: String,
    pub recording: String,
    pub paramset: String,
    pub created_at: String,
}

/// What a previous attempt left behind
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkDirState {
    /// Nothing on disk
    Fresh,
    /// Directory exists but belongs to another identity (or has no readable manifest)
    Foreign { found: Option<JobIdentity> },
    /// Same identity, but the tool did not finish cleanly
    Partial,
    /// Same identity, tool exited cleanly and every expected output is
    /// present (still needs validation)
    Complete,
}

/// Replace characters that are awkward in directory names
fn path_component(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    match cleaned.trim_matches('.') {
        "" => "_".to_string(),
        trimmed => trimmed.to_string(),
    }
}

#[derive(Debug, Clone)]
pub struct WorkDir {
    root: PathBuf,
}

impl WorkDir {
    pub fn for_job(
        work_root: &Path,
        recording: &Recording,
        paramset: &ParameterSet,
        tool: &SorterTool,
        identity: &JobIdentity,
    ) -> Self {
        let method_dir = format!(
            "{}_{}",
            path_component(&tool.method_label()),
            path_component(&paramset.name)
        );
        Self {
            root: work_root
                .join(path_component(recording.name()))
                .join(method_dir)
                .join(identity.short()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }

    pub fn input_dir(&self) -> PathBuf {
        self.root.join("input")
    }

    pub fn recording_file(&self) -> PathBuf {
        self.input_dir().join("recording.json")
    }

    pub fn params_file(&self) -> PathBuf {
        self.input_dir().join("params.json")
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.root.join("scratch")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.root.join("output")
    }

    pub fn complete_marker(&self) -> PathBuf {
        self.output_dir().join(COMPLETE_MARKER)
    }

    pub fn log_file(&self) -> PathBuf {
        self.root.join("logs").join("sorter.log")
    }

    pub async fn read_manifest(&self) -> Option<Manifest> {
        let content = tokio::fs::read_to_string(self.manifest_path()).await.ok()?;
        serde_json::from_str(&content).ok()
    }

    /// Classify whatever a previous attempt left on disk
    pub async fn inspect(&self, identity: &JobIdentity, expected_outputs: &[String]) -> WorkDirState {
        if tokio::fs::metadata(&self.root).await.is_err() {
            return WorkDirState::Fresh;
        }

        match self.read_manifest().await {
            Some(manifest) if &manifest.identity == identity => {
                if tokio::fs::metadata(self.complete_marker()).await.is_err() {
                    return WorkDirState::Partial;
                }
                let output_dir = self.output_dir();
                for file in expected_outputs {
                    if tokio::fs::metadata(output_dir.join(file)).await.is_err() {
                        return WorkDirState::Partial;
                    }
                }
                WorkDirState::Complete
            }
            Some(manifest) => WorkDirState::Foreign {
                found: Some(manifest.identity),
            },
            None => WorkDirState::Foreign { found: None },
        }
    }

    /// Remove everything from a previous attempt
    pub async fn discard(&self, policy: IoRetryPolicy) -> Result<()> {
        let root = self.root.clone();
        retry_transient_io(policy, "discard_workdir", || {
            let root = root.clone();
            async move {
                match tokio::fs::remove_dir_all(&root).await {
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                    other => other,
                }
            }
        })
        .await
    }

    /// Create the layout and write manifest and inputs
    pub async fn prepare(
        &self,
        policy: IoRetryPolicy,
        manifest: &Manifest,
        recording: &Recording,
        paramset: &ParameterSet,
    ) -> Result<()> {
        let dirs = [
            self.input_dir(),
            self.scratch_dir(),
            self.output_dir(),
            self.root.join("logs"),
        ];
        retry_transient_io(policy, "create_workdir", || {
            let dirs = dirs.clone();
            async move {
                for dir in &dirs {
                    tokio::fs::create_dir_all(dir).await?;
                }
                Ok(())
            }
        })
        .await?;

        let params = json!({
            "sorter": paramset.sorter_name,
            "paramset": paramset.name,
            "fingerprint": paramset.fingerprint,
            "options": paramset.options,
        });

        let files = [
            (self.recording_file(), serde_json::to_vec_pretty(&recording.spec)?),
            (self.params_file(), serde_json::to_vec_pretty(&params)?),
            // Manifest last: its presence marks a fully prepared directory
            (self.manifest_path(), serde_json::to_vec_pretty(manifest)?),
        ];
        for (path, bytes) in files {
            write_atomic(policy, path, bytes).await?;
        }
        Ok(())
    }

    /// Record that the tool exited cleanly with its expected outputs
    pub async fn mark_output_complete(&self, policy: IoRetryPolicy) -> Result<()> {
        let stamp = ephys_common::time::timestamp_now().into_bytes();
        write_atomic(policy, self.complete_marker(), stamp).await
    }

    /// Remove the output set of a failed attempt; logs stay
    pub async fn discard_output(&self, policy: IoRetryPolicy) -> Result<()> {
        let output = self.output_dir();
        retry_transient_io(policy, "discard_output", || {
            let output = output.clone();
            async move {
                match tokio::fs::remove_dir_all(&output).await {
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                    other => other,
                }
            }
        })
        .await
    }

    /// Remove tool scratch space
    pub async fn release_scratch(&self, policy: IoRetryPolicy) -> Result<()> {
        let scratch = self.scratch_dir();
        retry_transient_io(policy, "release_scratch", || {
            let scratch = scratch.clone();
            async move {
                match tokio::fs::remove_dir_all(&scratch).await {
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                    other => other,
                }
            }
        })
        .await
    }
}

/// Write via temp file + rename so readers never see a torn file
async fn write_atomic(policy: IoRetryPolicy, path: PathBuf, bytes: Vec<u8>) -> Result<()> {
    let tmp = path.with_extension("tmp");
    retry_transient_io(policy, "write_input", || {
        let (path, tmp, bytes) = (path.clone(), tmp.clone(), bytes.clone());
        async move {
            tokio::fs::write(&tmp, &bytes).await?;
            tokio::fs::rename(&tmp, &path).await
        }
    })
    .await
}
