//! Sorter trigger
//!
//! Runs the external sorter for a job this worker has claimed (RUNNING):
//! create working directory → write inputs → run tool → validate outputs →
//! record SUCCEEDED (or FAILED with diagnostics) → release scratch.
//!
//! Re-entry is idempotent. A working directory left by an interrupted attempt
//! of the same identity is accepted without running the tool again only when
//! that attempt's tool exited cleanly (`output/.complete`) and the output set
//! validates; anything else is discarded first. A failed attempt's output is
//! removed when the failure is recorded, so a reset job always reruns.
//!
//! Every commit is conditional on this worker still owning the job. A worker
//! that was declared stale and replaced gets `Skipped` and touches nothing.
//!
//! Failure classes:
//! - launch failures and exhausted I/O retries: job FAILED, error returned
//! - runtime failures, timeouts and cancellation: job FAILED, `Ok(Failed)`

pub mod process;
pub mod workdir;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{FailureKind, Result, SortError};
use crate::models::{Job, JobIdentity, JobState, ParameterSet, Recording};
use crate::services::job_store::JobStore;
use crate::services::result_ingestor::{parse_output_blocking, ResultIngestor};
use crate::services::sorter_catalog::{InvocationPaths, SorterTool};
use crate::utils::IoRetryPolicy;

use process::Invocation;
use workdir::{Manifest, WorkDir, WorkDirState};

/// Environment variables exported to every sorter process
pub const ENV_INPUT_DIR: &str = "SORTER_INPUT_DIR";
pub const ENV_OUTPUT_DIR: &str = "SORTER_OUTPUT_DIR";
pub const ENV_SCRATCH_DIR: &str = "SORTER_SCRATCH_DIR";

#[derive(Debug, Clone)]
pub struct TriggerSettings {
    pub work_root: PathBuf,
    pub worker_id: String,
    pub heartbeat_interval: Duration,
    /// Used when the sorter declares no timeout of its own
    pub default_timeout: Option<Duration>,
    pub io_retry: IoRetryPolicy,
    pub log_tail_lines: usize,
}

/// How a trigger call ended
#[derive(Debug, Clone)]
pub enum TriggerOutcome {
    Succeeded {
        job: Job,
        /// Output of an interrupted attempt was accepted without re-running
        resumed: bool,
    },
    /// Runtime failure, timeout or cancellation; recorded on the job
    Failed { job: Job },
    /// The job was not RUNNING under this worker; nothing was done
    Skipped { job: Job },
}

impl TriggerOutcome {
    pub fn job(&self) -> &Job {
        match self {
            TriggerOutcome::Succeeded { job, .. }
            | TriggerOutcome::Failed { job }
            | TriggerOutcome::Skipped { job } => job,
        }
    }
}

enum ProcessEnd {
    Exited(std::process::ExitStatus),
    Cancelled,
    TimedOut(Duration),
    /// Another orchestrator took the job over
    LostOwnership,
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}

#[derive(Clone)]
pub struct SorterTrigger {
    store: JobStore,
    ingestor: ResultIngestor,
    settings: Arc<TriggerSettings>,
}

impl SorterTrigger {
    pub fn new(store: JobStore, ingestor: ResultIngestor, settings: TriggerSettings) -> Self {
        Self {
            store,
            ingestor,
            settings: Arc::new(settings),
        }
    }

    pub fn settings(&self) -> &TriggerSettings {
        &self.settings
    }

    /// Run (or resume) a claimed job
    pub async fn run(
        &self,
        identity: &JobIdentity,
        recording: &Recording,
        paramset: &ParameterSet,
        tool: &SorterTool,
        cancel: &CancellationToken,
    ) -> Result<TriggerOutcome> {
        let job = self.store.get(identity).await?;
        if job.state != JobState::Running || job.worker_id.as_deref() != Some(self.settings.worker_id.as_str()) {
            debug!(identity = %identity, state = %job.state, "Trigger entry on job not owned here, skipping");
            return Ok(TriggerOutcome::Skipped { job });
        }

        let workdir = WorkDir::for_job(&self.settings.work_root, recording, paramset, tool, identity);

        match self.execute(&job, &workdir, recording, paramset, tool, cancel).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                // Store errors leave the row RUNNING; stale recovery picks it up
                let Some(kind) = err.failure_kind() else {
                    return Err(err);
                };
                let job = match self.record_failure(&job, &workdir, kind, &err.to_string()).await {
                    Ok(job) => job,
                    Err(SortError::InvalidTransition { .. }) => return self.lost_ownership(identity).await,
                    Err(e) => return Err(e),
                };
                match kind {
                    FailureKind::ToolLaunch | FailureKind::TransientIo => Err(err),
                    _ => Ok(TriggerOutcome::Failed { job }),
                }
            }
        }
    }

    async fn execute(
        &self,
        job: &Job,
        workdir: &WorkDir,
        recording: &Recording,
        paramset: &ParameterSet,
        tool: &SorterTool,
        cancel: &CancellationToken,
    ) -> Result<TriggerOutcome> {
        let identity = &job.identity;
        let policy = self.settings.io_retry;
        let adapter = self
            .ingestor
            .adapter_for(&tool.name)
            .map_err(|e| SortError::ToolLaunchFailure(e.to_string()))?;

        self.store.set_working_dir(identity, workdir.root()).await?;

        match workdir.inspect(identity, &tool.expected_outputs).await {
            WorkDirState::Fresh => {}
            WorkDirState::Complete => {
                match parse_output_blocking(identity, &workdir.output_dir(), recording, adapter).await {
                    Ok(result) => {
                        info!(identity = %identity, units = result.units.len(), "Resuming from complete output of earlier attempt");
                        return self.commit_success(identity, workdir, true).await;
                    }
                    Err(e) => {
                        warn!(identity = %identity, error = %e, "Earlier output is invalid, discarding");
                        workdir.discard(policy).await?;
                    }
                }
            }
            WorkDirState::Partial => {
                info!(identity = %identity, "Discarding partial output of earlier attempt");
                workdir.discard(policy).await?;
            }
            WorkDirState::Foreign { found } => {
                warn!(
                    identity = %identity,
                    found = found.as_ref().map(|f| f.as_str()).unwrap_or("none"),
                    dir = %workdir.root().display(),
                    "Working directory belongs to another job, discarding"
                );
                workdir.discard(policy).await?;
            }
        }

        let missing: Vec<&str> = tool
            .required_options
            .iter()
            .filter(|key| !paramset.options.contains_key(key.as_str()))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(SortError::ToolLaunchFailure(format!(
                "parameter set '{}' lacks required option(s): {}",
                paramset.name,
                missing.join(", ")
            )));
        }

        if cancel.is_cancelled() || self.store.is_cancel_requested(identity).await? {
            return Err(SortError::CancellationRequested);
        }

        let manifest = Manifest {
            identity: identity.clone(),
            attempt: job.attempt,
            sorter: tool.name.clone(),
            tool_version: tool.version.clone(),
            recording: recording.name().to_string(),
            paramset: paramset.name.clone(),
            created_at: ephys_common::time::timestamp_now(),
        };
        workdir.prepare(policy, &manifest, recording, paramset).await?;

        let input_dir = workdir.input_dir();
        let output_dir = workdir.output_dir();
        let scratch_dir = workdir.scratch_dir();
        let args = tool.render_args(&InvocationPaths {
            input_dir: &input_dir,
            output_dir: &output_dir,
            scratch_dir: &scratch_dir,
            params_file: &workdir.params_file(),
            recording_file: &workdir.recording_file(),
        });
        let mut env: Vec<(String, String)> = tool.env.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        env.push((ENV_INPUT_DIR.to_string(), input_dir.to_string_lossy().into_owned()));
        env.push((ENV_OUTPUT_DIR.to_string(), output_dir.to_string_lossy().into_owned()));
        env.push((ENV_SCRATCH_DIR.to_string(), scratch_dir.to_string_lossy().into_owned()));

        let invocation = Invocation {
            program: tool.program.clone(),
            args,
            env,
            current_dir: scratch_dir.clone(),
            log_file: workdir.log_file(),
        };

        let timeout = tool
            .timeout_secs
            .map(Duration::from_secs)
            .or(self.settings.default_timeout);

        info!(
            identity = %identity,
            sorter = %tool.name,
            version = %tool.version,
            attempt = job.attempt,
            dir = %workdir.root().display(),
            "Launching sorter"
        );
        let started = Instant::now();
        let mut child = process::spawn(&invocation)?;

        let end = self.monitor(identity, &mut child, cancel, timeout).await?;
        let log_tail = process::log_tail(&invocation.log_file, self.settings.log_tail_lines).await;

        match end {
            ProcessEnd::Exited(status) if status.success() => {}
            ProcessEnd::Exited(status) => {
                return Err(SortError::ToolRuntimeFailure(format!(
                    "sorter exited with {}; log tail:\n{}",
                    status, log_tail
                )));
            }
            ProcessEnd::TimedOut(limit) => {
                return Err(SortError::ToolRuntimeFailure(format!(
                    "sorter exceeded timeout of {}s and was killed; log tail:\n{}",
                    limit.as_secs(),
                    log_tail
                )));
            }
            ProcessEnd::Cancelled => return Err(SortError::CancellationRequested),
            ProcessEnd::LostOwnership => return self.lost_ownership(identity).await,
        }

        debug!(identity = %identity, elapsed_ms = started.elapsed().as_millis() as u64, "Sorter exited cleanly");

        let missing: Vec<&str> = tool
            .expected_outputs
            .iter()
            .filter(|f| !output_dir.join(f.as_str()).exists())
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(SortError::ToolRuntimeFailure(format!(
                "sorter exited cleanly but did not produce: {}; log tail:\n{}",
                missing.join(", "),
                log_tail
            )));
        }

        workdir.mark_output_complete(policy).await?;

        let result = parse_output_blocking(identity, &output_dir, recording, adapter)
            .await
            .map_err(|e| SortError::ToolRuntimeFailure(format!("output validation failed: {}", e)))?;
        info!(identity = %identity, units = result.units.len(), "Sorter output validated");

        self.commit_success(identity, workdir, false).await
    }

    /// Release scratch and record SUCCEEDED, provided the job is still ours
    async fn commit_success(&self, identity: &JobIdentity, workdir: &WorkDir, resumed: bool) -> Result<TriggerOutcome> {
        let worker_id = self.settings.worker_id.as_str();
        if !self.store.heartbeat(identity, worker_id).await? {
            return self.lost_ownership(identity).await;
        }
        workdir.release_scratch(self.settings.io_retry).await?;
        match self.store.mark_succeeded(identity, worker_id, &workdir.output_dir()).await {
            Ok(job) => Ok(TriggerOutcome::Succeeded { job, resumed }),
            Err(SortError::InvalidTransition { .. }) => self.lost_ownership(identity).await,
            Err(e) => Err(e),
        }
    }

    async fn lost_ownership(&self, identity: &JobIdentity) -> Result<TriggerOutcome> {
        let job = self.store.get(identity).await?;
        warn!(
            identity = %identity,
            state = %job.state,
            owner = job.worker_id.as_deref().unwrap_or("none"),
            "Job was taken over by another worker, leaving it alone"
        );
        Ok(TriggerOutcome::Skipped { job })
    }

    /// Wait for the child, killing it on cancellation, timeout or lost ownership
    async fn monitor(
        &self,
        identity: &JobIdentity,
        child: &mut tokio::process::Child,
        cancel: &CancellationToken,
        timeout: Option<Duration>,
    ) -> Result<ProcessEnd> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut ticker = tokio::time::interval(self.settings.heartbeat_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick completes immediately
        ticker.tick().await;

        let end = loop {
            tokio::select! {
                status = child.wait() => break ProcessEnd::Exited(status?),
                _ = cancel.cancelled() => break ProcessEnd::Cancelled,
                _ = sleep_until_opt(deadline) => {
                    break ProcessEnd::TimedOut(timeout.unwrap_or_default())
                }
                _ = ticker.tick() => {
                    if !self.store.heartbeat(identity, &self.settings.worker_id).await? {
                        break ProcessEnd::LostOwnership;
                    }
                    if self.store.is_cancel_requested(identity).await? {
                        break ProcessEnd::Cancelled;
                    }
                }
            }
        };

        if !matches!(end, ProcessEnd::Exited(_)) {
            if let Err(e) = child.kill().await {
                warn!(identity = %identity, error = %e, "Failed to kill sorter process");
            }
        }
        Ok(end)
    }

    /// Record FAILED, then drop output and scratch; logs stay on disk
    ///
    /// Nothing on disk is touched unless the failure was recorded under this
    /// worker's ownership.
    async fn record_failure(&self, job: &Job, workdir: &WorkDir, kind: FailureKind, diagnostic: &str) -> Result<Job> {
        let diagnostic = match kind {
            FailureKind::Cancelled => format!("cancelled while running: {}", diagnostic),
            _ => diagnostic.to_string(),
        };
        let failed = self
            .store
            .mark_failed(&job.identity, Some(self.settings.worker_id.as_str()), kind, &diagnostic)
            .await?;

        let policy = self.settings.io_retry;
        if let Err(e) = workdir.discard_output(policy).await {
            warn!(identity = %job.identity, error = %e, "Failed to remove output of failed attempt");
        }
        if let Err(e) = workdir.release_scratch(policy).await {
            warn!(identity = %job.identity, error = %e, "Failed to release scratch after failure");
        }
        Ok(failed)
    }
}
