//! Pipeline entry point
//!
//! Wires the services together and drives jobs:
//! - `submit`: resolve identity, memoize, run when PENDING
//! - `run_pending`: drain PENDING jobs with a bounded worker pool
//! - `recover`: requeue RUNNING jobs left behind by a stopped orchestrator
//!
//! Execution failures are recorded on the job and reported as a
//! [`JobOutcome`]; only launch failures and exhausted I/O retries come back
//! as errors.

use futures::stream::{self, StreamExt};
use serde::Serialize;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::{PipelineSettings, SortConfig};
use crate::error::{FailureKind, Result, SortError};
use crate::models::{
    Job, JobIdentity, JobState, ParameterSetId, QualityMetricRow, RecordingId, SortResult,
};
use crate::services::{
    AdapterRegistry, IdentityResolver, JobStore, MetricSet, ParameterRegistry, QualityMetricsEngine,
    RecordingCatalog, ResultIngestor, SorterCatalog, SorterTrigger, StaleRecovery, TriggerOutcome,
    TriggerSettings,
};

/// What happened to a submitted or drained job
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", content = "job", rename_all = "snake_case")]
pub enum JobOutcome {
    /// A valid result already existed; nothing was run
    Memoized(Job),
    /// The sorter ran (or an interrupted run was resumed) and its output validated
    Completed(Job),
    /// Runtime failure, timeout or cancellation, recorded on the job
    Failed(Job),
    /// Another worker holds the job
    AlreadyRunning(Job),
    /// FAILED earlier; needs an explicit reset before it runs again
    PreviouslyFailed(Job),
}

impl JobOutcome {
    pub fn job(&self) -> &Job {
        match self {
            JobOutcome::Memoized(job)
            | JobOutcome::Completed(job)
            | JobOutcome::Failed(job)
            | JobOutcome::AlreadyRunning(job)
            | JobOutcome::PreviouslyFailed(job) => job,
        }
    }

    /// Outcome for a job this worker did not run
    fn from_state(job: Job) -> Self {
        match job.state {
            JobState::Succeeded => JobOutcome::Memoized(job),
            JobState::Failed => JobOutcome::PreviouslyFailed(job),
            JobState::Running | JobState::Pending => JobOutcome::AlreadyRunning(job),
        }
    }
}

/// Result of draining the PENDING queue
#[derive(Debug, Default)]
pub struct BatchReport {
    pub outcomes: Vec<JobOutcome>,
    /// Jobs whose execution raised a fatal error (already recorded as FAILED
    /// where the store could be reached)
    pub errors: Vec<(JobIdentity, SortError)>,
}

impl BatchReport {
    pub fn succeeded(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, JobOutcome::Completed(_)))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.errors.len()
            + self
                .outcomes
                .iter()
                .filter(|o| matches!(o, JobOutcome::Failed(_)))
                .count()
    }
}

#[derive(Clone)]
pub struct Pipeline {
    db: SqlitePool,
    recordings: RecordingCatalog,
    parameters: ParameterRegistry,
    resolver: IdentityResolver,
    store: JobStore,
    catalog: Arc<SorterCatalog>,
    ingestor: ResultIngestor,
    trigger: SorterTrigger,
    metrics: Arc<QualityMetricsEngine>,
    settings: PipelineSettings,
    /// Tokens for jobs this process is running
    cancellation_tokens: Arc<RwLock<HashMap<JobIdentity, CancellationToken>>>,
    worker_id: String,
}

impl Pipeline {
    /// Open (or create) the database under `root` and build the pipeline
    pub async fn open(root: &Path, config: &SortConfig) -> Result<Self> {
        ephys_common::config::ensure_directory(root)?;
        let db = ephys_common::db::init_database(&config.pipeline.database_path(root)).await?;
        Self::new(db, root, config)
    }

    pub fn new(db: SqlitePool, root: &Path, config: &SortConfig) -> Result<Self> {
        let catalog = Arc::new(SorterCatalog::new(config.sorter.clone())?);
        let adapters = Arc::new(AdapterRegistry::new(&config.adapter)?);
        // Fail at startup on a sorter naming an undefined adapter
        for tool in &config.sorter {
            adapters.resolve(tool.adapter.as_deref())?;
        }

        let worker_id = Uuid::new_v4().to_string();
        let settings = config.pipeline.clone();
        let work_root = settings.work_root(root);

        let recordings = RecordingCatalog::new(db.clone());
        let parameters = ParameterRegistry::new(db.clone(), catalog.clone());
        let resolver = IdentityResolver::new(recordings.clone(), parameters.clone());
        let store = JobStore::new(db.clone());
        let ingestor = ResultIngestor::new(db.clone(), catalog.clone(), adapters);
        let trigger = SorterTrigger::new(
            store.clone(),
            ingestor.clone(),
            TriggerSettings {
                work_root: work_root.clone(),
                worker_id: worker_id.clone(),
                heartbeat_interval: settings.heartbeat_interval(),
                default_timeout: settings.default_timeout(),
                io_retry: settings.io_retry(),
                log_tail_lines: settings.log_tail_lines,
            },
        );

        info!(
            worker = %worker_id,
            work_root = %work_root.display(),
            sorters = catalog.names().collect::<Vec<_>>().join(","),
            max_concurrent_jobs = settings.max_concurrent_jobs,
            "Pipeline ready"
        );

        Ok(Self {
            db,
            recordings,
            parameters,
            resolver,
            store,
            catalog,
            ingestor,
            trigger,
            metrics: Arc::new(QualityMetricsEngine::new(config.metrics)),
            settings,
            cancellation_tokens: Arc::new(RwLock::new(HashMap::new())),
            worker_id,
        })
    }

    pub fn db(&self) -> &SqlitePool {
        &self.db
    }

    pub fn recordings(&self) -> &RecordingCatalog {
        &self.recordings
    }

    pub fn parameters(&self) -> &ParameterRegistry {
        &self.parameters
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    pub fn catalog(&self) -> &SorterCatalog {
        &self.catalog
    }

    pub fn trigger(&self) -> &SorterTrigger {
        &self.trigger
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn work_root(&self) -> &Path {
        &self.trigger.settings().work_root
    }

    /// Requeue RUNNING jobs whose worker stopped heartbeating
    pub async fn recover(&self) -> Result<StaleRecovery> {
        let recovery = self.store.requeue_stale(self.settings.stale_after()).await?;
        if !recovery.requeued.is_empty() || !recovery.failed.is_empty() {
            info!(
                requeued = recovery.requeued.len(),
                failed = recovery.failed.len(),
                "Recovered jobs from stopped orchestrator"
            );
        }
        Ok(recovery)
    }

    /// Register (or find) the job for a recording and parameter set
    pub async fn enqueue(&self, recording: &RecordingId, paramset: ParameterSetId) -> Result<Job> {
        let sorter_name = self.parameters.get(paramset).await?.sorter_name;
        let tool = self.catalog.require(&sorter_name)?;
        let resolved = self.resolver.resolve(recording, paramset, &tool.version).await?;
        self.store.get_or_create(&resolved).await
    }

    /// Enqueue and, unless a result or an earlier failure exists, run now
    pub async fn submit(&self, recording: &RecordingId, paramset: ParameterSetId) -> Result<JobOutcome> {
        let job = self.enqueue(recording, paramset).await?;
        match job.state {
            JobState::Pending => self.run_job(&job.identity).await,
            _ => {
                info!(identity = %job.identity, state = %job.state, "Submission matched existing job");
                Ok(JobOutcome::from_state(job))
            }
        }
    }

    /// Claim a PENDING job and run its sorter
    pub async fn run_job(&self, identity: &JobIdentity) -> Result<JobOutcome> {
        let job = match self.store.claim(identity, &self.worker_id).await {
            Ok(job) => job,
            Err(SortError::InvalidTransition { .. }) => {
                return Ok(JobOutcome::from_state(self.store.get(identity).await?));
            }
            Err(e) => return Err(e),
        };

        let token = CancellationToken::new();
        self.cancellation_tokens
            .write()
            .await
            .insert(identity.clone(), token.clone());

        let outcome = self.execute_claimed(&job, &token).await;

        self.cancellation_tokens.write().await.remove(identity);
        outcome
    }

    async fn execute_claimed(&self, job: &Job, token: &CancellationToken) -> Result<JobOutcome> {
        let inputs = async {
            let recording = self.recordings.get(&job.recording_id).await?;
            let paramset = self.parameters.get(job.paramset_id).await?;
            let tool = self.catalog.require(&job.sorter_name)?.clone();
            if tool.version != job.tool_version {
                return Err(SortError::ToolLaunchFailure(format!(
                    "job was created for {} {} but {} is configured",
                    tool.name, job.tool_version, tool.version
                )));
            }
            Ok((recording, paramset, tool))
        };

        let (recording, paramset, tool) = match inputs.await {
            Ok(inputs) => inputs,
            Err(e) => {
                let kind = e.failure_kind().unwrap_or(FailureKind::ToolLaunch);
                self.store
                    .mark_failed(&job.identity, Some(self.worker_id.as_str()), kind, &e.to_string())
                    .await?;
                return Err(e);
            }
        };

        match self
            .trigger
            .run(&job.identity, &recording, &paramset, &tool, token)
            .await?
        {
            TriggerOutcome::Succeeded { job, .. } => Ok(JobOutcome::Completed(job)),
            TriggerOutcome::Failed { job } => Ok(JobOutcome::Failed(job)),
            TriggerOutcome::Skipped { job } => Ok(JobOutcome::from_state(job)),
        }
    }

    /// Run every PENDING job, at most `max_concurrent_jobs` at a time
    pub async fn run_pending(&self) -> Result<BatchReport> {
        let pending = self.store.list(Some(JobState::Pending)).await?;
        let total = pending.len();
        info!(jobs = total, worker = %self.worker_id, "Draining pending jobs");

        let results: Vec<(JobIdentity, Result<JobOutcome>)> = stream::iter(pending)
            .map(|job| {
                let pipeline = self.clone();
                async move {
                    let outcome = pipeline.run_job(&job.identity).await;
                    (job.identity, outcome)
                }
            })
            .buffer_unordered(self.settings.max_concurrent_jobs.max(1))
            .collect()
            .await;

        let mut report = BatchReport::default();
        for (identity, result) in results {
            match result {
                Ok(outcome) => report.outcomes.push(outcome),
                Err(e) => {
                    error!(identity = %identity, error = %e, "Job execution failed");
                    report.errors.push((identity, e));
                }
            }
        }

        info!(
            jobs = total,
            succeeded = report.succeeded(),
            failed = report.failed(),
            "Pending jobs drained"
        );
        Ok(report)
    }

    /// Cancel a PENDING or RUNNING job
    ///
    /// A RUNNING job owned by this process is stopped through its token; one
    /// owned by another process sees the flag on its next heartbeat.
    pub async fn cancel(&self, identity: &JobIdentity) -> Result<Job> {
        let job = self.store.request_cancel(identity).await?;
        if let Some(token) = self.cancellation_tokens.read().await.get(identity) {
            token.cancel();
        }
        Ok(job)
    }

    /// FAILED → PENDING so the next run picks the job up again
    pub async fn reset(&self, identity: &JobIdentity) -> Result<Job> {
        self.store.reset(identity).await
    }

    pub async fn status(&self, identity: &JobIdentity) -> Result<Job> {
        self.store.get(identity).await
    }

    pub async fn jobs(&self, state: Option<JobState>) -> Result<Vec<Job>> {
        self.store.list(state).await
    }

    /// Parsed output of a SUCCEEDED job
    pub async fn sort_result(&self, identity: &JobIdentity) -> Result<SortResult> {
        let job = self.store.get(identity).await?;
        self.ingestor.ingest(&job).await
    }

    /// Metric rows for a SUCCEEDED job, one per unit
    pub async fn quality_metrics(&self, identity: &JobIdentity, metric_set: &MetricSet) -> Result<Vec<QualityMetricRow>> {
        let result = self.sort_result(identity).await?;
        let rows = self.metrics.compute(&result, metric_set);
        if rows.is_empty() {
            warn!(identity = %identity, "Sort result has no units");
        }
        Ok(rows)
    }

    /// Working directory recorded for a job, if any attempt created one
    pub async fn working_dir(&self, identity: &JobIdentity) -> Result<Option<PathBuf>> {
        Ok(self.store.get(identity).await?.working_dir)
    }
}
