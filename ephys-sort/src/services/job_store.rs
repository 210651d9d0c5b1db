//! Job store
//!
//! The single serialization point of the orchestrator. Each state change is a
//! compare-and-set on the job row, so any number of workers (in this process
//! or others sharing the database file) can race for the same job and exactly
//! one wins.
//!
//! FAILED jobs stay FAILED until an explicit [`JobStore::reset`].

use sqlx::SqlitePool;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::db::jobs::{self, NewJob};
use crate::error::{FailureKind, Result, SortError};
use crate::models::{Job, JobIdentity, JobState};
use crate::services::identity_resolver::ResolvedIdentity;

/// Result of requeueing jobs orphaned by a stopped orchestrator
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StaleRecovery {
    /// Moved back to PENDING
    pub requeued: Vec<JobIdentity>,
    /// Cancel was pending; moved to FAILED
    pub failed: Vec<JobIdentity>,
}

#[derive(Clone)]
pub struct JobStore {
    db: SqlitePool,
}

impl JobStore {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Existing job for the identity, or a new PENDING one
    pub async fn get_or_create(&self, resolved: &ResolvedIdentity) -> Result<Job> {
        let inserted = jobs::insert_job(
            &self.db,
            &NewJob {
                identity: &resolved.identity,
                recording_id: &resolved.recording.id,
                paramset_id: resolved.paramset.id,
                sorter_name: &resolved.tool_name,
                tool_version: &resolved.tool_version,
                created_at: ephys_common::time::now(),
            },
        )
        .await?;

        let job = self.get(&resolved.identity).await?;
        if inserted {
            info!(
                identity = %job.identity,
                recording = %resolved.recording.name(),
                paramset = %resolved.paramset.name,
                "Created job"
            );
        } else {
            debug!(identity = %job.identity, state = %job.state, "Job already registered");
        }
        Ok(job)
    }

    pub async fn find(&self, identity: &JobIdentity) -> Result<Option<Job>> {
        Ok(jobs::load_job(&self.db, identity).await?)
    }

    pub async fn get(&self, identity: &JobIdentity) -> Result<Job> {
        self.find(identity)
            .await?
            .ok_or_else(|| SortError::NotFound(format!("job {}", identity)))
    }

    pub async fn list(&self, state: Option<JobState>) -> Result<Vec<Job>> {
        Ok(jobs::list_jobs(&self.db, state).await?)
    }

    /// Compare-and-set `from` → `to`
    ///
    /// PENDING → RUNNING needs an owner and goes through [`JobStore::claim`].
    pub async fn transition(&self, identity: &JobIdentity, from: JobState, to: JobState) -> Result<Job> {
        if !from.can_transition_to(to) {
            return Err(SortError::InvalidTransition {
                identity: identity.to_string(),
                expected: from.to_string(),
                actual: format!("{} (target {} not reachable)", from, to),
            });
        }
        if (from, to) == (JobState::Pending, JobState::Running) {
            return Err(SortError::InvalidTransition {
                identity: identity.to_string(),
                expected: from.to_string(),
                actual: format!("{} (RUNNING requires a claim with a worker id)", from),
            });
        }

        let affected = if (from, to) == (JobState::Failed, JobState::Pending) {
            jobs::reset(&self.db, identity).await?
        } else {
            jobs::update_state(&self.db, identity, from, to).await?
        };
        self.after_cas(identity, from, affected).await
    }

    /// PENDING → RUNNING for one worker; losers get `InvalidTransition`
    pub async fn claim(&self, identity: &JobIdentity, worker_id: &str) -> Result<Job> {
        let affected = jobs::claim(&self.db, identity, worker_id).await?;
        let job = self.after_cas(identity, JobState::Pending, affected).await?;
        info!(identity = %identity, worker = worker_id, attempt = job.attempt, "Job claimed");
        Ok(job)
    }

    /// RUNNING → SUCCEEDED with the validated output location
    ///
    /// `InvalidTransition` when `worker_id` no longer owns the job.
    pub async fn mark_succeeded(&self, identity: &JobIdentity, worker_id: &str, output_dir: &Path) -> Result<Job> {
        let affected = jobs::complete(&self.db, identity, worker_id, output_dir).await?;
        let job = self.after_owned_cas(identity, Some(worker_id), affected).await?;
        info!(
            identity = %identity,
            output = %output_dir.display(),
            duration_ms = job.execution_duration().map(|d| d.num_milliseconds()),
            "Job succeeded"
        );
        Ok(job)
    }

    /// RUNNING → FAILED, keeping the diagnostic
    ///
    /// With `worker_id` set, `InvalidTransition` when that worker no longer
    /// owns the job.
    pub async fn mark_failed(
        &self,
        identity: &JobIdentity,
        worker_id: Option<&str>,
        kind: FailureKind,
        diagnostic: &str,
    ) -> Result<Job> {
        let affected = jobs::fail(&self.db, identity, JobState::Running, worker_id, kind, diagnostic).await?;
        let job = self.after_owned_cas(identity, worker_id, affected).await?;
        warn!(identity = %identity, kind = %kind, diagnostic, "Job failed");
        Ok(job)
    }

    /// FAILED → PENDING, incrementing the attempt counter
    pub async fn reset(&self, identity: &JobIdentity) -> Result<Job> {
        let affected = jobs::reset(&self.db, identity).await?;
        let job = self.after_cas(identity, JobState::Failed, affected).await?;
        info!(identity = %identity, attempt = job.attempt, "Job reset");
        Ok(job)
    }

    /// Cancel a PENDING job outright, or flag a RUNNING one for its trigger
    pub async fn request_cancel(&self, identity: &JobIdentity) -> Result<Job> {
        // A PENDING job may be claimed between the read and the update; one retry covers it
        for _ in 0..2 {
            let job = self.get(identity).await?;
            match job.state {
                JobState::Pending => {
                    let affected = jobs::fail(
                        &self.db,
                        identity,
                        JobState::Pending,
                        None,
                        FailureKind::Cancelled,
                        "cancelled before start",
                    )
                    .await?;
                    if affected > 0 {
                        info!(identity = %identity, "Pending job cancelled");
                        return self.get(identity).await;
                    }
                }
                JobState::Running => {
                    if jobs::set_cancel_requested(&self.db, identity).await? > 0 {
                        info!(identity = %identity, "Cancellation requested for running job");
                        return self.get(identity).await;
                    }
                }
                state => {
                    return Err(SortError::InvalidTransition {
                        identity: identity.to_string(),
                        expected: "PENDING or RUNNING".to_string(),
                        actual: state.to_string(),
                    })
                }
            }
        }

        let job = self.get(identity).await?;
        Err(SortError::InvalidTransition {
            identity: identity.to_string(),
            expected: "PENDING or RUNNING".to_string(),
            actual: job.state.to_string(),
        })
    }

    pub async fn is_cancel_requested(&self, identity: &JobIdentity) -> Result<bool> {
        Ok(jobs::cancel_requested(&self.db, identity).await?)
    }

    /// Returns false when the worker no longer owns a RUNNING job
    pub async fn heartbeat(&self, identity: &JobIdentity, worker_id: &str) -> Result<bool> {
        Ok(jobs::touch_heartbeat(&self.db, identity, worker_id).await? > 0)
    }

    pub async fn set_working_dir(&self, identity: &JobIdentity, working_dir: &Path) -> Result<()> {
        if jobs::set_working_dir(&self.db, identity, working_dir).await? == 0 {
            return Err(SortError::NotFound(format!("job {}", identity)));
        }
        Ok(())
    }

    /// Move RUNNING jobs without a recent heartbeat back to PENDING
    ///
    /// Jobs with a pending cancellation go to FAILED instead.
    pub async fn requeue_stale(&self, stale_after: Duration) -> Result<StaleRecovery> {
        let stale_after = chrono::Duration::from_std(stale_after)
            .map_err(|e| SortError::Common(ephys_common::Error::InvalidInput(e.to_string())))?;
        let cutoff = ephys_common::time::now() - stale_after;

        let mut recovery = StaleRecovery::default();
        for job in jobs::list_stale_running(&self.db, cutoff).await? {
            let last_seen = job
                .heartbeat_at
                .map(ephys_common::time::format_timestamp)
                .unwrap_or_else(|| "never".to_string());
            let worker = job.worker_id.as_deref().unwrap_or("unknown");

            if job.cancel_requested {
                let diagnostic = format!(
                    "interrupted: worker {} stopped (last heartbeat {}) with cancellation pending",
                    worker, last_seen
                );
                let affected = jobs::fail(
                    &self.db,
                    &job.identity,
                    JobState::Running,
                    job.worker_id.as_deref(),
                    FailureKind::Interrupted,
                    &diagnostic,
                )
                .await?;
                if affected > 0 {
                    warn!(identity = %job.identity, "Stale job had a pending cancel, marked failed");
                    recovery.failed.push(job.identity);
                }
            } else {
                let diagnostic = format!(
                    "interrupted: worker {} stopped (last heartbeat {}), requeued",
                    worker, last_seen
                );
                if jobs::requeue(&self.db, &job.identity, &diagnostic).await? > 0 {
                    warn!(identity = %job.identity, worker, "Requeued stale running job");
                    recovery.requeued.push(job.identity);
                }
            }
        }
        Ok(recovery)
    }

    /// Like `after_cas` for RUNNING rows, reporting the owner on a miss
    async fn after_owned_cas(&self, identity: &JobIdentity, worker_id: Option<&str>, affected: u64) -> Result<Job> {
        let job = self.get(identity).await?;
        if affected == 0 {
            let expected = match worker_id {
                Some(worker) => format!("{} owned by {}", JobState::Running, worker),
                None => JobState::Running.to_string(),
            };
            return Err(SortError::InvalidTransition {
                identity: identity.to_string(),
                expected,
                actual: format!("{} owned by {}", job.state, job.worker_id.as_deref().unwrap_or("none")),
            });
        }
        Ok(job)
    }

    /// Turn a compare-and-set row count into the new row or `InvalidTransition`
    async fn after_cas(&self, identity: &JobIdentity, expected: JobState, affected: u64) -> Result<Job> {
        let job = self.get(identity).await?;
        if affected == 0 {
            return Err(SortError::InvalidTransition {
                identity: identity.to_string(),
                expected: expected.to_string(),
                actual: job.state.to_string(),
            });
        }
        Ok(job)
    }
}
