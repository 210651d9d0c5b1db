//! End-to-end pipeline tests against a fake `sh` sorter

mod helpers;

use std::time::Duration;

use ephys_sort::models::{JobState, QualityLabel};
use ephys_sort::services::MetricSet;
use ephys_sort::{FailureKind, JobOutcome, SortError};
use helpers::{recording_spec, threshold_options, TestEnv};

#[tokio::test]
async fn test_end_to_end_42_units_with_metrics() {
    let env = TestEnv::new(&[("toolA", "ok", 42)]).await;
    let pipeline = &env.pipeline;

    let recording = pipeline.recordings().add(recording_spec("R1")).await.unwrap();
    let paramset = pipeline
        .parameters()
        .register("P1", "toolA", threshold_options(5), "")
        .await
        .unwrap();

    let outcome = pipeline.submit(&recording.id, paramset).await.unwrap();
    let job = match outcome {
        JobOutcome::Completed(job) => job,
        other => panic!("expected completion, got {:?}", other),
    };
    assert_eq!(job.state, JobState::Succeeded);
    assert_eq!(job.attempt, 1);
    assert!(job.output_dir.is_some());
    assert!(job.execution_duration().is_some());
    assert_eq!(env.invocations(), 1);

    let result = pipeline.sort_result(&job.identity).await.unwrap();
    assert_eq!(result.units.len(), 42);
    assert!(result.units.iter().all(|u| u.spike_count() == 10));
    assert!(result.units.iter().all(|u| u.quality_label == QualityLabel::Good));
    assert!(!result.units[0].peak_waveform.is_available());

    let rows = pipeline
        .quality_metrics(&job.identity, &MetricSet::all())
        .await
        .unwrap();
    assert_eq!(rows.len(), 42);
    for row in &rows {
        let rate = row.get("firing_rate").expect("firing_rate computed");
        assert!((rate - 10.0 / 60.0).abs() < 1e-9);
        // No waveforms and no features in the output set
        assert_eq!(row.get("amplitude"), None);
        assert_eq!(row.get("isolation_distance"), None);
    }

    // Scratch space released, logs kept
    let workdir = job.working_dir.clone().unwrap();
    assert!(!workdir.join("scratch").exists());
    assert!(workdir.join("logs").join("sorter.log").exists());
}

#[tokio::test]
async fn test_resubmission_is_memoized() {
    let env = TestEnv::new(&[("toolA", "ok", 3)]).await;
    let pipeline = &env.pipeline;

    let recording = pipeline.recordings().add(recording_spec("R1")).await.unwrap();
    let paramset = pipeline
        .parameters()
        .register("P1", "toolA", threshold_options(5), "")
        .await
        .unwrap();

    let first = pipeline.submit(&recording.id, paramset).await.unwrap();
    assert!(matches!(first, JobOutcome::Completed(_)));

    let second = pipeline.submit(&recording.id, paramset).await.unwrap();
    match second {
        JobOutcome::Memoized(job) => assert_eq!(&job.identity, &first.job().identity),
        other => panic!("expected memoized result, got {:?}", other),
    }
    assert_eq!(env.invocations(), 1);
    assert_eq!(pipeline.jobs(None).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_registering_same_content_under_new_recording_name_is_rejected() {
    let env = TestEnv::new(&[("toolA", "ok", 3)]).await;
    let recordings = env.pipeline.recordings();

    recordings.add(recording_spec("R1")).await.unwrap();
    let mut renamed = recording_spec("R1");
    renamed.name = "R1-copy".to_string();
    assert!(matches!(
        recordings.add(renamed).await,
        Err(SortError::DuplicateContentConflict { .. })
    ));

    let mut moved = recording_spec("R1");
    moved.source_path = "/elsewhere/continuous.dat".to_string();
    assert!(matches!(
        recordings.add(moved).await,
        Err(SortError::DuplicateNameConflict { .. })
    ));
}

#[tokio::test]
async fn test_crash_is_recorded_and_not_retried_until_reset() {
    let env = TestEnv::new(&[("toolA", "crash", 3)]).await;
    let pipeline = &env.pipeline;

    let recording = pipeline.recordings().add(recording_spec("R1")).await.unwrap();
    let paramset = pipeline
        .parameters()
        .register("P1", "toolA", threshold_options(5), "")
        .await
        .unwrap();

    let job = match pipeline.submit(&recording.id, paramset).await.unwrap() {
        JobOutcome::Failed(job) => job,
        other => panic!("expected failure, got {:?}", other),
    };
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.failure_kind, Some(FailureKind::ToolRuntime));
    let diagnostic = job.diagnostic.clone().unwrap();
    assert!(diagnostic.contains("out of GPU memory"), "diagnostic: {}", diagnostic);

    // FAILED stays FAILED
    let again = pipeline.submit(&recording.id, paramset).await.unwrap();
    assert!(matches!(again, JobOutcome::PreviouslyFailed(_)));
    let report = pipeline.run_pending().await.unwrap();
    assert!(report.outcomes.is_empty());
    assert_eq!(env.invocations(), 1);

    let reset = pipeline.reset(&job.identity).await.unwrap();
    assert_eq!(reset.state, JobState::Pending);
    assert_eq!(reset.attempt, 2);
    assert!(reset.diagnostic.is_none());

    let report = pipeline.run_pending().await.unwrap();
    assert_eq!(report.outcomes.len(), 1);
    assert_eq!(report.failed(), 1);
    assert_eq!(env.invocations(), 2);

    // Results of a failed job are not readable
    assert!(matches!(
        pipeline.sort_result(&job.identity).await,
        Err(SortError::NotSucceeded(_))
    ));
}

#[tokio::test]
async fn test_missing_output_is_runtime_failure() {
    let env = TestEnv::new(&[("toolA", "no_output", 3)]).await;
    let pipeline = &env.pipeline;

    let recording = pipeline.recordings().add(recording_spec("R1")).await.unwrap();
    let paramset = pipeline
        .parameters()
        .register("P1", "toolA", threshold_options(5), "")
        .await
        .unwrap();

    let outcome = pipeline.submit(&recording.id, paramset).await.unwrap();
    let job = outcome.job();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.failure_kind, Some(FailureKind::ToolRuntime));
    assert!(job.diagnostic.as_deref().unwrap().contains("units.tsv"));
}

#[tokio::test]
async fn test_unmapped_column_fails_closed() {
    let env = TestEnv::new(&[("toolA", "bad_schema", 3)]).await;
    let pipeline = &env.pipeline;

    let recording = pipeline.recordings().add(recording_spec("R1")).await.unwrap();
    let paramset = pipeline
        .parameters()
        .register("P1", "toolA", threshold_options(5), "")
        .await
        .unwrap();

    let job = pipeline.submit(&recording.id, paramset).await.unwrap().job().clone();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.failure_kind, Some(FailureKind::ToolRuntime));
    let diagnostic = job.diagnostic.unwrap();
    assert!(diagnostic.contains("mystery_column"), "diagnostic: {}", diagnostic);
}

#[tokio::test]
async fn test_timeout_kills_sorter() {
    let env = TestEnv::with_config(&[("toolA", "hang", 3)], |config| {
        config.sorter[0].timeout_secs = Some(1);
    })
    .await;
    let pipeline = &env.pipeline;

    let recording = pipeline.recordings().add(recording_spec("R1")).await.unwrap();
    let paramset = pipeline
        .parameters()
        .register("P1", "toolA", threshold_options(5), "")
        .await
        .unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(15), pipeline.submit(&recording.id, paramset))
        .await
        .expect("timeout enforced well before the sorter finishes")
        .unwrap();
    let job = outcome.job();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.failure_kind, Some(FailureKind::ToolRuntime));
    assert!(job.diagnostic.as_deref().unwrap().contains("timeout"));
}

#[tokio::test]
async fn test_cancel_running_job_kills_sorter() {
    let env = TestEnv::new(&[("toolA", "hang", 3)]).await;
    let pipeline = env.pipeline.clone();

    let recording = pipeline.recordings().add(recording_spec("R1")).await.unwrap();
    let paramset = pipeline
        .parameters()
        .register("P1", "toolA", threshold_options(5), "")
        .await
        .unwrap();
    let job = pipeline.enqueue(&recording.id, paramset).await.unwrap();
    let identity = job.identity.clone();

    let runner = {
        let pipeline = pipeline.clone();
        let identity = identity.clone();
        tokio::spawn(async move { pipeline.run_job(&identity).await })
    };

    // Wait for the sorter to start
    for _ in 0..200 {
        if env.invocations() > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert_eq!(env.invocations(), 1);

    let flagged = pipeline.cancel(&identity).await.unwrap();
    assert!(flagged.cancel_requested);

    let outcome = tokio::time::timeout(Duration::from_secs(10), runner)
        .await
        .expect("cancelled job stops promptly")
        .unwrap()
        .unwrap();
    let job = match outcome {
        JobOutcome::Failed(job) => job,
        other => panic!("expected failure, got {:?}", other),
    };
    assert_eq!(job.failure_kind, Some(FailureKind::Cancelled));
    assert!(job.diagnostic.as_deref().unwrap().contains("cancel"));

    // Terminal jobs cannot be cancelled
    assert!(matches!(
        pipeline.cancel(&identity).await,
        Err(SortError::InvalidTransition { .. })
    ));
}

#[tokio::test]
async fn test_cancel_from_another_orchestrator() {
    let env = TestEnv::new(&[("toolA", "hang", 3)]).await;
    let pipeline = env.pipeline.clone();

    let recording = pipeline.recordings().add(recording_spec("R1")).await.unwrap();
    let paramset = pipeline
        .parameters()
        .register("P1", "toolA", threshold_options(5), "")
        .await
        .unwrap();
    let identity = pipeline.enqueue(&recording.id, paramset).await.unwrap().identity;

    let runner = {
        let pipeline = pipeline.clone();
        let identity = identity.clone();
        tokio::spawn(async move { pipeline.run_job(&identity).await })
    };
    for _ in 0..200 {
        if env.invocations() > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    // Only the database flag reaches the running worker
    let other = env.second_pipeline().await;
    other.cancel(&identity).await.unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(10), runner)
        .await
        .expect("flag observed on heartbeat")
        .unwrap()
        .unwrap();
    assert_eq!(outcome.job().failure_kind, Some(FailureKind::Cancelled));
}

#[tokio::test]
async fn test_cancel_pending_job() {
    let env = TestEnv::new(&[("toolA", "ok", 3)]).await;
    let pipeline = &env.pipeline;

    let recording = pipeline.recordings().add(recording_spec("R1")).await.unwrap();
    let paramset = pipeline
        .parameters()
        .register("P1", "toolA", threshold_options(5), "")
        .await
        .unwrap();
    let job = pipeline.enqueue(&recording.id, paramset).await.unwrap();

    let cancelled = pipeline.cancel(&job.identity).await.unwrap();
    assert_eq!(cancelled.state, JobState::Failed);
    assert_eq!(cancelled.failure_kind, Some(FailureKind::Cancelled));

    let report = pipeline.run_pending().await.unwrap();
    assert!(report.outcomes.is_empty());
    assert_eq!(env.invocations(), 0);
}

#[tokio::test]
async fn test_missing_required_option_is_launch_failure() {
    let env = TestEnv::with_config(&[("toolA", "ok", 3)], |config| {
        config.sorter[0].required_options = vec!["threshold".to_string(), "n_templates".to_string()];
    })
    .await;
    let pipeline = &env.pipeline;

    let recording = pipeline.recordings().add(recording_spec("R1")).await.unwrap();
    let paramset = pipeline
        .parameters()
        .register("P1", "toolA", threshold_options(5), "")
        .await
        .unwrap();

    let err = pipeline.submit(&recording.id, paramset).await.unwrap_err();
    assert!(matches!(err, SortError::ToolLaunchFailure(ref msg) if msg.contains("n_templates")));
    assert_eq!(env.invocations(), 0);

    let jobs = pipeline.jobs(Some(JobState::Failed)).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].failure_kind, Some(FailureKind::ToolLaunch));
}

#[tokio::test]
async fn test_missing_program_is_launch_failure() {
    let env = TestEnv::with_config(&[("toolA", "ok", 3)], |config| {
        config.sorter[0].program = "no-such-sorter-binary".to_string();
    })
    .await;
    let pipeline = &env.pipeline;

    let recording = pipeline.recordings().add(recording_spec("R1")).await.unwrap();
    let paramset = pipeline
        .parameters()
        .register("P1", "toolA", threshold_options(5), "")
        .await
        .unwrap();

    let err = pipeline.submit(&recording.id, paramset).await.unwrap_err();
    assert!(matches!(err, SortError::ToolLaunchFailure(_)));
    let job = &pipeline.jobs(None).await.unwrap()[0];
    assert_eq!(job.state, JobState::Failed);
}

#[tokio::test]
async fn test_unwritable_work_root_is_transient_io_failure() {
    // A plain file where the work root should be: directory creation keeps failing
    let blocker_dir = tempfile::TempDir::new().unwrap();
    let blocker = blocker_dir.path().join("work");
    std::fs::write(&blocker, "not a directory").unwrap();

    let env = TestEnv::with_config(&[("toolA", "ok", 3)], |config| {
        config.pipeline.work_dir = Some(blocker.clone());
        config.pipeline.io_retry_attempts = 3;
    })
    .await;
    let pipeline = &env.pipeline;

    let recording = pipeline.recordings().add(recording_spec("R1")).await.unwrap();
    let paramset = pipeline
        .parameters()
        .register("P1", "toolA", threshold_options(5), "")
        .await
        .unwrap();

    let err = pipeline.submit(&recording.id, paramset).await.unwrap_err();
    assert!(matches!(err, SortError::TransientIOFailure { attempts: 3, .. }));

    let job = &pipeline.jobs(None).await.unwrap()[0];
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.failure_kind, Some(FailureKind::TransientIo));
    assert!(job.diagnostic.as_deref().unwrap().contains("after 3 attempts"));
    assert_eq!(env.invocations(), 0);
    assert!(blocker.is_file());
}

#[tokio::test]
async fn test_run_pending_batch_isolates_failures() {
    let env = TestEnv::with_config(&[("toolA", "ok", 5), ("toolB", "crash", 5)], |config| {
        config.pipeline.max_concurrent_jobs = 2;
    })
    .await;
    let pipeline = &env.pipeline;

    let r1 = pipeline.recordings().add(recording_spec("R1")).await.unwrap();
    let r2 = pipeline.recordings().add(recording_spec("R2")).await.unwrap();
    let good = pipeline
        .parameters()
        .register("P-good", "toolA", threshold_options(5), "")
        .await
        .unwrap();
    let bad = pipeline
        .parameters()
        .register("P-bad", "toolB", threshold_options(5), "")
        .await
        .unwrap();

    for recording in [&r1, &r2] {
        for paramset in [good, bad] {
            pipeline.enqueue(&recording.id, paramset).await.unwrap();
        }
    }

    let report = pipeline.run_pending().await.unwrap();
    assert_eq!(report.outcomes.len(), 4);
    assert_eq!(report.succeeded(), 2);
    assert_eq!(report.failed(), 2);
    assert!(report.errors.is_empty());
    assert_eq!(env.invocations(), 4);

    assert_eq!(pipeline.jobs(Some(JobState::Succeeded)).await.unwrap().len(), 2);
    assert_eq!(pipeline.jobs(Some(JobState::Failed)).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_unknown_inputs_are_unresolved() {
    let env = TestEnv::new(&[("toolA", "ok", 3)]).await;
    let pipeline = &env.pipeline;

    assert!(matches!(
        pipeline.parameters().register("P1", "toolZ", threshold_options(5), "").await,
        Err(SortError::UnresolvedDependency(_))
    ));

    let paramset = pipeline
        .parameters()
        .register("P1", "toolA", threshold_options(5), "")
        .await
        .unwrap();
    let unknown = ephys_sort::models::RecordingId("0".repeat(64));
    assert!(matches!(
        pipeline.submit(&unknown, paramset).await,
        Err(SortError::UnresolvedDependency(_))
    ));
}
