//! Job store and trigger re-entry tests
//!
//! Dedup and exclusive claims under concurrency, resumption of interrupted
//! attempts, and recovery of jobs orphaned by a stopped orchestrator.

mod helpers;

use std::time::Duration;

use ephys_sort::models::{JobState, Options};
use ephys_sort::services::sorter_trigger::workdir::{Manifest, WorkDir};
use ephys_sort::services::TriggerOutcome;
use ephys_sort::utils::IoRetryPolicy;
use ephys_sort::{FailureKind, JobOutcome, SortError};
use helpers::{recording_spec, threshold_options, TestEnv};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

const UNITS_TSV: &str = "unit_id\tKSLabel\n0\tgood\n1\tmua\n";
const SPIKES_TSV: &str = "unit_id\tspike_time\n0\t0.5\n0\t1.5\n1\t2.0\n";

#[tokio::test]
async fn test_fingerprint_ignores_insertion_order() {
    let env = TestEnv::new(&[("toolA", "ok", 3)]).await;
    let registry = env.pipeline.parameters();

    let forward: Options = serde_json::from_str(r#"{"threshold": 5, "car": true, "filter": {"low": 300, "high": 6000}}"#).unwrap();
    let reverse: Options = serde_json::from_str(r#"{"filter": {"high": 6000, "low": 300}, "car": true, "threshold": 5}"#).unwrap();

    let a = registry.register("P1", "toolA", forward, "first").await.unwrap();
    // Same name, same content: idempotent (description is not content)
    let b = registry.register("P1", "toolA", reverse.clone(), "second").await.unwrap();
    assert_eq!(a, b);
    assert_eq!(
        registry.fingerprint(a).await.unwrap(),
        registry.get_by_name("P1").await.unwrap().fingerprint
    );

    assert!(matches!(
        registry.register("P2", "toolA", reverse, "").await,
        Err(SortError::DuplicateContentConflict { existing }) if existing == "P1"
    ));
    assert!(matches!(
        registry.register("P1", "toolA", threshold_options(6), "").await,
        Err(SortError::DuplicateNameConflict { .. })
    ));
}

#[tokio::test]
async fn test_get_or_create_is_deduplicated() {
    let env = TestEnv::new(&[("toolA", "ok", 3)]).await;
    let pipeline = env.pipeline.clone();

    let recording = pipeline.recordings().add(recording_spec("R1")).await.unwrap();
    let paramset = pipeline
        .parameters()
        .register("P1", "toolA", threshold_options(5), "")
        .await
        .unwrap();

    let first = pipeline.enqueue(&recording.id, paramset).await.unwrap();
    let second = pipeline.enqueue(&recording.id, paramset).await.unwrap();
    assert_eq!(first.identity, second.identity);
    assert_eq!(first.state, JobState::Pending);

    let mut join_set = JoinSet::new();
    for _ in 0..8 {
        let pipeline = pipeline.clone();
        let recording_id = recording.id.clone();
        join_set.spawn(async move { pipeline.enqueue(&recording_id, paramset).await.unwrap().identity });
    }
    while let Some(identity) = join_set.join_next().await {
        assert_eq!(identity.unwrap(), first.identity);
    }

    assert_eq!(pipeline.jobs(None).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_concurrent_claims_have_one_winner() {
    let env = TestEnv::new(&[("toolA", "ok", 3)]).await;
    let pipeline = env.pipeline.clone();

    let recording = pipeline.recordings().add(recording_spec("R1")).await.unwrap();
    let paramset = pipeline
        .parameters()
        .register("P1", "toolA", threshold_options(5), "")
        .await
        .unwrap();
    let identity = pipeline.enqueue(&recording.id, paramset).await.unwrap().identity;

    let mut join_set = JoinSet::new();
    for i in 0..10 {
        let store = pipeline.store().clone();
        let identity = identity.clone();
        join_set.spawn(async move { store.claim(&identity, &format!("worker-{}", i)).await });
    }

    let mut winners = 0;
    let mut losers = 0;
    while let Some(result) = join_set.join_next().await {
        match result.unwrap() {
            Ok(job) => {
                assert_eq!(job.state, JobState::Running);
                winners += 1;
            }
            Err(SortError::InvalidTransition { .. }) => losers += 1,
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
    assert_eq!(winners, 1);
    assert_eq!(losers, 9);
}

#[tokio::test]
async fn test_transition_is_compare_and_set() {
    let env = TestEnv::new(&[("toolA", "ok", 3)]).await;
    let pipeline = &env.pipeline;
    let store = pipeline.store();

    let recording = pipeline.recordings().add(recording_spec("R1")).await.unwrap();
    let paramset = pipeline
        .parameters()
        .register("P1", "toolA", threshold_options(5), "")
        .await
        .unwrap();
    let identity = pipeline.enqueue(&recording.id, paramset).await.unwrap().identity;

    // Current state is PENDING, not RUNNING
    assert!(matches!(
        store.transition(&identity, JobState::Running, JobState::Succeeded).await,
        Err(SortError::InvalidTransition { .. })
    ));
    // Not an edge of the state machine at all
    assert!(matches!(
        store.transition(&identity, JobState::Succeeded, JobState::Pending).await,
        Err(SortError::InvalidTransition { .. })
    ));
    // Reset only applies to FAILED
    assert!(matches!(store.reset(&identity).await, Err(SortError::InvalidTransition { .. })));

    // RUNNING without an owner would never be picked up by a trigger
    assert!(matches!(
        store.transition(&identity, JobState::Pending, JobState::Running).await,
        Err(SortError::InvalidTransition { .. })
    ));
    assert_eq!(store.get(&identity).await.unwrap().state, JobState::Pending);

    let running = store.claim(&identity, "worker-1").await.unwrap();
    assert_eq!(running.state, JobState::Running);
    assert_eq!(running.worker_id.as_deref(), Some("worker-1"));
    assert!(running.started_at.is_some());
    assert!(running.heartbeat_at.is_some());
}

#[tokio::test]
async fn test_resume_after_tool_completed_runs_nothing() {
    let env = TestEnv::new(&[("toolA", "ok", 3)]).await;
    let pipeline = &env.pipeline;

    let recording = pipeline.recordings().add(recording_spec("R1")).await.unwrap();
    let paramset_id = pipeline
        .parameters()
        .register("P1", "toolA", threshold_options(5), "")
        .await
        .unwrap();
    let paramset = pipeline.parameters().get(paramset_id).await.unwrap();
    let tool = pipeline.catalog().require("toolA").unwrap().clone();
    let job = pipeline.enqueue(&recording.id, paramset_id).await.unwrap();
    pipeline.store().claim(&job.identity, pipeline.worker_id()).await.unwrap();

    // An earlier attempt finished the tool but stopped before recording success
    let workdir = WorkDir::for_job(pipeline.work_root(), &recording, &paramset, &tool, &job.identity);
    let manifest = Manifest {
        identity: job.identity.clone(),
        attempt: 1,
        sorter: tool.name.clone(),
        tool_version: tool.version.clone(),
        recording: "R1".to_string(),
        paramset: "P1".to_string(),
        created_at: ephys_common::time::timestamp_now(),
    };
    workdir
        .prepare(IoRetryPolicy::default(), &manifest, &recording, &paramset)
        .await
        .unwrap();
    std::fs::write(workdir.output_dir().join("units.tsv"), UNITS_TSV).unwrap();
    std::fs::write(workdir.output_dir().join("spike_times.tsv"), SPIKES_TSV).unwrap();
    workdir.mark_output_complete(IoRetryPolicy::default()).await.unwrap();

    let cancel = CancellationToken::new();
    let trigger = pipeline.trigger();

    let first = trigger
        .run(&job.identity, &recording, &paramset, &tool, &cancel)
        .await
        .unwrap();
    assert!(matches!(first, TriggerOutcome::Succeeded { resumed: true, .. }));

    let second = trigger
        .run(&job.identity, &recording, &paramset, &tool, &cancel)
        .await
        .unwrap();
    match second {
        TriggerOutcome::Skipped { job } => assert_eq!(job.state, JobState::Succeeded),
        other => panic!("expected no-op re-entry, got {:?}", other),
    }

    assert_eq!(env.invocations(), 0);
    assert!(!workdir.scratch_dir().exists());
    let result = pipeline.sort_result(&job.identity).await.unwrap();
    assert_eq!(result.units.len(), 2);
}

#[tokio::test]
async fn test_partial_and_foreign_leftovers_are_discarded() {
    let env = TestEnv::new(&[("toolA", "ok", 4)]).await;
    let pipeline = &env.pipeline;

    let recording = pipeline.recordings().add(recording_spec("R1")).await.unwrap();
    let paramset_id = pipeline
        .parameters()
        .register("P1", "toolA", threshold_options(5), "")
        .await
        .unwrap();
    let paramset = pipeline.parameters().get(paramset_id).await.unwrap();
    let tool = pipeline.catalog().require("toolA").unwrap().clone();
    let job = pipeline.enqueue(&recording.id, paramset_id).await.unwrap();

    let workdir = WorkDir::for_job(pipeline.work_root(), &recording, &paramset, &tool, &job.identity);
    // Leftover from a different identity that happens to share the short prefix directory
    let mut foreign = Manifest {
        identity: ephys_sort::models::JobIdentity("f".repeat(64)),
        attempt: 3,
        sorter: tool.name.clone(),
        tool_version: "0.9.0".to_string(),
        recording: "R1".to_string(),
        paramset: "P1".to_string(),
        created_at: ephys_common::time::timestamp_now(),
    };
    workdir
        .prepare(IoRetryPolicy::default(), &foreign, &recording, &paramset)
        .await
        .unwrap();
    std::fs::write(workdir.output_dir().join("units.tsv"), UNITS_TSV).unwrap();
    std::fs::write(workdir.output_dir().join("spike_times.tsv"), SPIKES_TSV).unwrap();

    let outcome = pipeline.run_job(&job.identity).await.unwrap();
    assert!(matches!(outcome, JobOutcome::Completed(_)));
    assert_eq!(env.invocations(), 1);
    // Output is the tool's, not the leftover
    assert_eq!(pipeline.sort_result(&job.identity).await.unwrap().units.len(), 4);

    // Partial output of the same identity: manifest matches, spike table missing
    let other_recording = pipeline.recordings().add(recording_spec("R2")).await.unwrap();
    let second = pipeline.enqueue(&other_recording.id, paramset_id).await.unwrap();
    let second_dir = WorkDir::for_job(pipeline.work_root(), &other_recording, &paramset, &tool, &second.identity);
    foreign.identity = second.identity.clone();
    foreign.recording = "R2".to_string();
    second_dir
        .prepare(IoRetryPolicy::default(), &foreign, &other_recording, &paramset)
        .await
        .unwrap();
    std::fs::write(second_dir.output_dir().join("units.tsv"), "garbage\n").unwrap();

    let outcome = pipeline.run_job(&second.identity).await.unwrap();
    assert!(matches!(outcome, JobOutcome::Completed(_)));
    assert_eq!(env.invocations(), 2);
}

#[tokio::test]
async fn test_output_without_clean_exit_is_rerun() {
    let env = TestEnv::new(&[("toolA", "ok", 4)]).await;
    let pipeline = &env.pipeline;

    let recording = pipeline.recordings().add(recording_spec("R1")).await.unwrap();
    let paramset_id = pipeline
        .parameters()
        .register("P1", "toolA", threshold_options(5), "")
        .await
        .unwrap();
    let paramset = pipeline.parameters().get(paramset_id).await.unwrap();
    let tool = pipeline.catalog().require("toolA").unwrap().clone();
    let job = pipeline.enqueue(&recording.id, paramset_id).await.unwrap();

    // Tool killed mid-write: every file parses, but it never exited cleanly
    let workdir = WorkDir::for_job(pipeline.work_root(), &recording, &paramset, &tool, &job.identity);
    let manifest = Manifest {
        identity: job.identity.clone(),
        attempt: 1,
        sorter: tool.name.clone(),
        tool_version: tool.version.clone(),
        recording: "R1".to_string(),
        paramset: "P1".to_string(),
        created_at: ephys_common::time::timestamp_now(),
    };
    workdir
        .prepare(IoRetryPolicy::default(), &manifest, &recording, &paramset)
        .await
        .unwrap();
    std::fs::write(workdir.output_dir().join("units.tsv"), UNITS_TSV).unwrap();
    std::fs::write(workdir.output_dir().join("spike_times.tsv"), "unit_id\tspike_time\n0\t0.5\n0\t1.\n").unwrap();

    let outcome = pipeline.run_job(&job.identity).await.unwrap();
    assert!(matches!(outcome, JobOutcome::Completed(_)));
    assert_eq!(env.invocations(), 1);
    assert_eq!(pipeline.sort_result(&job.identity).await.unwrap().units.len(), 4);
    assert!(workdir.complete_marker().exists());
}

#[tokio::test]
async fn test_reset_reruns_tool_after_failed_exit() {
    let env = TestEnv::new(&[("toolA", "fail_after_output", 3)]).await;
    let pipeline = &env.pipeline;

    let recording = pipeline.recordings().add(recording_spec("R1")).await.unwrap();
    let paramset = pipeline
        .parameters()
        .register("P1", "toolA", threshold_options(5), "")
        .await
        .unwrap();

    // Full, valid-looking output set, then a non-zero exit
    let outcome = pipeline.submit(&recording.id, paramset).await.unwrap();
    let job = match outcome {
        JobOutcome::Failed(job) => job,
        other => panic!("expected failure, got {:?}", other),
    };
    assert_eq!(job.failure_kind, Some(FailureKind::ToolRuntime));
    assert!(job.diagnostic.as_deref().unwrap().contains("post-processing failed"));

    let workdir = pipeline.working_dir(&job.identity).await.unwrap().unwrap();
    assert!(!workdir.join("output").exists());
    assert!(workdir.join("logs").join("sorter.log").exists());

    pipeline.reset(&job.identity).await.unwrap();
    let report = pipeline.run_pending().await.unwrap();
    assert_eq!(report.failed(), 1);

    // The second attempt ran the tool again instead of adopting the leftovers
    assert_eq!(env.invocations(), 2);
    let job = pipeline.status(&job.identity).await.unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.attempt, 2);
}

#[tokio::test]
async fn test_replaced_worker_cannot_commit() {
    let env = TestEnv::new(&[("toolA", "ok", 3)]).await;
    let pipeline = &env.pipeline;
    let store = pipeline.store();

    let recording = pipeline.recordings().add(recording_spec("R1")).await.unwrap();
    let paramset = pipeline
        .parameters()
        .register("P1", "toolA", threshold_options(5), "")
        .await
        .unwrap();
    let identity = pipeline.enqueue(&recording.id, paramset).await.unwrap().identity;

    store.claim(&identity, "worker-A").await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    let recovery = store.requeue_stale(Duration::from_millis(5)).await.unwrap();
    assert_eq!(recovery.requeued, vec![identity.clone()]);
    store.claim(&identity, "worker-B").await.unwrap();

    let output = env.dir.path().join("stale-output");
    assert!(matches!(
        store.mark_succeeded(&identity, "worker-A", &output).await,
        Err(SortError::InvalidTransition { .. })
    ));
    assert!(matches!(
        store
            .mark_failed(&identity, Some("worker-A"), FailureKind::ToolRuntime, "late failure")
            .await,
        Err(SortError::InvalidTransition { .. })
    ));

    let job = store.get(&identity).await.unwrap();
    assert_eq!(job.state, JobState::Running);
    assert_eq!(job.worker_id.as_deref(), Some("worker-B"));
    assert!(job.output_dir.is_none());

    let job = store.mark_succeeded(&identity, "worker-B", &output).await.unwrap();
    assert_eq!(job.state, JobState::Succeeded);
}

#[tokio::test]
async fn test_corrupt_complete_output_is_rerun() {
    let env = TestEnv::new(&[("toolA", "ok", 2)]).await;
    let pipeline = &env.pipeline;

    let recording = pipeline.recordings().add(recording_spec("R1")).await.unwrap();
    let paramset_id = pipeline
        .parameters()
        .register("P1", "toolA", threshold_options(5), "")
        .await
        .unwrap();
    let paramset = pipeline.parameters().get(paramset_id).await.unwrap();
    let tool = pipeline.catalog().require("toolA").unwrap().clone();
    let job = pipeline.enqueue(&recording.id, paramset_id).await.unwrap();

    let workdir = WorkDir::for_job(pipeline.work_root(), &recording, &paramset, &tool, &job.identity);
    let manifest = Manifest {
        identity: job.identity.clone(),
        attempt: 1,
        sorter: tool.name.clone(),
        tool_version: tool.version.clone(),
        recording: "R1".to_string(),
        paramset: "P1".to_string(),
        created_at: ephys_common::time::timestamp_now(),
    };
    workdir
        .prepare(IoRetryPolicy::default(), &manifest, &recording, &paramset)
        .await
        .unwrap();
    // Every expected file present, but spike counts disagree
    std::fs::write(workdir.output_dir().join("units.tsv"), "unit_id\tn_spikes\n0\t5\n").unwrap();
    std::fs::write(workdir.output_dir().join("spike_times.tsv"), "unit_id\tspike_time\n0\t0.1\n").unwrap();
    workdir.mark_output_complete(IoRetryPolicy::default()).await.unwrap();

    let outcome = pipeline.run_job(&job.identity).await.unwrap();
    assert!(matches!(outcome, JobOutcome::Completed(_)));
    assert_eq!(env.invocations(), 1);
    assert_eq!(pipeline.sort_result(&job.identity).await.unwrap().units.len(), 2);
}

#[tokio::test]
async fn test_stale_running_job_is_requeued_and_resumed() {
    let env = TestEnv::new(&[("toolA", "ok", 3)]).await;
    let pipeline = &env.pipeline;
    let store = pipeline.store();

    let recording = pipeline.recordings().add(recording_spec("R1")).await.unwrap();
    let paramset = pipeline
        .parameters()
        .register("P1", "toolA", threshold_options(5), "")
        .await
        .unwrap();
    let identity = pipeline.enqueue(&recording.id, paramset).await.unwrap().identity;

    // A worker that claims the job and then disappears
    store.claim(&identity, "crashed-worker").await.unwrap();
    assert!(!store.heartbeat(&identity, pipeline.worker_id()).await.unwrap());

    // Fresh heartbeat: startup recovery leaves it alone
    let recovery = pipeline.recover().await.unwrap();
    assert!(recovery.requeued.is_empty());

    tokio::time::sleep(Duration::from_millis(30)).await;
    let recovery = store.requeue_stale(Duration::from_millis(5)).await.unwrap();
    assert_eq!(recovery.requeued, vec![identity.clone()]);

    let job = store.get(&identity).await.unwrap();
    assert_eq!(job.state, JobState::Pending);
    assert!(job.diagnostic.as_deref().unwrap().starts_with("interrupted"));

    let report = pipeline.run_pending().await.unwrap();
    assert_eq!(report.succeeded(), 1);
    let job = store.get(&identity).await.unwrap();
    assert_eq!(job.state, JobState::Succeeded);
    assert!(job.diagnostic.is_none());
}

#[tokio::test]
async fn test_stale_job_with_pending_cancel_fails() {
    let env = TestEnv::new(&[("toolA", "ok", 3)]).await;
    let pipeline = &env.pipeline;
    let store = pipeline.store();

    let recording = pipeline.recordings().add(recording_spec("R1")).await.unwrap();
    let paramset = pipeline
        .parameters()
        .register("P1", "toolA", threshold_options(5), "")
        .await
        .unwrap();
    let identity = pipeline.enqueue(&recording.id, paramset).await.unwrap().identity;

    store.claim(&identity, "crashed-worker").await.unwrap();
    store.request_cancel(&identity).await.unwrap();
    assert!(store.is_cancel_requested(&identity).await.unwrap());

    tokio::time::sleep(Duration::from_millis(30)).await;
    let recovery = store.requeue_stale(Duration::from_millis(5)).await.unwrap();
    assert!(recovery.requeued.is_empty());
    assert_eq!(recovery.failed, vec![identity.clone()]);

    let job = store.get(&identity).await.unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.failure_kind, Some(FailureKind::Interrupted));

    // Reset clears the flag and makes the job runnable
    let job = store.reset(&identity).await.unwrap();
    assert!(!job.cancel_requested);
    assert_eq!(job.attempt, 2);
}
