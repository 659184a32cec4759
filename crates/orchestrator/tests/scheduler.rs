//! End-to-end scheduler runs against scripted backend and monitor
//! fakes, under a paused clock so timeout windows are exact.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;

use renderq_core::backend::{BackendError, BackendEvent, JobHandle, JobPhase, PollStatus, RenderBackend};
use renderq_core::job::{Job, JobId, JobPriority, JobStatus};
use renderq_core::marker::write_done_marker;
use renderq_core::policy::QueuePolicy;
use renderq_core::telemetry::{CompletionChannel, ExitReason, ResourceSource};
use renderq_core::validator::validate_run;
use renderq_monitor::ResourceReading;
use renderq_orchestrator::{HeadroomSource, RunDirs, Scheduler};

/// Backend whose behavior is fixed up front: submissions can fail
/// outright, and polls report success only from a given submission
/// number onward, after a given number of polls into that attempt.
struct FakeBackend {
    event_tx: broadcast::Sender<BackendEvent>,
    submissions: AtomicU32,
    polls_this_attempt: AtomicU32,
    cancels: AtomicU32,
    fail_submit: bool,
    /// 1-based submission number from which polls may succeed; 0
    /// means polls never succeed.
    succeed_on_submission: u32,
    /// Polls into the succeeding attempt before success is reported.
    after_polls: u32,
}

impl FakeBackend {
    fn new(succeed_on_submission: u32, after_polls: u32) -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(16);
        Arc::new(Self {
            event_tx,
            submissions: AtomicU32::new(0),
            polls_this_attempt: AtomicU32::new(0),
            cancels: AtomicU32::new(0),
            fail_submit: false,
            succeed_on_submission,
            after_polls,
        })
    }

    fn failing_submit() -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(16);
        Arc::new(Self {
            event_tx,
            submissions: AtomicU32::new(0),
            polls_this_attempt: AtomicU32::new(0),
            cancels: AtomicU32::new(0),
            fail_submit: true,
            succeed_on_submission: 0,
            after_polls: 0,
        })
    }
}

#[async_trait::async_trait]
impl RenderBackend for FakeBackend {
    async fn submit(&self, _payload: &serde_json::Value) -> Result<JobHandle, BackendError> {
        if self.fail_submit {
            return Err(BackendError::Unavailable("connection refused".into()));
        }
        let n = self.submissions.fetch_add(1, Ordering::SeqCst) + 1;
        self.polls_this_attempt.store(0, Ordering::SeqCst);
        Ok(JobHandle(format!("prompt-{n}")))
    }

    async fn poll_status(&self, _handle: &JobHandle) -> Result<PollStatus, BackendError> {
        let polls = self.polls_this_attempt.fetch_add(1, Ordering::SeqCst) + 1;
        let submission = self.submissions.load(Ordering::SeqCst);
        let done = self.succeed_on_submission > 0
            && submission >= self.succeed_on_submission
            && polls >= self.after_polls;
        Ok(PollStatus {
            found: done,
            succeeded: done,
            outputs_present: done,
        })
    }

    async fn cancel(&self, _handle: &JobHandle) -> Result<(), BackendError> {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<BackendEvent> {
        self.event_tx.subscribe()
    }
}

/// Monitor reporting low headroom for the first `low_for` snapshots,
/// then plenty.
struct FakeMonitor {
    calls: AtomicU32,
    low_for: u32,
}

impl FakeMonitor {
    fn new(low_for: u32) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            low_for,
        })
    }
}

#[async_trait::async_trait]
impl HeadroomSource for FakeMonitor {
    async fn snapshot(&self) -> ResourceReading {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let (used, total) = if n <= self.low_for {
            (7936, 8192)
        } else {
            (2048, 24576)
        };
        ResourceReading {
            used_mb: Some(used),
            total_mb: Some(total),
            source: ResourceSource::Primary,
            notes: Vec::new(),
        }
    }
}

fn test_policy() -> QueuePolicy {
    QueuePolicy {
        max_wait_secs: 5.0,
        poll_interval_secs: 1.0,
        max_poll_attempts: 60,
        post_completion_grace_secs: 2.0,
        retry_budget: 1,
        min_headroom_mb: 1024,
        ..Default::default()
    }
}

fn test_job(id: &str) -> Job {
    Job::new(
        JobId(id.into()),
        JobPriority::Normal,
        serde_json::json!({"3": {"class_type": "KSampler", "inputs": {"steps": 20}}}),
    )
}

fn run_dirs(output: &tempfile::TempDir, recovery: &tempfile::TempDir) -> RunDirs {
    RunDirs {
        output_dir: output.path().to_path_buf(),
        recovery_dir: recovery.path().to_path_buf(),
    }
}

#[tokio::test(start_paused = true)]
async fn transient_timeout_retries_and_succeeds() {
    let output = tempfile::tempdir().unwrap();
    let recovery = tempfile::tempdir().unwrap();
    // First attempt never resolves; second resolves on its second poll.
    let backend = FakeBackend::new(2, 2);
    let monitor = FakeMonitor::new(0);

    let scheduler = Scheduler::new(
        test_policy(),
        backend.clone(),
        monitor,
        run_dirs(&output, &recovery),
    );
    let id = scheduler.enqueue(test_job("scene-001"));
    write_done_marker(output.path(), "scene-001", Some(25)).unwrap();

    let record = scheduler.drain().await;

    assert_eq!(scheduler.status(&id), Some(JobStatus::Succeeded));
    let job_record = &record.jobs[0];
    assert_eq!(job_record.job.attempts_used, 2);
    assert_eq!(job_record.attempts.len(), 2);

    let first = &job_record.attempts[0];
    assert_eq!(first.exit_reason, ExitReason::TimeoutMaxWait);
    assert!(!first.execution_success_detected);
    assert!(first.duration_secs >= 5.0);

    let second = &job_record.attempts[1];
    assert_eq!(second.exit_reason, ExitReason::Success);
    assert_eq!(second.resolved_via, Some(CompletionChannel::Pull));
    assert_eq!(second.poll_attempts, 2);
    assert!(second.done_marker_detected);
    assert!(!second.forced_copy_triggered);

    // The run record and log lines satisfy the offline contract.
    let violations = validate_run(&record, &scheduler.log_lines());
    assert!(violations.is_empty(), "unexpected violations: {violations:?}");
}

#[tokio::test(start_paused = true)]
async fn low_headroom_defers_dispatch_without_failing_the_job() {
    let output = tempfile::tempdir().unwrap();
    let recovery = tempfile::tempdir().unwrap();
    let backend = FakeBackend::new(1, 1);
    // Three low readings before headroom recovers.
    let monitor = FakeMonitor::new(3);

    let scheduler = Scheduler::new(
        test_policy(),
        backend,
        monitor.clone(),
        run_dirs(&output, &recovery),
    );
    let id = scheduler.enqueue(test_job("scene-002"));
    write_done_marker(output.path(), "scene-002", None).unwrap();

    let start = tokio::time::Instant::now();
    let record = scheduler.drain().await;

    assert_eq!(scheduler.status(&id), Some(JobStatus::Succeeded));
    // Deferral is backpressure: one attempt, no failure telemetry.
    assert_eq!(record.jobs[0].attempts.len(), 1);
    assert_eq!(record.jobs[0].attempts[0].exit_reason, ExitReason::Success);
    // Three deferred dispatch checks, one admitted, plus the per-attempt
    // before/after snapshots.
    assert_eq!(monitor.calls.load(Ordering::SeqCst), 6);
    // Each deferral waited one poll interval.
    assert!(start.elapsed() >= std::time::Duration::from_secs(3));
}

#[tokio::test(start_paused = true)]
async fn missing_marker_recovers_output_via_forced_copy() {
    let output = tempfile::tempdir().unwrap();
    let recovery = tempfile::tempdir().unwrap();
    let backend = FakeBackend::new(1, 1);
    let monitor = FakeMonitor::new(0);

    let scheduler = Scheduler::new(
        test_policy(),
        backend,
        monitor,
        run_dirs(&output, &recovery),
    );
    let id = scheduler.enqueue(test_job("scene-003"));
    // Output exists but the producer never commits the marker.
    std::fs::write(output.path().join("scene-003_00001.mp4"), b"frames").unwrap();

    let record = scheduler.drain().await;

    assert_eq!(scheduler.status(&id), Some(JobStatus::Succeeded));
    let attempt = &record.jobs[0].attempts[0];
    assert_eq!(attempt.exit_reason, ExitReason::TimeoutPostCompletionGrace);
    assert!(!attempt.done_marker_detected);
    assert!(attempt.forced_copy_triggered);
    assert!(attempt.done_marker_wait_secs >= 2.0);

    assert!(recovery.path().join("scene-003_00001.mp4").exists());
    let dump = std::fs::read_to_string(recovery.path().join("scene-003.recovery.json")).unwrap();
    let dump: serde_json::Value = serde_json::from_str(&dump).unwrap();
    assert!(!dump["candidates"].as_array().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn missing_marker_and_no_output_fails_the_attempt() {
    let output = tempfile::tempdir().unwrap();
    let recovery = tempfile::tempdir().unwrap();
    let backend = FakeBackend::new(1, 1);
    let monitor = FakeMonitor::new(0);

    let policy = QueuePolicy {
        retry_budget: 0,
        ..test_policy()
    };
    let scheduler = Scheduler::new(policy, backend, monitor, run_dirs(&output, &recovery));
    let id = scheduler.enqueue(test_job("scene-004").with_retry_budget(0));

    let record = scheduler.drain().await;

    assert_eq!(scheduler.status(&id), Some(JobStatus::Failed));
    let attempt = &record.jobs[0].attempts[0];
    assert_eq!(attempt.exit_reason, ExitReason::TimeoutPostCompletionGrace);
    assert!(attempt.execution_success_detected);
    assert!(!attempt.forced_copy_triggered);
}

#[tokio::test(start_paused = true)]
async fn forced_copy_requires_backend_output_evidence() {
    let output = tempfile::tempdir().unwrap();
    let recovery = tempfile::tempdir().unwrap();
    // Polls never succeed and never report outputs; completion arrives
    // via the event stream only.
    let backend = FakeBackend::new(0, 0);
    let monitor = FakeMonitor::new(0);

    let policy = QueuePolicy {
        retry_budget: 0,
        ..test_policy()
    };
    let scheduler = Scheduler::new(
        policy,
        backend.clone(),
        monitor,
        run_dirs(&output, &recovery),
    );
    let id = scheduler.enqueue(test_job("scene-008").with_retry_budget(0));
    // A stale file matches the prefix, but the backend recorded no
    // outputs for this execution.
    std::fs::write(output.path().join("scene-008_00001.mp4"), b"stale").unwrap();

    let sender = tokio::spawn({
        let tx = backend.event_tx.clone();
        async move {
            tokio::time::sleep(std::time::Duration::from_millis(500)).await;
            tx.send(BackendEvent {
                handle: JobHandle("prompt-1".into()),
                phase: JobPhase::Completed,
                detail: None,
            })
            .unwrap();
        }
    });

    let record = scheduler.drain().await;
    sender.await.unwrap();

    assert_eq!(scheduler.status(&id), Some(JobStatus::Failed));
    let attempt = &record.jobs[0].attempts[0];
    assert_eq!(attempt.exit_reason, ExitReason::TimeoutPostCompletionGrace);
    assert_eq!(attempt.resolved_via, Some(CompletionChannel::Push));
    assert!(!attempt.forced_copy_triggered);
    // No recovery scan ran: nothing was copied and no dump was written.
    assert!(!recovery.path().join("scene-008_00001.mp4").exists());
    assert!(!recovery.path().join("scene-008.recovery.json").exists());
}

#[tokio::test(start_paused = true)]
async fn backend_error_detail_reaches_the_run_record() {
    let output = tempfile::tempdir().unwrap();
    let recovery = tempfile::tempdir().unwrap();
    let backend = FakeBackend::new(0, 0);
    let monitor = FakeMonitor::new(0);

    let policy = QueuePolicy {
        retry_budget: 0,
        ..test_policy()
    };
    let scheduler = Scheduler::new(
        policy,
        backend.clone(),
        monitor,
        run_dirs(&output, &recovery),
    );
    let id = scheduler.enqueue(test_job("scene-009").with_retry_budget(0));

    let sender = tokio::spawn({
        let tx = backend.event_tx.clone();
        async move {
            tokio::time::sleep(std::time::Duration::from_millis(500)).await;
            tx.send(BackendEvent {
                handle: JobHandle("prompt-1".into()),
                phase: JobPhase::Errored,
                detail: Some("CUDA out of memory".into()),
            })
            .unwrap();
        }
    });

    let record = scheduler.drain().await;
    sender.await.unwrap();

    assert_eq!(scheduler.status(&id), Some(JobStatus::Failed));
    let attempt = &record.jobs[0].attempts[0];
    assert_eq!(attempt.exit_reason, ExitReason::BackendError);
    assert_eq!(
        attempt.backend_error_detail.as_deref(),
        Some("CUDA out of memory"),
    );

    let violations = validate_run(&record, &scheduler.log_lines());
    assert!(violations.is_empty(), "unexpected violations: {violations:?}");
}

#[tokio::test(start_paused = true)]
async fn cancelling_a_running_job_interrupts_the_backend() {
    let output = tempfile::tempdir().unwrap();
    let recovery = tempfile::tempdir().unwrap();
    // Never resolves; only cancellation can end the attempt.
    let backend = FakeBackend::new(0, 0);
    let monitor = FakeMonitor::new(0);

    let scheduler = Scheduler::new(
        QueuePolicy {
            max_wait_secs: 300.0,
            ..test_policy()
        },
        backend.clone(),
        monitor,
        run_dirs(&output, &recovery),
    );
    let id = scheduler.enqueue(test_job("scene-005"));

    let canceller = tokio::spawn({
        let scheduler = scheduler.clone();
        let id = id.clone();
        async move {
            tokio::time::sleep(std::time::Duration::from_secs(2)).await;
            assert!(scheduler.cancel(&id));
        }
    });

    let record = scheduler.drain().await;
    canceller.await.unwrap();

    assert_eq!(scheduler.status(&id), Some(JobStatus::Cancelled));
    assert_eq!(record.jobs[0].attempts[0].exit_reason, ExitReason::Cancelled);
    assert_eq!(backend.cancels.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn open_breaker_rejects_submissions_without_touching_the_backend() {
    let output = tempfile::tempdir().unwrap();
    let recovery = tempfile::tempdir().unwrap();
    let backend = FakeBackend::failing_submit();
    let monitor = FakeMonitor::new(0);

    let policy = QueuePolicy {
        retry_budget: 3,
        breaker_failure_threshold: 2,
        breaker_cooldown_secs: 3600.0,
        ..test_policy()
    };
    let scheduler = Scheduler::new(
        policy,
        backend.clone(),
        monitor,
        run_dirs(&output, &recovery),
    );
    let id = scheduler.enqueue(test_job("scene-006").with_retry_budget(3));

    let record = scheduler.drain().await;

    assert_eq!(scheduler.status(&id), Some(JobStatus::Failed));
    let attempts = &record.jobs[0].attempts;
    assert_eq!(attempts.len(), 4);
    assert!(attempts
        .iter()
        .all(|a| a.exit_reason == ExitReason::BackendError));
    // Attempts three and four were rejected by the open breaker before
    // reaching the wire.
    assert_eq!(backend.submissions.load(Ordering::SeqCst), 0);

    let violations = validate_run(&record, &scheduler.log_lines());
    assert!(violations.is_empty(), "unexpected violations: {violations:?}");
}

#[tokio::test(start_paused = true)]
async fn high_priority_jobs_dispatch_first() {
    let output = tempfile::tempdir().unwrap();
    let recovery = tempfile::tempdir().unwrap();
    let backend = FakeBackend::new(1, 1);
    let monitor = FakeMonitor::new(0);

    let scheduler = Scheduler::new(
        test_policy(),
        backend,
        monitor,
        run_dirs(&output, &recovery),
    );
    let low = scheduler.enqueue(test_job("scene-low"));
    let high = scheduler.enqueue(test_job("scene-high").with_priority(JobPriority::High));
    write_done_marker(output.path(), "scene-low", None).unwrap();
    write_done_marker(output.path(), "scene-high", None).unwrap();

    let record = scheduler.drain().await;

    assert_eq!(scheduler.status(&high), Some(JobStatus::Succeeded));
    assert_eq!(scheduler.status(&low), Some(JobStatus::Succeeded));
    let high_record = record.jobs.iter().find(|j| j.job.id == high).unwrap();
    let low_record = record.jobs.iter().find(|j| j.job.id == low).unwrap();
    assert!(high_record.attempts[0].started_at <= low_record.attempts[0].started_at);
}

#[tokio::test(start_paused = true)]
async fn cancelling_a_pending_job_records_no_attempts() {
    let output = tempfile::tempdir().unwrap();
    let recovery = tempfile::tempdir().unwrap();
    let backend = FakeBackend::new(1, 1);
    let monitor = FakeMonitor::new(0);

    let scheduler = Scheduler::new(
        test_policy(),
        backend,
        monitor,
        run_dirs(&output, &recovery),
    );
    let id = scheduler.enqueue(test_job("scene-007"));
    assert!(scheduler.cancel(&id));
    assert!(!scheduler.cancel(&id));

    let record = scheduler.drain().await;
    assert_eq!(scheduler.status(&id), Some(JobStatus::Cancelled));
    assert!(record.jobs[0].attempts.is_empty());
}
