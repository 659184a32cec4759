//! Priority-FIFO scheduler with VRAM-aware admission.
//!
//! The [`Scheduler`] owns the job table and drives jobs through the
//! status state machine. Each spawned task runs exactly one attempt;
//! a retry puts the job back to `Pending` so the next attempt passes
//! through admission control again. Insufficient headroom defers
//! dispatch (backpressure, never an error), and the circuit breaker
//! guards submissions after consecutive backend failures.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use renderq_core::backend::{BackendError, JobHandle, RenderBackend};
use renderq_core::job::{Job, JobId, JobStatus};
use renderq_core::policy::QueuePolicy;
use renderq_core::telemetry::{render_log_line, AttemptTelemetry, ExitReason, JobRecord, RunRecord};
use renderq_monitor::{ResourceMonitor, ResourceReading};

use crate::breaker::CircuitBreaker;
use crate::collector::AttemptObserver;
use crate::detector;
use crate::marker;
use crate::retry::{self, RetryDecision};

/// Where a run's files live.
#[derive(Debug, Clone)]
pub struct RunDirs {
    /// Directory the producer writes output frames and markers into.
    pub output_dir: PathBuf,
    /// Directory forced-copy recovery lands in.
    pub recovery_dir: PathBuf,
}

/// Source of headroom readings for admission control.
///
/// [`ResourceMonitor`] is the production implementation; tests swap in
/// scripted fakes.
#[async_trait::async_trait]
pub trait HeadroomSource: Send + Sync {
    async fn snapshot(&self) -> ResourceReading;
}

#[async_trait::async_trait]
impl HeadroomSource for ResourceMonitor {
    async fn snapshot(&self) -> ResourceReading {
        ResourceMonitor::snapshot(self).await
    }
}

/// Outcome of the admission check for one dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admit { unknown_headroom: bool },
    Defer { headroom_mb: Option<u64> },
}

/// Decide admission from a headroom reading.
///
/// Known headroom compares against the policy floor. Unknown headroom
/// admits or defers per `proceed_on_unknown_headroom`; deferral is
/// backpressure, never a job failure.
pub fn evaluate_admission(policy: &QueuePolicy, reading: &ResourceReading) -> Admission {
    match reading.headroom_mb() {
        Some(headroom) if headroom >= policy.min_headroom_mb => {
            Admission::Admit { unknown_headroom: false }
        }
        Some(headroom) => Admission::Defer { headroom_mb: Some(headroom) },
        None if policy.proceed_on_unknown_headroom => Admission::Admit { unknown_headroom: true },
        None => Admission::Defer { headroom_mb: None },
    }
}

struct JobEntry {
    job: Job,
    attempts: Vec<AttemptTelemetry>,
    cancel: CancellationToken,
    /// Enqueue order, the FIFO tiebreaker within a priority tier.
    seq: u64,
}

#[derive(Default)]
struct SchedulerState {
    entries: Vec<JobEntry>,
    next_seq: u64,
    log_lines: Vec<String>,
}

impl SchedulerState {
    fn entry_mut(&mut self, id: &JobId) -> Option<&mut JobEntry> {
        self.entries.iter_mut().find(|e| e.job.id == *id)
    }
}

/// Drives enqueued jobs to a terminal status against one backend.
pub struct Scheduler {
    policy: QueuePolicy,
    backend: Arc<dyn RenderBackend>,
    monitor: Arc<dyn HeadroomSource>,
    dirs: RunDirs,
    breaker: CircuitBreaker,
    state: Mutex<SchedulerState>,
}

impl Scheduler {
    pub fn new(
        policy: QueuePolicy,
        backend: Arc<dyn RenderBackend>,
        monitor: Arc<dyn HeadroomSource>,
        dirs: RunDirs,
    ) -> Arc<Self> {
        let breaker = CircuitBreaker::new(
            policy.breaker_failure_threshold,
            policy.breaker_cooldown(),
        );
        Arc::new(Self {
            policy,
            backend,
            monitor,
            dirs,
            breaker,
            state: Mutex::new(SchedulerState::default()),
        })
    }

    /// Add a job to the queue. It starts `Pending` regardless of the
    /// status it arrived with.
    pub fn enqueue(&self, mut job: Job) -> JobId {
        job.status = JobStatus::Pending;
        let id = job.id.clone();
        let mut state = self.state.lock().expect("scheduler mutex poisoned");
        let seq = state.next_seq;
        state.next_seq += 1;
        tracing::info!(job_id = %id, priority = ?job.priority, "Job enqueued");
        state.entries.push(JobEntry {
            job,
            attempts: Vec::new(),
            cancel: CancellationToken::new(),
            seq,
        });
        id
    }

    /// Cancel a job. Pending and queued jobs go terminal immediately;
    /// running jobs get their token fired and finish as cancelled once
    /// the in-flight attempt unwinds. Returns `false` for unknown or
    /// already-terminal jobs.
    pub fn cancel(&self, id: &JobId) -> bool {
        let mut state = self.state.lock().expect("scheduler mutex poisoned");
        let Some(entry) = state.entry_mut(id) else {
            return false;
        };
        match entry.job.status {
            JobStatus::Pending | JobStatus::Queued => {
                entry.cancel.cancel();
                // Valid from both states.
                let _ = entry.job.transition(JobStatus::Cancelled);
                tracing::info!(job_id = %id, "Job cancelled before dispatch");
                true
            }
            JobStatus::Running => {
                entry.cancel.cancel();
                tracing::info!(job_id = %id, "Cancellation requested for running job");
                true
            }
            _ => false,
        }
    }

    /// Current status of a job, if it is known to the scheduler.
    pub fn status(&self, id: &JobId) -> Option<JobStatus> {
        let mut state = self.state.lock().expect("scheduler mutex poisoned");
        state.entry_mut(id).map(|e| e.job.status)
    }

    /// Human-readable attempt log lines emitted so far, in order.
    pub fn log_lines(&self) -> Vec<String> {
        self.state
            .lock()
            .expect("scheduler mutex poisoned")
            .log_lines
            .clone()
    }

    /// Run every enqueued job to a terminal status and return the run
    /// record. New jobs may be enqueued while draining; they are
    /// picked up until the queue is empty.
    pub async fn drain(self: &Arc<Self>) -> RunRecord {
        let started_at = Utc::now();
        let mut tasks: JoinSet<()> = JoinSet::new();

        loop {
            while let Some(result) = tasks.try_join_next() {
                if let Err(e) = result {
                    tracing::error!(error = %e, "Attempt task panicked");
                }
            }

            if self.active_count() < self.policy.max_concurrency {
                if let Some(job_id) = self.next_pending() {
                    let reading = self.monitor.snapshot().await;
                    match evaluate_admission(&self.policy, &reading) {
                        Admission::Admit { unknown_headroom } => {
                            if unknown_headroom {
                                tracing::warn!(
                                    job_id = %job_id,
                                    "Headroom unknown, admitting per policy",
                                );
                            }
                            if self.mark_queued(&job_id) {
                                let scheduler = Arc::clone(self);
                                let id = job_id.clone();
                                tasks.spawn(async move {
                                    scheduler.run_attempt(id).await;
                                });
                            }
                            continue;
                        }
                        Admission::Defer { headroom_mb } => {
                            tracing::info!(
                                job_id = %job_id,
                                headroom_mb = ?headroom_mb,
                                min_headroom_mb = self.policy.min_headroom_mb,
                                "Dispatch deferred: insufficient headroom",
                            );
                            tokio::time::sleep(self.policy.poll_interval()).await;
                            continue;
                        }
                    }
                }
            }

            if tasks.is_empty() {
                if self.next_pending().is_none() {
                    break;
                }
                continue;
            }
            if let Some(result) = tasks.join_next().await {
                if let Err(e) = result {
                    tracing::error!(error = %e, "Attempt task panicked");
                }
            }
        }

        let state = self.state.lock().expect("scheduler mutex poisoned");
        RunRecord {
            policy: self.policy.clone(),
            started_at,
            finished_at: Utc::now(),
            jobs: state
                .entries
                .iter()
                .map(|e| JobRecord {
                    job: e.job.clone(),
                    attempts: e.attempts.clone(),
                })
                .collect(),
        }
    }

    fn active_count(&self) -> usize {
        let state = self.state.lock().expect("scheduler mutex poisoned");
        state
            .entries
            .iter()
            .filter(|e| matches!(e.job.status, JobStatus::Queued | JobStatus::Running))
            .count()
    }

    /// Next dispatchable job: highest priority tier first, FIFO within
    /// the tier.
    fn next_pending(&self) -> Option<JobId> {
        let state = self.state.lock().expect("scheduler mutex poisoned");
        state
            .entries
            .iter()
            .filter(|e| e.job.status == JobStatus::Pending)
            .min_by_key(|e| (e.job.priority, e.seq))
            .map(|e| e.job.id.clone())
    }

    fn mark_queued(&self, id: &JobId) -> bool {
        let mut state = self.state.lock().expect("scheduler mutex poisoned");
        match state.entry_mut(id) {
            Some(entry) => entry.job.transition(JobStatus::Queued).is_ok(),
            None => false,
        }
    }

    /// Run one attempt of one job end to end: state transitions,
    /// telemetry bracketing, execution, and the retry decision.
    async fn run_attempt(&self, job_id: JobId) {
        let Some((payload, prefix, cancel, attempt_no)) = self.begin_attempt(&job_id) else {
            // Cancelled between admission and dispatch.
            return;
        };

        let mut observer = AttemptObserver::new(&self.policy);
        observer.record_before(self.monitor.snapshot().await);

        let (exit_reason, succeeded) = self
            .execute_attempt(&job_id, &payload, &prefix, &cancel, &mut observer)
            .await;

        observer.record_after(self.monitor.snapshot().await);
        let telemetry = observer.finalize(exit_reason);
        self.finish_attempt(&job_id, attempt_no, exit_reason, succeeded, telemetry);
    }

    /// Flip the job to `Running` and charge one attempt against the
    /// budget. `None` when the job was cancelled before dispatch.
    fn begin_attempt(
        &self,
        job_id: &JobId,
    ) -> Option<(serde_json::Value, String, CancellationToken, u32)> {
        let mut state = self.state.lock().expect("scheduler mutex poisoned");
        let entry = state.entry_mut(job_id)?;
        if entry.job.status != JobStatus::Queued {
            return None;
        }
        if entry.job.transition(JobStatus::Running).is_err() {
            return None;
        }
        entry.job.attempts_used += 1;
        tracing::info!(
            job_id = %job_id,
            attempt = entry.job.attempts_used,
            "Attempt starting",
        );
        Some((
            entry.job.payload.clone(),
            entry.job.output_prefix.clone(),
            entry.cancel.clone(),
            entry.job.attempts_used,
        ))
    }

    async fn execute_attempt(
        &self,
        job_id: &JobId,
        payload: &serde_json::Value,
        prefix: &str,
        cancel: &CancellationToken,
        observer: &mut AttemptObserver,
    ) -> (ExitReason, bool) {
        if let Err(rejected) = self.breaker.check() {
            tracing::warn!(
                job_id = %job_id,
                consecutive_failures = rejected.consecutive_failures,
                "Submission rejected by open circuit breaker",
            );
            return (ExitReason::BackendError, false);
        }

        // Subscribe before submitting so early push events land in the
        // receiver's backlog instead of being missed.
        let events = self.backend.subscribe();
        let handle = match self.backend.submit(payload).await {
            Ok(handle) => {
                self.breaker.on_success();
                tracing::info!(job_id = %job_id, handle = %handle, "Workflow submitted");
                handle
            }
            Err(BackendError::Unavailable(reason)) => {
                self.breaker.on_failure();
                tracing::warn!(job_id = %job_id, reason = %reason, "Submission failed, backend unavailable");
                return (ExitReason::BackendError, false);
            }
            Err(BackendError::Protocol(reason)) => {
                tracing::error!(job_id = %job_id, reason = %reason, "Submission failed, protocol error");
                return (ExitReason::BackendError, false);
            }
        };

        let outcome = detector::detect(self.backend.as_ref(), &handle, &self.policy, events, cancel).await;
        observer.set_detector(&outcome);

        match outcome.exit_reason {
            ExitReason::Success => {
                self.settle_marker(job_id, &handle, prefix, cancel, outcome.outputs_seen, observer)
                    .await
            }
            ExitReason::Cancelled => {
                self.cancel_remote(job_id, &handle).await;
                (ExitReason::Cancelled, false)
            }
            other => (other, false),
        }
    }

    /// Post-resolution phase: wait for the done marker within the
    /// grace window, falling back to forced copy when it never lands
    /// and the backend recorded output artifacts for the attempt.
    async fn settle_marker(
        &self,
        job_id: &JobId,
        handle: &JobHandle,
        prefix: &str,
        cancel: &CancellationToken,
        mut outputs_seen: bool,
        observer: &mut AttemptObserver,
    ) -> (ExitReason, bool) {
        let wait = marker::wait_for_marker(
            &self.dirs.output_dir,
            prefix,
            self.policy.post_completion_grace(),
            cancel,
        )
        .await;
        observer.set_marker(wait.detected);

        if wait.detected {
            return (ExitReason::Success, true);
        }
        if cancel.is_cancelled() {
            return (ExitReason::Cancelled, false);
        }

        // A push-resolved attempt may never have polled; one extra poll
        // settles whether the producer recorded any output.
        if !outputs_seen {
            match self.backend.poll_status(handle).await {
                Ok(status) => outputs_seen = status.outputs_present,
                Err(e) => {
                    tracing::warn!(job_id = %job_id, error = %e, "Post-grace status poll failed");
                }
            }
        }
        if !outputs_seen {
            tracing::warn!(
                job_id = %job_id,
                grace_secs = self.policy.post_completion_grace_secs,
                "Done marker never committed and the backend recorded no output, skipping recovery scan",
            );
            return (ExitReason::TimeoutPostCompletionGrace, false);
        }

        tracing::warn!(
            job_id = %job_id,
            grace_secs = self.policy.post_completion_grace_secs,
            "Done marker never committed within grace window, scanning for output",
        );
        match marker::forced_copy(&self.dirs.output_dir, prefix, &self.dirs.recovery_dir) {
            Ok(Some(recovered)) => {
                tracing::warn!(
                    job_id = %job_id,
                    copied = recovered.copied.len(),
                    dump = %recovered.dump_path.display(),
                    "Output recovered via forced copy",
                );
                observer.set_forced_copy();
                (ExitReason::TimeoutPostCompletionGrace, true)
            }
            Ok(None) => {
                tracing::warn!(job_id = %job_id, "No recoverable output found");
                (ExitReason::TimeoutPostCompletionGrace, false)
            }
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Forced-copy scan failed");
                (ExitReason::TimeoutPostCompletionGrace, false)
            }
        }
    }

    async fn cancel_remote(&self, job_id: &JobId, handle: &JobHandle) {
        if let Err(e) = self.backend.cancel(handle).await {
            tracing::warn!(job_id = %job_id, error = %e, "Remote cancellation failed");
        }
    }

    /// Record telemetry, emit the attempt log line, and apply the
    /// terminal-or-retry transition.
    fn finish_attempt(
        &self,
        job_id: &JobId,
        attempt_no: u32,
        exit_reason: ExitReason,
        succeeded: bool,
        telemetry: AttemptTelemetry,
    ) {
        let mut state = self.state.lock().expect("scheduler mutex poisoned");
        let line = render_log_line(&job_id.0, attempt_no, &telemetry);
        tracing::info!("{line}");
        state.log_lines.push(line);

        let Some(entry) = state.entry_mut(job_id) else {
            return;
        };
        entry.attempts.push(telemetry);

        let target = if succeeded {
            JobStatus::Succeeded
        } else if exit_reason == ExitReason::Cancelled {
            JobStatus::Cancelled
        } else {
            match retry::decide(&entry.job, exit_reason) {
                RetryDecision::Retry => {
                    tracing::info!(
                        job_id = %job_id,
                        attempt = attempt_no,
                        exit = exit_reason.as_str(),
                        "Attempt failed, requeueing for retry",
                    );
                    JobStatus::Pending
                }
                RetryDecision::Fail => JobStatus::Failed,
            }
        };
        if let Err(e) = entry.job.transition(target) {
            tracing::error!(job_id = %job_id, error = %e, "Status transition rejected");
        } else {
            tracing::info!(job_id = %job_id, status = ?entry.job.status, "Attempt settled");
        }
    }
}
