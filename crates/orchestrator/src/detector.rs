//! Completion detection for one job attempt.
//!
//! Two channels may independently observe completion: the backend's
//! push events and the idempotent status poll. [`ResolutionSlot`] is
//! the single-assignment guard that makes the race harmless -- the
//! first signal wins, records its channel, and every later signal is
//! ignored. [`detect`] drives both channels until resolution or one
//! of the policy-bounded timeouts.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use renderq_core::backend::{BackendEvent, JobHandle, JobPhase, RenderBackend};
use renderq_core::policy::QueuePolicy;
use renderq_core::telemetry::{CompletionChannel, ExitReason, PollLogEntry};

/// The winning completion signal for an attempt.
#[derive(Debug, Clone, Copy)]
pub struct Resolution {
    pub channel: CompletionChannel,
    pub at: DateTime<Utc>,
}

/// Single-assignment resolution cell.
///
/// Exactly one `try_resolve` call ever wins, no matter how the push
/// and pull channels interleave. The mutex is the single-writer
/// guarantee for the double-resolution race.
#[derive(Debug, Default)]
pub struct ResolutionSlot {
    inner: Mutex<Option<Resolution>>,
}

impl ResolutionSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempt to resolve via `channel`. Returns `true` when this
    /// call won the race; `false` when the slot was already taken.
    pub fn try_resolve(&self, channel: CompletionChannel) -> bool {
        let mut inner = self.inner.lock().expect("resolution slot mutex poisoned");
        if inner.is_some() {
            return false;
        }
        *inner = Some(Resolution {
            channel,
            at: Utc::now(),
        });
        true
    }

    /// The winning resolution, if one happened.
    pub fn get(&self) -> Option<Resolution> {
        *self.inner.lock().expect("resolution slot mutex poisoned")
    }
}

/// What the detector observed for one attempt.
#[derive(Debug, Clone)]
pub struct DetectorOutcome {
    /// Provisional exit reason: `Success` here means resolved, before
    /// the post-completion grace phase has run.
    pub exit_reason: ExitReason,
    pub resolved_via: Option<CompletionChannel>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub poll_attempts: u32,
    pub poll_log: Vec<PollLogEntry>,
    /// Some poll observed recorded output artifacts.
    pub outputs_seen: bool,
    /// Error text from an `Errored` push event, when one arrived.
    pub error_detail: Option<String>,
}

impl DetectorOutcome {
    fn unresolved(exit_reason: ExitReason, poll_attempts: u32, poll_log: Vec<PollLogEntry>, outputs_seen: bool) -> Self {
        Self {
            exit_reason,
            resolved_via: None,
            resolved_at: None,
            poll_attempts,
            poll_log,
            outputs_seen,
            error_detail: None,
        }
    }
}

/// Drive both completion channels for one attempt until resolution,
/// timeout, backend error, or cancellation.
///
/// The caller must subscribe `events` before submitting so early push
/// events are not missed; gaps are covered by the poll channel anyway.
pub async fn detect(
    backend: &dyn RenderBackend,
    handle: &JobHandle,
    policy: &QueuePolicy,
    mut events: broadcast::Receiver<BackendEvent>,
    cancel: &CancellationToken,
) -> DetectorOutcome {
    let slot = ResolutionSlot::new();
    let deadline = tokio::time::Instant::now() + policy.max_wait();
    let mut poll_attempts = 0u32;
    let mut poll_log: Vec<PollLogEntry> = Vec::new();
    let mut outputs_seen = false;
    let mut push_open = true;

    // First poll one interval after dispatch; submission itself
    // already told us the job was accepted.
    let mut ticker = tokio::time::interval_at(
        tokio::time::Instant::now() + policy.poll_interval(),
        policy.poll_interval(),
    );
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!(handle = %handle, "Attempt cancelled while waiting for completion");
                return DetectorOutcome::unresolved(
                    ExitReason::Cancelled, poll_attempts, poll_log, outputs_seen,
                );
            }

            _ = tokio::time::sleep_until(deadline) => {
                tracing::warn!(
                    handle = %handle,
                    max_wait_secs = policy.max_wait_secs,
                    "Attempt exceeded max wait without a completion signal",
                );
                return DetectorOutcome::unresolved(
                    ExitReason::TimeoutMaxWait, poll_attempts, poll_log, outputs_seen,
                );
            }

            result = events.recv(), if push_open => {
                let event = match result {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Event stream lagged; poll channel covers the gap");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        // Poll channel alone from here on.
                        push_open = false;
                        continue;
                    }
                };
                if event.handle != *handle {
                    continue;
                }
                match event.phase {
                    JobPhase::Completed => {
                        if slot.try_resolve(CompletionChannel::Push) {
                            let resolution = slot.get().expect("slot just resolved");
                            tracing::info!(handle = %handle, "Completion observed via event stream");
                            return DetectorOutcome {
                                exit_reason: ExitReason::Success,
                                resolved_via: Some(resolution.channel),
                                resolved_at: Some(resolution.at),
                                poll_attempts,
                                poll_log,
                                outputs_seen,
                                error_detail: None,
                            };
                        }
                    }
                    JobPhase::Errored => {
                        tracing::warn!(
                            handle = %handle,
                            detail = event.detail.as_deref().unwrap_or("<none>"),
                            "Backend reported execution error",
                        );
                        let mut outcome = DetectorOutcome::unresolved(
                            ExitReason::BackendError, poll_attempts, poll_log, outputs_seen,
                        );
                        outcome.error_detail = event.detail;
                        return outcome;
                    }
                    JobPhase::Queued | JobPhase::Executing => {}
                }
            }

            _ = ticker.tick() => {
                poll_attempts += 1;
                match backend.poll_status(handle).await {
                    Ok(status) => {
                        outputs_seen |= status.outputs_present;
                        poll_log.push(PollLogEntry {
                            at: Utc::now(),
                            found: status.found,
                            succeeded: status.succeeded,
                            outputs_present: status.outputs_present,
                        });
                        if status.found && status.succeeded
                            && slot.try_resolve(CompletionChannel::Pull)
                        {
                            let resolution = slot.get().expect("slot just resolved");
                            tracing::info!(
                                handle = %handle,
                                poll_attempts,
                                "Completion observed via status poll",
                            );
                            return DetectorOutcome {
                                exit_reason: ExitReason::Success,
                                resolved_via: Some(resolution.channel),
                                resolved_at: Some(resolution.at),
                                poll_attempts,
                                poll_log,
                                outputs_seen,
                                error_detail: None,
                            };
                        }
                    }
                    Err(e) => {
                        // A failed poll is a missed observation, not a
                        // failed attempt; the next tick tries again.
                        tracing::warn!(handle = %handle, error = %e, "Status poll failed");
                    }
                }
                if policy.max_poll_attempts > 0 && poll_attempts >= policy.max_poll_attempts {
                    tracing::warn!(
                        handle = %handle,
                        poll_attempts,
                        "Poll attempt budget exhausted",
                    );
                    return DetectorOutcome::unresolved(
                        ExitReason::TimeoutPollAttempts, poll_attempts, poll_log, outputs_seen,
                    );
                }
            }
        }
    }
}
