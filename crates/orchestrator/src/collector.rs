//! Per-attempt telemetry assembly.
//!
//! [`AttemptObserver`] brackets one attempt end to end: a resource
//! snapshot immediately before dispatch, one immediately after
//! resolution, the detector's poll counters and log, marker-wait
//! timing, and the forced-copy flag. `finalize` produces the
//! [`AttemptTelemetry`] with every field populated -- nullable fields
//! are explicit `None`, never left out.

use chrono::{DateTime, Utc};

use renderq_core::policy::QueuePolicy;
use renderq_core::telemetry::{
    AttemptTelemetry, CompletionChannel, ExitReason, PollLogEntry, ResourceSource,
};
use renderq_monitor::ResourceReading;

use crate::detector::DetectorOutcome;

/// Collects the pieces of one attempt's telemetry as they happen.
pub struct AttemptObserver {
    started_at: DateTime<Utc>,
    start: tokio::time::Instant,
    poll_attempt_limit: u32,
    before: Option<ResourceReading>,
    after: Option<ResourceReading>,
    resolved_via: Option<CompletionChannel>,
    resolved_at: Option<DateTime<Utc>>,
    error_detail: Option<String>,
    poll_attempts: u32,
    poll_log: Vec<PollLogEntry>,
    marker_detected: bool,
    marker_wait_secs: f64,
    forced_copy_triggered: bool,
}

impl AttemptObserver {
    /// Start observing an attempt under the given policy.
    pub fn new(policy: &QueuePolicy) -> Self {
        Self {
            started_at: Utc::now(),
            start: tokio::time::Instant::now(),
            poll_attempt_limit: policy.max_poll_attempts,
            before: None,
            after: None,
            resolved_via: None,
            resolved_at: None,
            error_detail: None,
            poll_attempts: 0,
            poll_log: Vec::new(),
            marker_detected: false,
            marker_wait_secs: 0.0,
            forced_copy_triggered: false,
        }
    }

    /// Resource snapshot taken immediately before dispatch.
    pub fn record_before(&mut self, reading: ResourceReading) {
        self.before = Some(reading);
    }

    /// Resource snapshot taken immediately after resolution.
    pub fn record_after(&mut self, reading: ResourceReading) {
        self.after = Some(reading);
    }

    /// Fold in what the completion detector observed.
    pub fn set_detector(&mut self, outcome: &DetectorOutcome) {
        self.resolved_via = outcome.resolved_via;
        self.resolved_at = outcome.resolved_at;
        self.error_detail = outcome.error_detail.clone();
        self.poll_attempts = outcome.poll_attempts;
        self.poll_log = outcome.poll_log.clone();
    }

    /// Record the marker-wait result. The wait duration is measured
    /// from attempt start so it covers the whole producer handoff.
    pub fn set_marker(&mut self, detected: bool) {
        self.marker_detected = detected;
        self.marker_wait_secs = self.start.elapsed().as_secs_f64();
    }

    /// Record that output was recovered via the forced-copy fallback.
    pub fn set_forced_copy(&mut self) {
        self.forced_copy_triggered = true;
    }

    /// Produce the immutable telemetry record for this attempt.
    pub fn finalize(self, exit_reason: ExitReason) -> AttemptTelemetry {
        let duration_secs = self.start.elapsed().as_secs_f64();
        let (before_mb, after_mb, delta_mb, source, notes) =
            combine_resources(self.before.as_ref(), self.after.as_ref());

        AttemptTelemetry {
            started_at: self.started_at,
            duration_secs,
            poll_attempts: self.poll_attempts,
            poll_attempt_limit: self.poll_attempt_limit,
            exit_reason,
            backend_error_detail: self.error_detail,
            execution_success_detected: self.resolved_via.is_some(),
            execution_success_at: self.resolved_at,
            resolved_via: self.resolved_via,
            resource_before_mb: before_mb,
            resource_after_mb: after_mb,
            resource_delta_mb: delta_mb,
            resource_source: source,
            fallback_notes: notes,
            done_marker_detected: self.marker_detected,
            done_marker_wait_secs: self.marker_wait_secs,
            forced_copy_triggered: self.forced_copy_triggered,
            poll_log: self.poll_log,
        }
    }
}

/// Merge the before/after readings into the telemetry triplet.
///
/// The triplet is all-or-nothing: a delta exists only when both
/// snapshots are numeric. The attempt's source is the worse of the
/// two readings' sources, and a missing snapshot counts as
/// unavailable. Degraded sources always contribute at least one note.
fn combine_resources(
    before: Option<&ResourceReading>,
    after: Option<&ResourceReading>,
) -> (
    Option<i64>,
    Option<i64>,
    Option<i64>,
    ResourceSource,
    Vec<String>,
) {
    fn severity(source: ResourceSource) -> u8 {
        match source {
            ResourceSource::Primary => 0,
            ResourceSource::Fallback => 1,
            ResourceSource::Unavailable => 2,
        }
    }

    let mut notes = Vec::new();
    let mut worst = ResourceSource::Primary;
    for (label, reading) in [("before", before), ("after", after)] {
        match reading {
            Some(r) => {
                if severity(r.source) > severity(worst) {
                    worst = r.source;
                }
                notes.extend(r.notes.iter().cloned());
            }
            None => {
                worst = ResourceSource::Unavailable;
                notes.push(format!("no {label} resource snapshot was taken"));
            }
        }
    }

    let before_mb = before.and_then(|r| r.used_mb);
    let after_mb = after.and_then(|r| r.used_mb);
    match (before_mb, after_mb) {
        (Some(b), Some(a)) => (Some(b), Some(a), Some(a - b), worst, notes),
        _ => {
            if worst != ResourceSource::Unavailable {
                // One side is numeric but the other is not; without a
                // full triplet the attempt counts as unavailable.
                worst = ResourceSource::Unavailable;
            }
            if notes.is_empty() {
                notes.push("resource snapshot pair was incomplete".to_string());
            }
            (None, None, None, worst, notes)
        }
    }
}
