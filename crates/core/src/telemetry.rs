//! Attempt telemetry and the persisted run record.
//!
//! One [`AttemptTelemetry`] is written per attempt and is immutable
//! once finalized. Nullable fields are serialized as explicit `null`,
//! never omitted -- the contract validator treats a missing field as a
//! violation. [`render_log_line`] produces the human-readable log line
//! that is the textual counterpart the validator cross-checks.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::job::Job;
use crate::policy::QueuePolicy;

/// Classified cause of an attempt's resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    Success,
    TimeoutMaxWait,
    TimeoutPollAttempts,
    TimeoutPostCompletionGrace,
    BackendError,
    Cancelled,
    Unknown,
}

impl ExitReason {
    /// String form used in log lines and diagnostics.
    pub fn as_str(self) -> &'static str {
        match self {
            ExitReason::Success => "success",
            ExitReason::TimeoutMaxWait => "timeout_max_wait",
            ExitReason::TimeoutPollAttempts => "timeout_poll_attempts",
            ExitReason::TimeoutPostCompletionGrace => "timeout_post_completion_grace",
            ExitReason::BackendError => "backend_error",
            ExitReason::Cancelled => "cancelled",
            ExitReason::Unknown => "unknown",
        }
    }

    /// Whether the retry coordinator may resubmit after this reason.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ExitReason::TimeoutMaxWait
                | ExitReason::TimeoutPollAttempts
                | ExitReason::TimeoutPostCompletionGrace
                | ExitReason::BackendError
        )
    }
}

/// Where the resource snapshots for an attempt came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceSource {
    Primary,
    Fallback,
    Unavailable,
}

impl ResourceSource {
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceSource::Primary => "primary",
            ResourceSource::Fallback => "fallback",
            ResourceSource::Unavailable => "unavailable",
        }
    }
}

/// Which channel won the completion race for an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionChannel {
    /// The WebSocket event stream.
    Push,
    /// The idempotent status poll.
    Pull,
}

/// One status-poll observation, kept for diagnostic replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollLogEntry {
    pub at: DateTime<Utc>,
    pub found: bool,
    pub succeeded: bool,
    pub outputs_present: bool,
}

/// Complete telemetry for one job attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptTelemetry {
    pub started_at: DateTime<Utc>,
    pub duration_secs: f64,
    pub poll_attempts: u32,
    /// Echo of the policy's poll limit at the time of the attempt.
    pub poll_attempt_limit: u32,
    pub exit_reason: ExitReason,
    /// Error text the backend attached to a failed execution, if any.
    pub backend_error_detail: Option<String>,
    pub execution_success_detected: bool,
    pub execution_success_at: Option<DateTime<Utc>>,
    /// Which channel resolved the attempt, when one did.
    pub resolved_via: Option<CompletionChannel>,
    /// VRAM used before dispatch, in megabytes.
    pub resource_before_mb: Option<i64>,
    /// VRAM used after resolution, in megabytes.
    pub resource_after_mb: Option<i64>,
    /// `after - before`; present only when both snapshots are numeric.
    pub resource_delta_mb: Option<i64>,
    pub resource_source: ResourceSource,
    pub fallback_notes: Vec<String>,
    pub done_marker_detected: bool,
    pub done_marker_wait_secs: f64,
    pub forced_copy_triggered: bool,
    pub poll_log: Vec<PollLogEntry>,
}

/// One job together with every attempt's telemetry, in order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub job: Job,
    pub attempts: Vec<AttemptTelemetry>,
}

/// The persisted artifact of one run: every job, every attempt, and
/// the resolved policy echoed back for audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub policy: QueuePolicy,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub jobs: Vec<JobRecord>,
}

impl RunRecord {
    /// Whether every job in the run reached `Succeeded`.
    pub fn all_succeeded(&self) -> bool {
        self.jobs
            .iter()
            .all(|j| j.job.status == crate::job::JobStatus::Succeeded)
    }

    /// Write the record as pretty-printed JSON.
    pub fn save(&self, path: &Path) -> Result<(), CoreError> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| CoreError::Internal(format!("serialize run record: {e}")))?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load a previously persisted record.
    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw)
            .map_err(|e| CoreError::Internal(format!("parse run record: {e}")))
    }
}

/// Render the human-readable log line for one attempt.
///
/// The validator parses these lines back, so the format is part of the
/// telemetry contract: space-separated `key=value` pairs after the
/// timestamp, with the poll limit rendered as a number or `unbounded`.
pub fn render_log_line(job_id: &str, attempt_index: u32, t: &AttemptTelemetry) -> String {
    let limit_text = if t.poll_attempt_limit == 0 {
        "unbounded".to_string()
    } else {
        t.poll_attempt_limit.to_string()
    };
    let delta_text = match t.resource_delta_mb {
        Some(delta) => delta.to_string(),
        None => "none".to_string(),
    };
    format!(
        "[{}] job={} attempt={} exit={} duration={:.3}s polls={}/{} marker={} marker_wait={:.3}s forced_copy={} resource={} delta={}",
        t.started_at.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        job_id,
        attempt_index,
        t.exit_reason.as_str(),
        t.duration_secs,
        t.poll_attempts,
        limit_text,
        if t.done_marker_detected { "observed" } else { "missing" },
        t.done_marker_wait_secs,
        t.forced_copy_triggered,
        t.resource_source.as_str(),
        delta_text,
    )
}
