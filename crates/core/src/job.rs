//! Job model and status state machine.
//!
//! A [`Job`] is one unit of generation work handed to the scheduler.
//! Its `payload` is the opaque workflow JSON forwarded to the render
//! backend; the orchestrator never interprets it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Default retry budget when the caller does not specify one.
pub const DEFAULT_RETRY_BUDGET: u32 = 1;

/// Opaque job identifier. Caller-assigned, or a UUID v4 when generated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    /// Generate a fresh random job ID.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Dispatch priority. Within a tier, order is FIFO by enqueue sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobPriority {
    High,
    Normal,
    Low,
}

/// Lifecycle status of a job.
///
/// `Pending` jobs are awaiting admission (concurrency + headroom),
/// `Queued` jobs have passed admission and are about to dispatch,
/// `Running` jobs have an attempt in flight. The remaining three are
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Whether this status is terminal (no further transitions).
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Returns the set of valid target statuses reachable from `self`.
    ///
    /// The state machine is monotonic except for `Running -> Pending`,
    /// which is the explicit retry transition (back through admission
    /// control rather than straight to `Queued`).
    pub fn valid_transitions(self) -> &'static [JobStatus] {
        use JobStatus::*;
        match self {
            Pending => &[Queued, Cancelled],
            Queued => &[Running, Cancelled],
            Running => &[Succeeded, Failed, Cancelled, Pending],
            Succeeded | Failed | Cancelled => &[],
        }
    }

    /// Check whether a transition from `self` to `to` is valid.
    pub fn can_transition(self, to: JobStatus) -> bool {
        self.valid_transitions().contains(&to)
    }

    /// Validate a transition, returning a descriptive error for
    /// invalid ones.
    pub fn validate_transition(self, to: JobStatus) -> Result<(), CoreError> {
        if self.can_transition(to) {
            Ok(())
        } else {
            Err(CoreError::InvalidTransition(format!(
                "{self:?} -> {to:?}"
            )))
        }
    }
}

/// One unit of generation work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub priority: JobPriority,
    /// Opaque workflow descriptor forwarded to the backend verbatim.
    pub payload: serde_json::Value,
    /// Optional VRAM cost hint in megabytes. Informational only.
    pub estimated_cost_mb: Option<u64>,
    /// Number of retries allowed after the first attempt.
    pub retry_budget: u32,
    /// Attempts started so far. Never exceeds `retry_budget + 1`.
    pub attempts_used: u32,
    pub status: JobStatus,
    /// Output filename prefix for this job (marker and frame naming).
    pub output_prefix: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Create a pending job with the default retry budget.
    pub fn new(id: JobId, priority: JobPriority, payload: serde_json::Value) -> Self {
        let now = Utc::now();
        let output_prefix = id.0.clone();
        Self {
            id,
            priority,
            payload,
            estimated_cost_mb: None,
            retry_budget: DEFAULT_RETRY_BUDGET,
            attempts_used: 0,
            status: JobStatus::Pending,
            output_prefix,
            created_at: now,
            updated_at: now,
        }
    }

    /// Override the output filename prefix.
    pub fn with_output_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.output_prefix = prefix.into();
        self
    }

    /// Override the retry budget.
    pub fn with_retry_budget(mut self, budget: u32) -> Self {
        self.retry_budget = budget;
        self
    }

    /// Override the priority.
    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Apply a validated status transition, bumping `updated_at`.
    pub fn transition(&mut self, to: JobStatus) -> Result<(), CoreError> {
        self.status.validate_transition(to)?;
        self.status = to;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Whether another attempt is allowed by the retry budget.
    pub fn budget_remaining(&self) -> bool {
        self.attempts_used < self.retry_budget + 1
    }
}
