//! Render backend contract.
//!
//! The orchestrator talks to the backend through this trait only, so
//! tests can substitute an in-memory fake and the hybrid push/pull
//! completion protocol stays independent of the ComfyUI wire details.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Server-assigned handle for a submitted job (the ComfyUI prompt id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobHandle(pub String);

impl std::fmt::Display for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Coarse execution phase reported over the push channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobPhase {
    Queued,
    Executing,
    Completed,
    Errored,
}

/// One push-channel event for a submitted job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendEvent {
    pub handle: JobHandle,
    pub phase: JobPhase,
    /// Error message or progress note, when the backend supplied one.
    pub detail: Option<String>,
}

/// Result of an idempotent status poll (the pull channel).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollStatus {
    /// The backend knows about this handle.
    pub found: bool,
    /// Execution finished successfully.
    pub succeeded: bool,
    /// Output artifacts were recorded for the job.
    pub outputs_present: bool,
}

/// Errors crossing the backend boundary.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    /// The backend is unreachable or answered with a non-success
    /// status. Retryable; counts against the circuit breaker.
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    /// The backend answered but the payload made no sense.
    #[error("Backend protocol error: {0}")]
    Protocol(String),
}

/// A remote, single-capacity render backend.
///
/// `poll_status` must be idempotent and side-effect free: the
/// completion detector calls it repeatedly and may race it against the
/// event stream.
#[async_trait::async_trait]
pub trait RenderBackend: Send + Sync {
    /// Submit an opaque workflow payload for execution.
    async fn submit(&self, payload: &serde_json::Value) -> Result<JobHandle, BackendError>;

    /// Query the current status of a submitted job.
    async fn poll_status(&self, handle: &JobHandle) -> Result<PollStatus, BackendError>;

    /// Ask the backend to stop a queued or running job. Best effort;
    /// server-side work is not guaranteed to halt.
    async fn cancel(&self, handle: &JobHandle) -> Result<(), BackendError>;

    /// Subscribe to the push channel. Missed events are acceptable --
    /// the poll channel covers gaps.
    fn subscribe(&self) -> broadcast::Receiver<BackendEvent>;
}
