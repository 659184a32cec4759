//! Retry decisions after a failed attempt.

use renderq_core::job::Job;
use renderq_core::telemetry::ExitReason;

/// What to do with a job after an unsuccessful attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Requeue the job; it will pass through admission again.
    Retry,
    /// The failure is terminal for this job.
    Fail,
}

/// Decide whether a job gets another attempt.
///
/// Cancellation and non-retryable exits are terminal regardless of
/// budget; retryable exits consume the budget one attempt at a time.
pub fn decide(job: &Job, exit_reason: ExitReason) -> RetryDecision {
    if exit_reason.is_retryable() && job.budget_remaining() {
        RetryDecision::Retry
    } else {
        RetryDecision::Fail
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use renderq_core::job::{JobId, JobPriority};

    fn job_with_budget(retry_budget: u32, attempts_used: u32) -> Job {
        let mut job = Job::new(
            JobId("scene-001".into()),
            JobPriority::Normal,
            serde_json::json!({"1": {"class_type": "KSampler"}}),
        )
        .with_retry_budget(retry_budget);
        job.attempts_used = attempts_used;
        job
    }

    #[test]
    fn retryable_exit_with_budget_requeues() {
        let job = job_with_budget(1, 1);
        assert_eq!(decide(&job, ExitReason::TimeoutMaxWait), RetryDecision::Retry);
    }

    #[test]
    fn exhausted_budget_fails() {
        let job = job_with_budget(1, 2);
        assert_eq!(decide(&job, ExitReason::TimeoutMaxWait), RetryDecision::Fail);
    }

    #[test]
    fn cancellation_never_retries() {
        let job = job_with_budget(3, 1);
        assert_eq!(decide(&job, ExitReason::Cancelled), RetryDecision::Fail);
    }

    #[test]
    fn backend_error_is_retryable_within_budget() {
        let job = job_with_budget(2, 1);
        assert_eq!(decide(&job, ExitReason::BackendError), RetryDecision::Retry);
    }
}
