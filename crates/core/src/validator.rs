//! Offline contract validator for persisted run records.
//!
//! Runs after a batch completes (CI or operator audit), independent of
//! the orchestrator's runtime path. Cross-checks every attempt's
//! telemetry against the policy echoed in the record and against the
//! human-readable log. Returns a list of violations and never errors;
//! callers decide pass/fail policy.

use serde::{Deserialize, Serialize};

use crate::telemetry::{AttemptTelemetry, ExitReason, ResourceSource, RunRecord};

/// One contract violation found in a run record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractViolation {
    pub job_id: String,
    /// 1-based attempt index, when the violation is attempt-scoped.
    pub attempt: Option<u32>,
    /// The telemetry field or log token the violation concerns.
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for ContractViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.attempt {
            Some(n) => write!(
                f,
                "job={} attempt={n} field={}: {}",
                self.job_id, self.field, self.message
            ),
            None => write!(f, "job={} field={}: {}", self.job_id, self.field, self.message),
        }
    }
}

/// Validate a run record against its human-readable log.
pub fn validate_run(record: &RunRecord, log_lines: &[String]) -> Vec<ContractViolation> {
    let mut violations = Vec::new();

    for job_record in &record.jobs {
        let job_id = job_record.job.id.to_string();

        if job_record.attempts.len() as u32 > job_record.job.retry_budget + 1 {
            violations.push(ContractViolation {
                job_id: job_id.clone(),
                attempt: None,
                field: "attempts".to_string(),
                message: format!(
                    "{} attempts recorded but retry budget {} allows at most {}",
                    job_record.attempts.len(),
                    job_record.job.retry_budget,
                    job_record.job.retry_budget + 1
                ),
            });
        }

        for (idx, attempt) in job_record.attempts.iter().enumerate() {
            let attempt_no = idx as u32 + 1;
            check_attempt(record, &job_id, attempt_no, attempt, &mut violations);
            check_log_line(record, &job_id, attempt_no, attempt, log_lines, &mut violations);
        }
    }

    violations
}

/// Intra-record consistency checks for one attempt.
fn check_attempt(
    record: &RunRecord,
    job_id: &str,
    attempt_no: u32,
    t: &AttemptTelemetry,
    out: &mut Vec<ContractViolation>,
) {
    let mut push = |field: &str, message: String| {
        out.push(ContractViolation {
            job_id: job_id.to_string(),
            attempt: Some(attempt_no),
            field: field.to_string(),
            message,
        });
    };

    if t.poll_attempt_limit != record.policy.max_poll_attempts {
        push(
            "poll_attempt_limit",
            format!(
                "attempt echoes limit {} but policy says {}",
                t.poll_attempt_limit, record.policy.max_poll_attempts
            ),
        );
    }

    if t.exit_reason == ExitReason::Success && !t.execution_success_detected {
        push(
            "execution_success_detected",
            "exit reason is success but execution success was never detected".to_string(),
        );
    }

    // Resource triplet: all-or-nothing, exact arithmetic.
    match (t.resource_before_mb, t.resource_after_mb, t.resource_delta_mb) {
        (Some(before), Some(after), Some(delta)) => {
            if delta != after - before {
                push(
                    "resource_delta_mb",
                    format!("delta {delta} != after {after} - before {before}"),
                );
            }
        }
        (Some(_), Some(_), None) => {
            push(
                "resource_delta_mb",
                "both snapshots present but delta is null".to_string(),
            );
        }
        (None, None, None) => {}
        _ => {
            push(
                "resource_before_mb",
                "resource snapshot triplet is partially populated".to_string(),
            );
        }
    }

    match t.resource_source {
        ResourceSource::Unavailable => {
            if t.resource_delta_mb.is_some() {
                push(
                    "resource_source",
                    "source is unavailable but a delta was recorded".to_string(),
                );
            }
            if t.fallback_notes.is_empty() {
                push(
                    "fallback_notes",
                    "source is unavailable but no fallback note explains why".to_string(),
                );
            }
        }
        ResourceSource::Fallback => {
            if t.fallback_notes.is_empty() {
                push(
                    "fallback_notes",
                    "source is fallback but no fallback note explains why".to_string(),
                );
            }
        }
        ResourceSource::Primary => {
            if !t.fallback_notes.is_empty() {
                push(
                    "fallback_notes",
                    "fallback notes recorded but source claims primary".to_string(),
                );
            }
        }
    }
}

/// Cross-check one attempt against its human-readable log line.
fn check_log_line(
    record: &RunRecord,
    job_id: &str,
    attempt_no: u32,
    t: &AttemptTelemetry,
    log_lines: &[String],
    out: &mut Vec<ContractViolation>,
) {
    let mut push = |field: &str, message: String| {
        out.push(ContractViolation {
            job_id: job_id.to_string(),
            attempt: Some(attempt_no),
            field: field.to_string(),
            message,
        });
    };

    let needle_job = format!("job={job_id} ");
    let needle_attempt = format!("attempt={attempt_no} ");
    let line = match log_lines
        .iter()
        .find(|l| l.contains(&needle_job) && l.contains(&needle_attempt))
    {
        Some(line) => line,
        None => {
            push("log", "no log line found for this attempt".to_string());
            return;
        }
    };

    match token(line, "polls") {
        Some(polls) => {
            let expected = format!("{}/{}", t.poll_attempts, record.policy.poll_limit_text());
            if polls != expected {
                push(
                    "polls",
                    format!("log says polls={polls} but telemetry and policy say {expected}"),
                );
            }
        }
        None => push("polls", "log line is missing the polls token".to_string()),
    }

    match token(line, "exit") {
        Some(exit) => {
            if exit != t.exit_reason.as_str() {
                push(
                    "exit",
                    format!(
                        "log says exit={exit} but telemetry says {}",
                        t.exit_reason.as_str()
                    ),
                );
            }
        }
        None => push("exit", "log line is missing the exit token".to_string()),
    }
}

/// Extract the value of a `key=value` token from a log line.
fn token<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    let prefix = format!("{key}=");
    line.split_whitespace()
        .find_map(|word| word.strip_prefix(prefix.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{Job, JobId, JobPriority, JobStatus};
    use crate::policy::QueuePolicy;
    use crate::telemetry::{render_log_line, CompletionChannel, JobRecord};
    use chrono::Utc;

    fn attempt(limit: u32) -> AttemptTelemetry {
        AttemptTelemetry {
            started_at: Utc::now(),
            duration_secs: 2.0,
            poll_attempts: 3,
            poll_attempt_limit: limit,
            exit_reason: ExitReason::Success,
            backend_error_detail: None,
            execution_success_detected: true,
            execution_success_at: Some(Utc::now()),
            resolved_via: Some(CompletionChannel::Pull),
            resource_before_mb: Some(1000),
            resource_after_mb: Some(900),
            resource_delta_mb: Some(-100),
            resource_source: ResourceSource::Primary,
            fallback_notes: Vec::new(),
            done_marker_detected: true,
            done_marker_wait_secs: 1.5,
            forced_copy_triggered: false,
            poll_log: Vec::new(),
        }
    }

    fn record_with(attempts: Vec<AttemptTelemetry>) -> (RunRecord, Vec<String>) {
        let policy = QueuePolicy::default();
        let mut job = Job::new(
            JobId("scene-001".into()),
            JobPriority::Normal,
            serde_json::json!({}),
        );
        job.status = JobStatus::Succeeded;
        job.attempts_used = attempts.len() as u32;
        let log = attempts
            .iter()
            .enumerate()
            .map(|(i, a)| render_log_line("scene-001", i as u32 + 1, a))
            .collect();
        let record = RunRecord {
            policy,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            jobs: vec![JobRecord { job, attempts }],
        };
        (record, log)
    }

    #[test]
    fn clean_record_has_no_violations() {
        let limit = QueuePolicy::default().max_poll_attempts;
        let (record, log) = record_with(vec![attempt(limit)]);
        assert!(validate_run(&record, &log).is_empty());
    }

    #[test]
    fn doctored_poll_limit_text_yields_exactly_one_violation() {
        let limit = QueuePolicy::default().max_poll_attempts;
        let (record, mut log) = record_with(vec![attempt(limit)]);
        log[0] = log[0].replace(
            &format!("polls=3/{limit}"),
            &format!("polls=3/{}", limit + 5),
        );
        let violations = validate_run(&record, &log);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].field, "polls");
    }

    #[test]
    fn limit_echo_mismatch_is_flagged() {
        let limit = QueuePolicy::default().max_poll_attempts;
        let (record, _) = record_with(vec![attempt(limit + 1)]);
        // Regenerate the log so only the numeric echo disagrees.
        let log = vec![render_log_line(
            "scene-001",
            1,
            &record.jobs[0].attempts[0],
        )];
        let violations = validate_run(&record, &log);
        assert!(violations
            .iter()
            .any(|v| v.field == "poll_attempt_limit"));
    }

    #[test]
    fn success_without_detection_is_flagged() {
        let limit = QueuePolicy::default().max_poll_attempts;
        let mut a = attempt(limit);
        a.execution_success_detected = false;
        let (record, log) = record_with(vec![a]);
        let violations = validate_run(&record, &log);
        assert!(violations
            .iter()
            .any(|v| v.field == "execution_success_detected"));
    }

    #[test]
    fn wrong_delta_arithmetic_is_flagged() {
        let limit = QueuePolicy::default().max_poll_attempts;
        let mut a = attempt(limit);
        a.resource_delta_mb = Some(-99);
        let (record, log) = record_with(vec![a]);
        let violations = validate_run(&record, &log);
        assert!(violations.iter().any(|v| v.field == "resource_delta_mb"));
    }

    #[test]
    fn unavailable_source_requires_null_delta_and_a_note() {
        let limit = QueuePolicy::default().max_poll_attempts;
        let mut a = attempt(limit);
        a.resource_source = ResourceSource::Unavailable;
        // Delta still present, no notes: two violations expected.
        let (record, log) = record_with(vec![a]);
        let violations = validate_run(&record, &log);
        assert!(violations.iter().any(|v| v.field == "resource_source"));
        assert!(violations.iter().any(|v| v.field == "fallback_notes"));
    }

    #[test]
    fn note_without_fallback_source_is_flagged() {
        let limit = QueuePolicy::default().max_poll_attempts;
        let mut a = attempt(limit);
        a.fallback_notes.push("nvidia-smi used".to_string());
        let (record, log) = record_with(vec![a]);
        let violations = validate_run(&record, &log);
        assert!(violations.iter().any(|v| v.field == "fallback_notes"));
    }

    #[test]
    fn partial_resource_triplet_is_flagged() {
        let limit = QueuePolicy::default().max_poll_attempts;
        let mut a = attempt(limit);
        a.resource_after_mb = None;
        a.resource_delta_mb = None;
        let (record, log) = record_with(vec![a]);
        let violations = validate_run(&record, &log);
        assert!(violations.iter().any(|v| v.field == "resource_before_mb"));
    }

    #[test]
    fn too_many_attempts_for_budget_is_flagged() {
        let limit = QueuePolicy::default().max_poll_attempts;
        // Budget 1 allows two attempts; record three.
        let (record, log) =
            record_with(vec![attempt(limit), attempt(limit), attempt(limit)]);
        let violations = validate_run(&record, &log);
        assert!(violations
            .iter()
            .any(|v| v.field == "attempts" && v.attempt.is_none()));
    }

    #[test]
    fn missing_log_line_is_flagged() {
        let limit = QueuePolicy::default().max_poll_attempts;
        let (record, _) = record_with(vec![attempt(limit)]);
        let violations = validate_run(&record, &[]);
        assert!(violations.iter().any(|v| v.field == "log"));
    }
}
