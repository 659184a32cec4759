//! Queue policy: every tunable knob of a run, resolved once at startup.
//!
//! The policy is immutable for the lifetime of a run and threaded
//! explicitly through every component -- there is no ambient global
//! configuration. Resolution precedence is CLI flag > `RENDERQ_*`
//! environment variable > built-in default.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Default overall wait for one attempt, in seconds.
pub const DEFAULT_MAX_WAIT_SECS: f64 = 300.0;

/// Default interval between status polls, in seconds.
pub const DEFAULT_POLL_INTERVAL_SECS: f64 = 5.0;

/// Default cap on status polls per attempt (0 = unbounded).
pub const DEFAULT_MAX_POLL_ATTEMPTS: u32 = 60;

/// Default grace period after resolution for late output artifacts.
pub const DEFAULT_POST_COMPLETION_GRACE_SECS: f64 = 15.0;

/// Default retries allowed after the first attempt.
pub const DEFAULT_RETRY_BUDGET: u32 = 1;

/// Default minimum VRAM headroom required for admission, in megabytes.
pub const DEFAULT_MIN_HEADROOM_MB: u64 = 1024;

/// Default bound on simultaneously running jobs.
pub const DEFAULT_MAX_CONCURRENCY: usize = 1;

/// Default consecutive-failure count that opens the circuit breaker.
pub const DEFAULT_BREAKER_FAILURE_THRESHOLD: u32 = 3;

/// Default breaker cooldown before a half-open trial, in seconds.
pub const DEFAULT_BREAKER_COOLDOWN_SECS: f64 = 30.0;

/// Immutable per-run policy. See the module docs for resolution order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuePolicy {
    pub max_wait_secs: f64,
    pub poll_interval_secs: f64,
    /// 0 means unbounded (the `max_wait_secs` deadline still applies).
    pub max_poll_attempts: u32,
    pub post_completion_grace_secs: f64,
    pub retry_budget: u32,
    pub min_headroom_mb: u64,
    pub max_concurrency: usize,
    /// Dispatch with a warning when headroom cannot be determined.
    pub proceed_on_unknown_headroom: bool,
    pub breaker_failure_threshold: u32,
    pub breaker_cooldown_secs: f64,
}

impl Default for QueuePolicy {
    fn default() -> Self {
        Self {
            max_wait_secs: DEFAULT_MAX_WAIT_SECS,
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            max_poll_attempts: DEFAULT_MAX_POLL_ATTEMPTS,
            post_completion_grace_secs: DEFAULT_POST_COMPLETION_GRACE_SECS,
            retry_budget: DEFAULT_RETRY_BUDGET,
            min_headroom_mb: DEFAULT_MIN_HEADROOM_MB,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            proceed_on_unknown_headroom: true,
            breaker_failure_threshold: DEFAULT_BREAKER_FAILURE_THRESHOLD,
            breaker_cooldown_secs: DEFAULT_BREAKER_COOLDOWN_SECS,
        }
    }
}

/// Caller-supplied overrides (normally parsed CLI flags). `None`
/// fields fall through to the environment, then the default.
#[derive(Debug, Clone, Default)]
pub struct PolicyOverrides {
    pub max_wait_secs: Option<f64>,
    pub poll_interval_secs: Option<f64>,
    pub max_poll_attempts: Option<u32>,
    pub post_completion_grace_secs: Option<f64>,
    pub retry_budget: Option<u32>,
    pub min_headroom_mb: Option<u64>,
    pub max_concurrency: Option<usize>,
    pub proceed_on_unknown_headroom: Option<bool>,
    pub breaker_failure_threshold: Option<u32>,
    pub breaker_cooldown_secs: Option<f64>,
}

impl QueuePolicy {
    /// Resolve a policy from overrides and the process environment,
    /// then validate it. Invalid values are fatal (startup only).
    pub fn resolve(overrides: &PolicyOverrides) -> Result<Self, CoreError> {
        let policy = Self::resolve_from(overrides, |name| std::env::var(name).ok());
        policy.validate()?;
        Ok(policy)
    }

    /// Resolution with an injectable environment lookup, for tests.
    pub fn resolve_from(
        overrides: &PolicyOverrides,
        env: impl Fn(&str) -> Option<String>,
    ) -> Self {
        let defaults = Self::default();
        Self {
            max_wait_secs: pick(
                overrides.max_wait_secs,
                &env,
                "RENDERQ_MAX_WAIT_SECS",
                defaults.max_wait_secs,
            ),
            poll_interval_secs: pick(
                overrides.poll_interval_secs,
                &env,
                "RENDERQ_POLL_INTERVAL_SECS",
                defaults.poll_interval_secs,
            ),
            max_poll_attempts: pick(
                overrides.max_poll_attempts,
                &env,
                "RENDERQ_MAX_POLL_ATTEMPTS",
                defaults.max_poll_attempts,
            ),
            post_completion_grace_secs: pick(
                overrides.post_completion_grace_secs,
                &env,
                "RENDERQ_POST_COMPLETION_GRACE_SECS",
                defaults.post_completion_grace_secs,
            ),
            retry_budget: pick(
                overrides.retry_budget,
                &env,
                "RENDERQ_RETRY_BUDGET",
                defaults.retry_budget,
            ),
            min_headroom_mb: pick(
                overrides.min_headroom_mb,
                &env,
                "RENDERQ_MIN_HEADROOM_MB",
                defaults.min_headroom_mb,
            ),
            max_concurrency: pick(
                overrides.max_concurrency,
                &env,
                "RENDERQ_MAX_CONCURRENCY",
                defaults.max_concurrency,
            ),
            proceed_on_unknown_headroom: pick(
                overrides.proceed_on_unknown_headroom,
                &env,
                "RENDERQ_PROCEED_ON_UNKNOWN_HEADROOM",
                defaults.proceed_on_unknown_headroom,
            ),
            breaker_failure_threshold: pick(
                overrides.breaker_failure_threshold,
                &env,
                "RENDERQ_BREAKER_FAILURE_THRESHOLD",
                defaults.breaker_failure_threshold,
            ),
            breaker_cooldown_secs: pick(
                overrides.breaker_cooldown_secs,
                &env,
                "RENDERQ_BREAKER_COOLDOWN_SECS",
                defaults.breaker_cooldown_secs,
            ),
        }
    }

    /// Reject policies that could stall or spin the orchestrator.
    pub fn validate(&self) -> Result<(), CoreError> {
        let positive = [
            ("max_wait_secs", self.max_wait_secs),
            ("poll_interval_secs", self.poll_interval_secs),
        ];
        for (name, value) in positive {
            if !value.is_finite() || value <= 0.0 {
                return Err(CoreError::PolicyInvalid(format!(
                    "{name} must be a positive number, got {value}"
                )));
            }
        }
        let non_negative = [
            ("post_completion_grace_secs", self.post_completion_grace_secs),
            ("breaker_cooldown_secs", self.breaker_cooldown_secs),
        ];
        for (name, value) in non_negative {
            if !value.is_finite() || value < 0.0 {
                return Err(CoreError::PolicyInvalid(format!(
                    "{name} must be non-negative, got {value}"
                )));
            }
        }
        if self.max_concurrency == 0 {
            return Err(CoreError::PolicyInvalid(
                "max_concurrency must be at least 1".to_string(),
            ));
        }
        if self.breaker_failure_threshold == 0 {
            return Err(CoreError::PolicyInvalid(
                "breaker_failure_threshold must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_secs_f64(self.max_wait_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.poll_interval_secs)
    }

    pub fn post_completion_grace(&self) -> Duration {
        Duration::from_secs_f64(self.post_completion_grace_secs)
    }

    pub fn breaker_cooldown(&self) -> Duration {
        Duration::from_secs_f64(self.breaker_cooldown_secs)
    }

    /// Textual form of the poll-attempt limit as it appears in the
    /// human-readable log (`"unbounded"` for 0).
    pub fn poll_limit_text(&self) -> String {
        if self.max_poll_attempts == 0 {
            "unbounded".to_string()
        } else {
            self.max_poll_attempts.to_string()
        }
    }
}

/// Pick the first available value: explicit override, parseable env
/// var, then default. Unparseable env values fall through silently to
/// the default; validation catches out-of-range results.
fn pick<T: std::str::FromStr>(
    explicit: Option<T>,
    env: impl Fn(&str) -> Option<String>,
    var: &str,
    default: T,
) -> T {
    explicit
        .or_else(|| env(var).and_then(|raw| raw.trim().parse().ok()))
        .unwrap_or(default)
}
