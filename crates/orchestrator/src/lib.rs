//! Generation job orchestration runtime.
//!
//! The [`queue::Scheduler`] is the component callers consume: it
//! admits jobs against VRAM headroom and a concurrency bound, submits
//! them through a [`renderq_core::backend::RenderBackend`], resolves
//! completion through the hybrid push/pull [`detector`], awaits the
//! done-marker handoff (with a forced-copy fallback), retries within
//! a per-job budget behind a circuit [`breaker`], and emits one
//! validated telemetry record per attempt.

pub mod breaker;
pub mod collector;
pub mod detector;
pub mod marker;
pub mod queue;
pub mod retry;

pub use queue::{HeadroomSource, RunDirs, Scheduler};
