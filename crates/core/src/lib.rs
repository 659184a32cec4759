//! Domain logic for the renderq generation job orchestrator.
//!
//! Everything in this crate is pure (no network or process I/O beyond
//! the marker file helpers) so it can be tested in isolation. The
//! orchestration runtime lives in `renderq-orchestrator`; the ComfyUI
//! wire protocol lives in `renderq-comfyui`.

pub mod backend;
pub mod error;
pub mod job;
pub mod marker;
pub mod policy;
pub mod telemetry;
pub mod validator;
