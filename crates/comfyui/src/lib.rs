//! ComfyUI backend client for renderq.
//!
//! Implements the [`renderq_core::backend::RenderBackend`] contract on
//! top of the ComfyUI HTTP API (submission, history polling,
//! cancellation) and its WebSocket message stream (push-channel
//! completion events), with automatic reconnection.

pub mod api;
pub mod backend;
pub mod client;
pub mod messages;
pub mod reconnect;

pub use backend::ComfyUIBackend;
