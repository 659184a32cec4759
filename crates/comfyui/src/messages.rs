//! Typed parser for ComfyUI WebSocket messages.
//!
//! ComfyUI frames are JSON of the shape `{"type": "<kind>", "data":
//! {...}}`, deserialized here via the internally-tagged `"type"` field.
//! Only the message kinds the orchestrator reacts to are modelled;
//! unknown kinds parse to an error and callers log and continue.

use serde::Deserialize;

/// A parsed ComfyUI WebSocket message.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ComfyUIMessage {
    /// Server status broadcast (queue depth).
    #[serde(rename = "status")]
    Status(StatusData),

    /// A prompt has started executing.
    #[serde(rename = "execution_start")]
    ExecutionStart(PromptRef),

    /// Nodes skipped because their outputs were cached.
    #[serde(rename = "execution_cached")]
    ExecutionCached(CachedData),

    /// A node is executing; `node: None` means the prompt finished.
    #[serde(rename = "executing")]
    Executing(ExecutingData),

    /// Step-level progress inside a long-running node.
    #[serde(rename = "progress")]
    Progress(ProgressData),

    /// A node finished and produced output.
    #[serde(rename = "executed")]
    Executed(ExecutedData),

    /// Execution failed.
    #[serde(rename = "execution_error")]
    ExecutionError(ExecutionErrorData),
}

/// `status` payload.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusData {
    pub status: QueueStatus,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueStatus {
    pub exec_info: ExecInfo,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecInfo {
    pub queue_remaining: i32,
}

/// Payload carrying just a prompt id.
#[derive(Debug, Clone, Deserialize)]
pub struct PromptRef {
    pub prompt_id: String,
}

/// `execution_cached` payload.
#[derive(Debug, Clone, Deserialize)]
pub struct CachedData {
    pub prompt_id: String,
    #[serde(default)]
    pub nodes: Vec<String>,
}

/// `executing` payload. Completion is signalled by `node: None`.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutingData {
    pub node: Option<String>,
    pub prompt_id: String,
}

/// `progress` payload (step `value` of `max`).
#[derive(Debug, Clone, Deserialize)]
pub struct ProgressData {
    pub value: i32,
    pub max: i32,
}

/// `executed` payload (per-node output).
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutedData {
    pub node: String,
    pub output: serde_json::Value,
    pub prompt_id: String,
}

/// `execution_error` payload.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionErrorData {
    pub prompt_id: String,
    #[serde(default)]
    pub node_id: String,
    pub exception_message: String,
    #[serde(default)]
    pub exception_type: String,
}

/// Parse one WebSocket text frame.
///
/// `Err` for malformed JSON or unknown `type` values; callers should
/// log the raw frame and keep reading.
pub fn parse_message(text: &str) -> Result<ComfyUIMessage, serde_json::Error> {
    serde_json::from_str(text)
}
