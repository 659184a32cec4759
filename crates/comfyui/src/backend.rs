//! [`RenderBackend`] implementation backed by a ComfyUI server.
//!
//! Owns the HTTP API client and a long-lived WebSocket task (connect
//! -> process messages -> reconnect) that translates raw ComfyUI
//! messages into [`BackendEvent`]s on a broadcast channel. The pull
//! channel is built on `GET /history/{prompt_id}`.

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use renderq_core::backend::{
    BackendError, BackendEvent, JobHandle, JobPhase, PollStatus, RenderBackend,
};

use crate::api::{ComfyUIApi, ComfyUIApiError};
use crate::client::ComfyUIClient;
use crate::messages::{parse_message, ComfyUIMessage};
use crate::reconnect::{reconnect_loop, ReconnectConfig};

/// Broadcast channel capacity for push-channel events.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// ComfyUI-backed render backend.
///
/// Create with [`ComfyUIBackend::start`]; the returned `Arc` is cheap
/// to clone into the scheduler. Call [`shutdown`](Self::shutdown) to
/// stop the WebSocket task.
pub struct ComfyUIBackend {
    api: ComfyUIApi,
    event_tx: broadcast::Sender<BackendEvent>,
    cancel: CancellationToken,
}

impl ComfyUIBackend {
    /// Start the backend: spawn the event-stream task and return a
    /// shared handle.
    ///
    /// * `api_url` - HTTP base URL, e.g. `http://host:8188`.
    /// * `ws_url`  - WebSocket base URL, e.g. `ws://host:8188`.
    pub fn start(api_url: String, ws_url: String) -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();

        let backend = Arc::new(Self {
            api: ComfyUIApi::new(api_url),
            event_tx: event_tx.clone(),
            cancel: cancel.clone(),
        });

        let client = ComfyUIClient::new(ws_url);
        tokio::spawn(async move {
            run_event_stream(&client, &event_tx, &cancel).await;
            tracing::info!("ComfyUI event stream task exited");
        });

        backend
    }

    /// Construct without an event-stream task, for tests that feed
    /// events manually and for poll-only operation.
    pub fn poll_only(api_url: String) -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            api: ComfyUIApi::new(api_url),
            event_tx,
            cancel: CancellationToken::new(),
        })
    }

    /// Stop the event-stream task.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

#[async_trait::async_trait]
impl RenderBackend for ComfyUIBackend {
    async fn submit(&self, payload: &serde_json::Value) -> Result<JobHandle, BackendError> {
        let client_id = uuid::Uuid::new_v4().to_string();
        let response = self
            .api
            .submit_workflow(payload, &client_id)
            .await
            .map_err(map_api_error)?;

        tracing::info!(prompt_id = %response.prompt_id, "Workflow submitted to ComfyUI");
        Ok(JobHandle(response.prompt_id))
    }

    async fn poll_status(&self, handle: &JobHandle) -> Result<PollStatus, BackendError> {
        let history = self.api.get_history(&handle.0).await.map_err(map_api_error)?;
        Ok(interpret_history(&history, &handle.0))
    }

    async fn cancel(&self, handle: &JobHandle) -> Result<(), BackendError> {
        // Remove from the queue if still queued, then interrupt in
        // case it is the running prompt. Both are best effort.
        self.api
            .cancel_execution(&handle.0)
            .await
            .map_err(map_api_error)?;
        if let Err(e) = self.api.interrupt().await {
            tracing::warn!(prompt_id = %handle.0, error = %e, "Interrupt after cancel failed");
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<BackendEvent> {
        self.event_tx.subscribe()
    }
}

/// Map REST-layer errors onto the backend contract.
///
/// Anything the server did not successfully answer counts as
/// unavailable; only a 2xx with an unreadable payload is a protocol
/// error.
fn map_api_error(e: ComfyUIApiError) -> BackendError {
    match e {
        ComfyUIApiError::Api { status, body } => {
            BackendError::Unavailable(format!("HTTP {status}: {body}"))
        }
        ComfyUIApiError::Request(e) if e.is_decode() => {
            BackendError::Protocol(e.to_string())
        }
        ComfyUIApiError::Request(e) => BackendError::Unavailable(e.to_string()),
    }
}

/// Interpret a `/history/{id}` response as a [`PollStatus`].
///
/// The history object is keyed by prompt id. An absent key means the
/// prompt is unknown or still executing (`found: false`). ComfyUI
/// marks finished prompts with `status.completed` and/or
/// `status.status_str == "success"`.
pub fn interpret_history(history: &serde_json::Value, prompt_id: &str) -> PollStatus {
    let entry = match history.get(prompt_id) {
        Some(entry) => entry,
        None => {
            return PollStatus {
                found: false,
                succeeded: false,
                outputs_present: false,
            }
        }
    };

    let status = &entry["status"];
    let completed = status["completed"].as_bool().unwrap_or(false);
    let status_str = status["status_str"].as_str().unwrap_or("");
    let succeeded = completed || status_str == "success";

    let outputs_present = entry["outputs"]
        .as_object()
        .map(|outputs| {
            outputs.values().any(|node_output| {
                node_output
                    .as_object()
                    .map(|o| !o.is_empty())
                    .unwrap_or(false)
            })
        })
        .unwrap_or(false);

    PollStatus {
        found: true,
        succeeded,
        outputs_present,
    }
}

/// Long-lived event stream loop: connect, process frames, reconnect.
async fn run_event_stream(
    client: &ComfyUIClient,
    event_tx: &broadcast::Sender<BackendEvent>,
    cancel: &CancellationToken,
) {
    let reconnect_config = ReconnectConfig::default();

    loop {
        let conn = match client.connect().await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!(error = %e, "Event stream connect failed, entering reconnect loop");
                match reconnect_loop(client, &reconnect_config, cancel).await {
                    Some(conn) => conn,
                    None => return, // cancelled
                }
            }
        };

        let mut ws_stream = conn.ws_stream;
        process_frames(&mut ws_stream, event_tx, cancel).await;

        if cancel.is_cancelled() {
            return;
        }

        tracing::info!("Event stream dropped, reconnecting");
    }
}

/// Read frames until the stream closes, errors, or is cancelled.
async fn process_frames(
    ws_stream: &mut tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    event_tx: &broadcast::Sender<BackendEvent>,
    cancel: &CancellationToken,
) {
    loop {
        let msg_result = tokio::select! {
            _ = cancel.cancelled() => return,
            next = ws_stream.next() => match next {
                Some(result) => result,
                None => return,
            },
        };

        match msg_result {
            Ok(Message::Text(text)) => handle_text_frame(&text, event_tx),
            Ok(Message::Binary(_)) => {
                // Preview images; not needed for completion detection.
                tracing::trace!("Ignoring binary frame (preview image)");
            }
            Ok(Message::Ping(_) | Message::Pong(_)) => {
                // Handled automatically by tungstenite.
            }
            Ok(Message::Close(frame)) => {
                tracing::info!(?frame, "ComfyUI WebSocket closed");
                return;
            }
            Ok(Message::Frame(_)) => {}
            Err(e) => {
                tracing::error!(error = %e, "WebSocket receive error");
                return;
            }
        }
    }
}

/// Translate one text frame into zero or one [`BackendEvent`].
fn handle_text_frame(text: &str, event_tx: &broadcast::Sender<BackendEvent>) {
    let msg = match parse_message(text) {
        Ok(msg) => msg,
        Err(e) => {
            tracing::debug!(error = %e, raw_message = %text, "Unparsed ComfyUI message");
            return;
        }
    };

    if let Some(event) = message_to_event(msg) {
        // Send failures only mean there are no subscribers right now.
        let _ = event_tx.send(event);
    }
}

/// Map a parsed message onto the backend event taxonomy.
///
/// Returns `None` for messages that only warrant logging.
pub fn message_to_event(msg: ComfyUIMessage) -> Option<BackendEvent> {
    match msg {
        ComfyUIMessage::ExecutionStart(data) => Some(BackendEvent {
            handle: JobHandle(data.prompt_id),
            phase: JobPhase::Executing,
            detail: None,
        }),
        ComfyUIMessage::Executing(data) => {
            if data.node.is_none() {
                // node == None means the prompt finished all nodes.
                Some(BackendEvent {
                    handle: JobHandle(data.prompt_id),
                    phase: JobPhase::Completed,
                    detail: None,
                })
            } else {
                None
            }
        }
        ComfyUIMessage::ExecutionError(data) => Some(BackendEvent {
            handle: JobHandle(data.prompt_id),
            phase: JobPhase::Errored,
            detail: Some(data.exception_message),
        }),
        ComfyUIMessage::Executed(data) => {
            tracing::debug!(prompt_id = %data.prompt_id, node = %data.node, "Node executed");
            None
        }
        ComfyUIMessage::Progress(data) => {
            tracing::debug!(value = data.value, max = data.max, "Generation progress");
            None
        }
        ComfyUIMessage::ExecutionCached(data) => {
            tracing::debug!(prompt_id = %data.prompt_id, "Execution used cached nodes");
            None
        }
        ComfyUIMessage::Status(data) => {
            tracing::debug!(
                queue_remaining = data.status.exec_info.queue_remaining,
                "ComfyUI queue status",
            );
            None
        }
    }
}
