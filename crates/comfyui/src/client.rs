//! WebSocket client for a ComfyUI server.
//!
//! [`ComfyUIClient`] holds the connection configuration; call
//! [`ComfyUIClient::connect`] to open a live [`ComfyUIConnection`].

use tokio_tungstenite::{connect_async, MaybeTlsStream};

/// Connection configuration for one ComfyUI server.
pub struct ComfyUIClient {
    ws_url: String,
}

/// A live WebSocket connection.
pub struct ComfyUIConnection {
    /// Unique client ID sent during the handshake; ComfyUI uses it to
    /// address messages back to this consumer.
    pub client_id: String,
    /// The raw WebSocket stream for reading frames.
    pub ws_stream: tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
}

/// Errors from the WebSocket layer.
#[derive(Debug, thiserror::Error)]
pub enum ComfyUIClientError {
    /// Failed to establish the initial connection.
    #[error("Connection error: {0}")]
    Connection(String),
}

impl ComfyUIClient {
    /// Create a client targeting a ComfyUI server.
    ///
    /// * `ws_url` - WebSocket base URL, e.g. `ws://host:8188`.
    pub fn new(ws_url: String) -> Self {
        Self { ws_url }
    }

    /// WebSocket base URL.
    pub fn ws_url(&self) -> &str {
        &self.ws_url
    }

    /// Connect to the `/ws` endpoint with a fresh UUID client id.
    pub async fn connect(&self) -> Result<ComfyUIConnection, ComfyUIClientError> {
        let client_id = uuid::Uuid::new_v4().to_string();
        let url = format!("{}/ws?clientId={}", self.ws_url, client_id);

        let (ws_stream, _response) = connect_async(&url).await.map_err(|e| {
            ComfyUIClientError::Connection(format!(
                "Failed to connect to ComfyUI at {}: {e}",
                self.ws_url
            ))
        })?;

        tracing::info!(
            client_id = %client_id,
            "Connected to ComfyUI at {}",
            self.ws_url,
        );

        Ok(ComfyUIConnection {
            client_id,
            ws_stream,
        })
    }
}
