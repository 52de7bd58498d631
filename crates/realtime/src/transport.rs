//! Opens the realtime channel and bridges it to in-process queues.

use crate::error::ConnectionError;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use oracle_realtime_types::{ClientEvent, InboundMessage};
use secrecy::{ExposeSecret, SecretString};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, http::HeaderValue, protocol::Message as WsMessage},
};
use tracing::{debug, error, info, warn};

const OUTBOUND_BUFFER: usize = 256;
const INBOUND_BUFFER: usize = 256;

/// Aborts the background I/O tasks of a connection when dropped.
#[derive(Debug, Default)]
pub struct ConnectionGuard {
    tasks: Vec<JoinHandle<()>>,
}

impl ConnectionGuard {
    pub fn new(tasks: Vec<JoinHandle<()>>) -> Self {
        Self { tasks }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// An open channel. Outbound events are written in send order and inbound
/// frames are delivered in arrival order.
#[derive(Debug)]
pub struct RealtimeConnection {
    pub outbound: mpsc::Sender<ClientEvent>,
    pub inbound: mpsc::Receiver<InboundMessage>,
    pub guard: ConnectionGuard,
}

/// Anything that can open a realtime channel.
#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    async fn connect(&self) -> Result<RealtimeConnection, ConnectionError>;
}

/// WebSocket transport, either straight to the service or through a local relay
/// that holds the credential on the caller's behalf.
pub struct WebSocketTransport {
    url: String,
    model: Option<String>,
    api_key: Option<SecretString>,
    requires_key: bool,
}

impl WebSocketTransport {
    /// Connects directly to the service; an API key is required at connect time.
    pub fn direct(url: impl Into<String>, model: impl Into<String>, api_key: Option<SecretString>) -> Self {
        Self {
            url: url.into(),
            model: Some(model.into()),
            api_key,
            requires_key: true,
        }
    }

    /// Connects through a relay server, which authenticates upstream itself.
    pub fn relay(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            model: None,
            api_key: None,
            requires_key: false,
        }
    }

    fn request_url(&self) -> String {
        match &self.model {
            Some(model) => format!("{}?model={}", self.url, model),
            None => self.url.clone(),
        }
    }
}

#[async_trait]
impl RealtimeTransport for WebSocketTransport {
    async fn connect(&self) -> Result<RealtimeConnection, ConnectionError> {
        if self.url.trim().is_empty() {
            return Err(ConnectionError::MissingEndpoint);
        }
        let api_key = match (&self.api_key, self.requires_key) {
            (Some(key), _) => Some(key),
            (None, true) => return Err(ConnectionError::MissingCredential),
            (None, false) => None,
        };

        let mut request = self
            .request_url()
            .into_client_request()
            .map_err(|e| ConnectionError::InvalidEndpoint(e.to_string()))?;
        if let Some(key) = api_key {
            let bearer = HeaderValue::from_str(&format!("Bearer {}", key.expose_secret()))
                .map_err(|e| ConnectionError::InvalidEndpoint(e.to_string()))?;
            request.headers_mut().insert("Authorization", bearer);
        }
        request
            .headers_mut()
            .insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));

        let (ws_stream, _) = connect_async(request)
            .await
            .map_err(|e| ConnectionError::Handshake(e.to_string()))?;
        let (mut ws_tx, mut ws_rx) = ws_stream.split();
        info!(url = %self.url, "Connected to realtime endpoint.");

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<ClientEvent>(OUTBOUND_BUFFER);
        let (inbound_tx, inbound_rx) = mpsc::channel::<InboundMessage>(INBOUND_BUFFER);

        let writer = tokio::spawn(async move {
            while let Some(event) = outbound_rx.recv().await {
                let text = match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(e) => {
                        error!(kind = event.kind(), error = %e, "Failed to serialize client event");
                        continue;
                    }
                };
                if let Err(e) = ws_tx.send(WsMessage::Text(text.into())).await {
                    error!("Error writing to realtime WebSocket: {}", e);
                    break;
                }
            }
            let _ = ws_tx.close().await;
            debug!("Realtime writer finished.");
        });

        let reader = tokio::spawn(async move {
            while let Some(frame) = ws_rx.next().await {
                match frame {
                    Ok(WsMessage::Text(text)) => match InboundMessage::from_text(&text) {
                        Ok(message) => {
                            if inbound_tx.send(message).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!(error = %e, "Discarding non-JSON realtime frame"),
                    },
                    Ok(WsMessage::Close(close_frame)) => {
                        info!(?close_frame, "Realtime WebSocket closed by server.");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("Error reading from realtime WebSocket: {}", e);
                        break;
                    }
                }
            }
            debug!("Realtime reader finished.");
        });

        Ok(RealtimeConnection {
            outbound: outbound_tx,
            inbound: inbound_rx,
            guard: ConnectionGuard::new(vec![writer, reader]),
        })
    }
}
