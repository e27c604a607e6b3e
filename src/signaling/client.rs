//! WebSocket transport to the signaling relay
//!
//! Manages the WebSocket connection to the relay:
//! - Connect and wait for the handshake
//! - Outbound queue drained by a writer task
//! - Inbound frames parsed and forwarded in arrival order

use super::messages::SignalingEnvelope;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

/// Capacity of the outbound frame queue
const OUTBOUND_QUEUE: usize = 100;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum SignalingError {
    #[error("WebSocket connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected to signaling server")]
    NotConnected,

    #[error("Failed to send message: {0}")]
    SendFailed(String),
}

// ============================================================================
// TRANSPORT EVENTS
// ============================================================================

/// Events delivered by a signaling transport
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Parsed envelope from the remote peer
    Envelope(SignalingEnvelope),

    /// The pipe dropped
    Closed,
}

/// The single consumer side of a transport
pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;

// ============================================================================
// TRANSPORT TRAITS
// ============================================================================

/// An open pipe to the relay
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Serializes and queues an envelope without blocking
    fn send(&self, envelope: &SignalingEnvelope) -> Result<(), SignalingError>;

    fn is_open(&self) -> bool;

    /// Closes the pipe; calling it again is a no-op
    async fn close(&self);
}

/// Opens transports
///
/// `connect` resolves only once the pipe is ready to send.
#[async_trait]
pub trait TransportConnector: Send + Sync {
    async fn connect(
        &self,
    ) -> Result<(Arc<dyn SignalingTransport>, TransportEvents), SignalingError>;
}

// ============================================================================
// WEBSOCKET TRANSPORT
// ============================================================================

/// Connects to the relay over WebSocket
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: Url,
}

impl WebSocketConnector {
    pub fn new(url: Url) -> Self {
        Self { url }
    }
}

#[async_trait]
impl TransportConnector for WebSocketConnector {
    async fn connect(
        &self,
    ) -> Result<(Arc<dyn SignalingTransport>, TransportEvents), SignalingError> {
        let (transport, events) = WebSocketTransport::connect(&self.url).await?;
        Ok((Arc::new(transport), events))
    }
}

/// WebSocket connection to the relay
pub struct WebSocketTransport {
    url: Url,
    tx: Mutex<Option<mpsc::Sender<Message>>>,
    open: Arc<AtomicBool>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl WebSocketTransport {
    /// Connects and spawns the reader and writer tasks
    pub async fn connect(url: &Url) -> Result<(Self, TransportEvents), SignalingError> {
        tracing::info!("Connecting to signaling server: {}", url);

        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();

        let (tx, mut rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(true));

        // Reader
        let open_clone = Arc::clone(&open);
        let reader = tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                match frame {
                    Ok(Message::Text(text)) => match SignalingEnvelope::from_json(&text) {
                        Ok(envelope) => {
                            tracing::debug!("Received signaling envelope from {}", envelope.id);
                            if event_tx.send(TransportEvent::Envelope(envelope)).is_err() {
                                break;
                            }
                        }
                        Err(e) => tracing::warn!("Dropping malformed signaling frame: {}", e),
                    },
                    Ok(Message::Close(_)) => {
                        tracing::info!("WebSocket closed by server");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }

            open_clone.store(false, Ordering::SeqCst);
            let _ = event_tx.send(TransportEvent::Closed);
        });

        // Writer
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = write.send(msg).await {
                    tracing::error!("Failed to send WebSocket message: {}", e);
                    break;
                }
            }
            let _ = write.close().await;
        });

        tracing::info!("Connected to signaling server");

        let transport = Self {
            url: url.clone(),
            tx: Mutex::new(Some(tx)),
            open,
            reader: Mutex::new(Some(reader)),
        };
        Ok((transport, event_rx))
    }
}

#[async_trait]
impl SignalingTransport for WebSocketTransport {
    fn send(&self, envelope: &SignalingEnvelope) -> Result<(), SignalingError> {
        if !self.is_open() {
            return Err(SignalingError::NotConnected);
        }
        let guard = self.tx.lock();
        let tx = guard.as_ref().ok_or(SignalingError::NotConnected)?;

        let text = envelope
            .to_json()
            .map_err(|e| SignalingError::SendFailed(e.to_string()))?;

        // Never blocks the caller
        tx.try_send(Message::Text(text))
            .map_err(|e| SignalingError::SendFailed(e.to_string()))
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);

        // Dropping the sender lets the writer flush and close the socket
        if let Some(tx) = self.tx.lock().take() {
            let _ = tx.try_send(Message::Close(None));
        }
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
            tracing::info!("Signaling connection to {} closed", self.url);
        }
    }
}

impl std::fmt::Debug for WebSocketTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketTransport")
            .field("url", &self.url.as_str())
            .field("open", &self.is_open())
            .finish()
    }
}
