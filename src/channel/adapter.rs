//! Data Channel Adapter
//!
//! Binds the application channel (`canvasData`) of a peer connection and
//! exposes best-effort sending plus one replaceable receive callback.
//! Nothing is queued: a send while no channel is open is dropped.

use super::event::DrawEvent;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("Data channel is not open")]
    NotOpen,

    #[error("Failed to send on data channel: {0}")]
    SendFailed(String),

    #[error("Invalid draw event: {0}")]
    Codec(#[from] serde_json::Error),
}

// ============================================================================
// DATA CHANNEL PRIMITIVE
// ============================================================================

/// Callback for text messages arriving on a channel
pub type MessageHandler = Box<dyn Fn(String) + Send + Sync>;

/// Consumer of decoded draw events
pub type DrawHandler = Arc<dyn Fn(DrawEvent) + Send + Sync>;

/// A reliable, ordered data channel provided by the peer connection
#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> String;

    fn is_open(&self) -> bool;

    async fn send_text(&self, text: String) -> Result<(), ChannelError>;

    /// Replaces the message handler of this channel
    fn on_message(&self, handler: MessageHandler);

    async fn close(&self);
}

// ============================================================================
// ADAPTER
// ============================================================================

/// Shared handle to the application channel of one session
///
/// The locally created channel is used for sending; a channel with the
/// same label announced by the remote side is bound for receiving and
/// serves as fallback for sending.
#[derive(Clone)]
pub struct DataChannelAdapter {
    inner: Arc<AdapterInner>,
}

struct AdapterInner {
    label: String,
    local: RwLock<Option<Arc<dyn DataChannel>>>,
    remote: RwLock<Option<Arc<dyn DataChannel>>>,
    consumer: Arc<RwLock<Option<DrawHandler>>>,
}

impl DataChannelAdapter {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(AdapterInner {
                label: label.into(),
                local: RwLock::new(None),
                remote: RwLock::new(None),
                consumer: Arc::new(RwLock::new(None)),
            }),
        }
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Adopts the channel this peer created before its first offer
    pub fn attach_local(&self, channel: Arc<dyn DataChannel>) {
        channel.on_message(self.dispatcher());
        *self.inner.local.write() = Some(channel);
    }

    /// Binds a channel announced by the remote peer if its label matches
    pub fn bind_remote(&self, channel: Arc<dyn DataChannel>) -> bool {
        let label = channel.label();
        if label != self.inner.label {
            tracing::debug!("Ignoring data channel with label '{}'", label);
            return false;
        }

        tracing::info!("Bound remote data channel '{}'", label);
        channel.on_message(self.dispatcher());
        *self.inner.remote.write() = Some(channel);
        true
    }

    /// Registers the consumer of incoming events, dropping any previous one
    pub fn on_receive<F>(&self, callback: F)
    where
        F: Fn(DrawEvent) + Send + Sync + 'static,
    {
        *self.inner.consumer.write() = Some(Arc::new(callback));
    }

    /// True once any bound channel is open
    pub fn is_open(&self) -> bool {
        self.open_channel().is_some()
    }

    /// Best-effort send; silently dropped while no channel is open
    pub async fn send(&self, event: &DrawEvent) {
        match self.try_send(event).await {
            Ok(()) => {}
            Err(ChannelError::NotOpen) => {
                tracing::trace!("Data channel not open, dropping draw event");
            }
            Err(e) => tracing::warn!("Failed to send draw event: {}", e),
        }
    }

    /// Sends on the first open channel
    pub async fn try_send(&self, event: &DrawEvent) -> Result<(), ChannelError> {
        let channel = self.open_channel().ok_or(ChannelError::NotOpen)?;
        let text = event.to_json()?;
        channel.send_text(text).await
    }

    /// Closes and forgets all bound channels; the consumer stays registered
    pub async fn close(&self) {
        let local = self.inner.local.write().take();
        let remote = self.inner.remote.write().take();

        for channel in local.into_iter().chain(remote) {
            channel.close().await;
        }
    }

    fn open_channel(&self) -> Option<Arc<dyn DataChannel>> {
        let local = self.inner.local.read().clone();
        let remote = self.inner.remote.read().clone();
        local.into_iter().chain(remote).find(|c| c.is_open())
    }

    /// Handler installed on channels; it only holds the consumer slot
    fn dispatcher(&self) -> MessageHandler {
        let consumer = Arc::clone(&self.inner.consumer);
        Box::new(move |text: String| {
            let event = match decode(&text) {
                Ok(event) => event,
                Err(e) => {
                    tracing::warn!("Dropping malformed draw event: {}", e);
                    return;
                }
            };

            let callback = consumer.read().clone();
            if let Some(callback) = callback {
                callback(event);
            }
        })
    }
}

fn decode(text: &str) -> Result<DrawEvent, ChannelError> {
    Ok(DrawEvent::from_json(text)?)
}

impl std::fmt::Debug for DataChannelAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataChannelAdapter")
            .field("label", &self.inner.label)
            .field("is_open", &self.is_open())
            .finish()
    }
}
