//! Session Controller
//!
//! Single entry point for the drawing surface: connect, send and receive
//! draw events, disconnect. Owns at most one running negotiation engine.

use crate::channel::{DataChannelAdapter, DrawEvent, StrokeAssembler, StrokeUpdate};
use crate::config::{ConfigError, SessionConfig};
use crate::negotiation::{
    ConnectionState, EngineHandle, NegotiationEngine, NegotiationError, PeerConnectionFactory,
    WebRtcFactory,
};
use crate::signaling::{SessionId, SignalingError, TransportConnector, WebSocketConnector};
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Signaling transport error: {0}")]
    Transport(#[from] SignalingError),

    #[error("Negotiation error: {0}")]
    Negotiation(NegotiationError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl From<NegotiationError> for SessionError {
    fn from(e: NegotiationError) -> Self {
        match e {
            NegotiationError::Transport(e) => SessionError::Transport(e),
            other => SessionError::Negotiation(other),
        }
    }
}

// ============================================================================
// SESSION STATUS
// ============================================================================

/// Coarse status shown to the user
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Idle,
    Calling,
    InProgress,
}

impl From<ConnectionState> for SessionStatus {
    fn from(state: ConnectionState) -> Self {
        match state {
            ConnectionState::Idle => SessionStatus::Idle,
            ConnectionState::Connected => SessionStatus::InProgress,
            _ => SessionStatus::Calling,
        }
    }
}

// ============================================================================
// SESSION CONTROLLER
// ============================================================================

pub struct SessionController {
    config: SessionConfig,
    transports: Arc<dyn TransportConnector>,
    peers: Arc<dyn PeerConnectionFactory>,
    channel: DataChannelAdapter,
    state: Arc<watch::Sender<ConnectionState>>,
    strokes: Arc<Mutex<StrokeAssembler>>,
    active: tokio::sync::Mutex<Option<EngineHandle>>,
}

impl SessionController {
    /// Controller using the WebSocket relay and webrtc-rs
    pub fn new(config: SessionConfig) -> Self {
        let transports = Arc::new(WebSocketConnector::new(config.signaling_url.clone()));
        let peers = Arc::new(WebRtcFactory::new(config.ice_servers.clone()));
        Self::with_backends(config, transports, peers)
    }

    /// Controller configured from `SIGNALING_URL` and `ICE_SERVERS`
    pub fn from_env() -> Result<Self, SessionError> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    fn from_vars<F>(var: F) -> Result<Self, SessionError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let config = SessionConfig::from_vars(var)?;
        Ok(Self::new(config))
    }

    pub fn with_backends(
        config: SessionConfig,
        transports: Arc<dyn TransportConnector>,
        peers: Arc<dyn PeerConnectionFactory>,
    ) -> Self {
        let channel = DataChannelAdapter::new(config.channel_label.clone());
        let (state, _) = watch::channel(ConnectionState::Idle);

        Self {
            config,
            transports,
            peers,
            channel,
            state: Arc::new(state),
            strokes: Arc::new(Mutex::new(StrokeAssembler::new())),
            active: tokio::sync::Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Starts a session; returns the running one if already in progress
    pub async fn connect(&self) -> Result<SessionId, SessionError> {
        let mut active = self.active.lock().await;

        if let Some(handle) = active.as_ref() {
            if !handle.is_finished() {
                tracing::debug!("Session {} already in progress", handle.id());
                return Ok(handle.id().clone());
            }
        }

        // Reap a session that ended on its own
        if let Some(handle) = active.take() {
            if let Some(reason) = handle.disconnect().await {
                tracing::debug!("Previous session ended: {:?}", reason);
            }
        }

        *self.strokes.lock() = StrokeAssembler::new();

        let (engine, inputs) = NegotiationEngine::connect(
            self.transports.as_ref(),
            self.peers.as_ref(),
            self.channel.clone(),
            Arc::clone(&self.state),
        )
        .await?;

        let handle = engine.spawn(inputs);
        let id = handle.id().clone();
        *active = Some(handle);
        Ok(id)
    }

    /// Best-effort send to the remote peer
    pub async fn send(&self, event: DrawEvent) {
        self.channel.send(&event).await;
    }

    /// Registers the consumer of raw draw events
    ///
    /// Shares one slot with `on_stroke`: the last registration wins.
    pub fn on_receive<F>(&self, callback: F)
    where
        F: Fn(DrawEvent) + Send + Sync + 'static,
    {
        self.channel.on_receive(callback);
    }

    /// Registers a consumer of remote events interpreted as path operations
    pub fn on_stroke<F>(&self, callback: F)
    where
        F: Fn(StrokeUpdate) + Send + Sync + 'static,
    {
        let strokes = Arc::clone(&self.strokes);
        self.channel.on_receive(move |event| {
            let update = strokes.lock().apply(&event);
            if let Some(update) = update {
                callback(update);
            }
        });
    }

    /// Tears the session down; safe to call in any state
    pub async fn disconnect(&self) {
        let handle = self.active.lock().await.take();

        match handle {
            Some(handle) => {
                handle.disconnect().await;
            }
            None => {
                self.state.send_replace(ConnectionState::Idle);
            }
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn status(&self) -> SessionStatus {
        self.state().into()
    }

    /// Receiver observing every state change
    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Id of the running session, if any
    pub async fn session_id(&self) -> Option<SessionId> {
        let active = self.active.lock().await;
        active
            .as_ref()
            .filter(|handle| !handle.is_finished())
            .map(|handle| handle.id().clone())
    }
}

impl std::fmt::Debug for SessionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionController")
            .field("signaling_url", &self.config.signaling_url.as_str())
            .field("state", &self.state())
            .field("channel", &self.channel)
            .finish()
    }
}
