//! Peer-connection primitive as seen by the negotiation engine
//!
//! Callbacks of the underlying connection (candidate gathered,
//! negotiation needed, ICE state change, data channel, track) are turned
//! into `PeerEvent` messages on a single-consumer channel.

use super::engine::NegotiationError;
use crate::channel::DataChannel;
use crate::signaling::{IceCandidate, SessionDescription};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// JSEP signaling state of a peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Closed,
}

/// ICE connection state of a peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceState {
    New,
    Checking,
    Connected,
    Completed,
    Failed,
    Disconnected,
    Closed,
}

impl IceState {
    pub fn is_connected(self) -> bool {
        matches!(self, IceState::Connected | IceState::Completed)
    }
}

/// Events raised by the peer-connection primitive
pub enum PeerEvent {
    LocalCandidate(IceCandidate),
    NegotiationNeeded,
    IceStateChanged(IceState),
    DataChannel(Arc<dyn DataChannel>),
    Track { kind: String },
}

impl std::fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerEvent::LocalCandidate(c) => f.debug_tuple("LocalCandidate").field(c).finish(),
            PeerEvent::NegotiationNeeded => f.write_str("NegotiationNeeded"),
            PeerEvent::IceStateChanged(s) => f.debug_tuple("IceStateChanged").field(s).finish(),
            PeerEvent::DataChannel(dc) => f.debug_tuple("DataChannel").field(&dc.label()).finish(),
            PeerEvent::Track { kind } => f.debug_struct("Track").field("kind", kind).finish(),
        }
    }
}

/// Sender side handed to the primitive at construction
pub type PeerEvents = mpsc::UnboundedSender<PeerEvent>;

/// The peer-connection primitive
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self, ice_restart: bool)
        -> Result<SessionDescription, NegotiationError>;

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError>;

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError>;

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError>;

    /// Current local description, including candidates gathered so far
    async fn local_description(&self) -> Option<SessionDescription>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError>;

    fn signaling_state(&self) -> SignalingState;

    /// Creates an ordered, reliable channel
    async fn create_data_channel(
        &self,
        label: &str,
    ) -> Result<Arc<dyn DataChannel>, NegotiationError>;

    async fn close(&self) -> Result<(), NegotiationError>;
}

/// Builds primitives wired to an event sender
#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(&self, events: PeerEvents)
        -> Result<Arc<dyn PeerConnection>, NegotiationError>;
}
