//! Negotiation Module - perfect negotiation over one peer connection
//!
//! - Peer-connection primitive and its events
//! - Polite/impolite role from session ids
//! - Event-loop engine resolving offer collisions
//! - webrtc-rs backend

mod engine;
mod peer;
mod role;
mod webrtc;

pub use engine::{
    ConnectionState, EngineHandle, EngineInputs, NegotiationEngine, NegotiationError,
    NegotiationFlags, Shutdown,
};
pub use peer::{
    IceState, PeerConnection, PeerConnectionFactory, PeerEvent, PeerEvents, SignalingState,
};
pub use role::PeerRole;
pub use self::webrtc::{WebRtcChannel, WebRtcFactory, WebRtcPeer};
