//! Signaling Module - WebSocket pipe to the relay
//!
//! This module handles the communication with the signaling relay:
//! - Open and hold the WebSocket connection
//! - Serialize and send envelopes
//! - Parse incoming envelopes and forward them to a single consumer
//!

mod client;
mod messages;

pub use client::{
    SignalingError, SignalingTransport, TransportConnector, TransportEvent, TransportEvents,
    WebSocketConnector, WebSocketTransport,
};
pub use messages::*;
