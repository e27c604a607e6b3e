//! Message types for the signaling protocol
//!
//! Every frame on the relay is a JSON object carrying the sender's
//! session id plus exactly one of `description` or `candidate`:
//!
//! ```json
//! { "id": "...", "description": { "kind": "offer", "payload": "v=0..." } }
//! { "id": "...", "candidate": { "payload": "candidate:...", "mediaId": "0", "lineIndex": 0 } }
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

// ============================================================================
// SESSION ID
// ============================================================================

/// Random identifier of one session, only used as a tie-breaking key
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Generates a fresh random id
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// PAYLOADS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DescriptionKind {
    Offer,
    Answer,
    Rollback,
}

impl fmt::Display for DescriptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DescriptionKind::Offer => "offer",
            DescriptionKind::Answer => "answer",
            DescriptionKind::Rollback => "rollback",
        };
        f.write_str(s)
    }
}

/// Session description (SDP) exchanged as offer or answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub kind: DescriptionKind,
    pub payload: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: DescriptionKind::Offer,
            payload: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: DescriptionKind::Answer,
            payload: sdp.into(),
        }
    }

    /// Rollback carries no SDP
    pub fn rollback() -> Self {
        Self {
            kind: DescriptionKind::Rollback,
            payload: String::new(),
        }
    }

    pub fn is_offer(&self) -> bool {
        self.kind == DescriptionKind::Offer
    }
}

/// ICE candidate as gathered by the local peer connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub payload: String,
    pub media_id: String,
    pub line_index: u16,
}

// ============================================================================
// ENVELOPE
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("envelope carries neither a description nor a candidate")]
    Empty,

    #[error("envelope carries both a description and a candidate")]
    Ambiguous,
}

/// What a signaling envelope carries
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    Description(SessionDescription),
    Candidate(IceCandidate),
}

/// One frame on the relay, always tagged with the sender's id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "WireEnvelope", into = "WireEnvelope")]
pub struct SignalingEnvelope {
    pub id: SessionId,
    pub signal: Signal,
}

impl SignalingEnvelope {
    pub fn description(id: SessionId, description: SessionDescription) -> Self {
        Self {
            id,
            signal: Signal::Description(description),
        }
    }

    pub fn candidate(id: SessionId, candidate: IceCandidate) -> Self {
        Self {
            id,
            signal: Signal::Candidate(candidate),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Flat wire shape with optional fields
#[derive(Serialize, Deserialize)]
struct WireEnvelope {
    id: SessionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    description: Option<SessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    candidate: Option<IceCandidate>,
}

impl TryFrom<WireEnvelope> for SignalingEnvelope {
    type Error = EnvelopeError;

    fn try_from(wire: WireEnvelope) -> Result<Self, Self::Error> {
        let signal = match (wire.description, wire.candidate) {
            (Some(description), None) => Signal::Description(description),
            (None, Some(candidate)) => Signal::Candidate(candidate),
            (None, None) => return Err(EnvelopeError::Empty),
            (Some(_), Some(_)) => return Err(EnvelopeError::Ambiguous),
        };
        Ok(Self {
            id: wire.id,
            signal,
        })
    }
}

impl From<SignalingEnvelope> for WireEnvelope {
    fn from(envelope: SignalingEnvelope) -> Self {
        let (description, candidate) = match envelope.signal {
            Signal::Description(d) => (Some(d), None),
            Signal::Candidate(c) => (None, Some(c)),
        };
        Self {
            id: envelope.id,
            description,
            candidate,
        }
    }
}
