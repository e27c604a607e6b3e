//! Polite/impolite role assignment

use crate::signaling::SessionId;

/// Role of the local peer towards one remote peer
///
/// The polite peer yields during an offer collision, the impolite peer
/// keeps its own offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    Polite,
    Impolite,
}

impl PeerRole {
    /// The local peer is polite iff the remote id sorts after the local id.
    /// Equal ids make both sides impolite.
    pub fn between(local: &SessionId, remote: &SessionId) -> Self {
        if remote > local {
            PeerRole::Polite
        } else {
            PeerRole::Impolite
        }
    }

    pub fn is_polite(self) -> bool {
        self == PeerRole::Polite
    }
}
