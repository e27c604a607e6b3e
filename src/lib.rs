//! Scribble RTC - peer-to-peer collaborative drawing session core
//!
//! Two peers exchange drawing events over a WebRTC data channel with:
//! - WebSocket relay for signaling
//! - Perfect negotiation (polite/impolite roles, rollback, ICE restart)
//! - JSON draw events on the `canvasData` channel

pub mod channel;
pub mod config;
pub mod negotiation;
pub mod session;
pub mod signaling;

#[cfg(test)]
pub(crate) mod testing;

pub use channel::{DrawEvent, StrokeUpdate};
pub use config::{ConfigError, SessionConfig};
pub use negotiation::{ConnectionState, NegotiationError};
pub use session::{SessionController, SessionError, SessionStatus};
pub use signaling::{SessionId, SignalingError};

use tracing_subscriber::EnvFilter;

/// Installs the fmt subscriber; `RUST_LOG` adds to the default directives
///
/// Does nothing if a global subscriber is already set.
pub fn init_tracing() {
    let mut filter = EnvFilter::from_default_env();
    for directive in ["scribble_rtc=debug", "webrtc=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    if tracing_subscriber::fmt().with_env_filter(filter).try_init().is_ok() {
        tracing::info!("Tracing initialized");
    }
}
