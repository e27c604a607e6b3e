//! Negotiation Engine
//!
//! Owns the peer connection of one session and drives it with perfect
//! negotiation:
//! - Offer collisions are resolved by the polite/impolite role
//! - ICE failure triggers one ICE restart
//! - ICE disconnect tears the session down
//!
//! Every input (remote envelope, primitive callback, controller command)
//! is a message handled to completion by one event loop. An offer in
//! flight is a spawned task whose completion is one more loop input, so
//! `making_offer` stays set while envelopes keep being processed.

use super::peer::{
    IceState, PeerConnection, PeerConnectionFactory, PeerEvent, PeerEvents, SignalingState,
};
use super::role::PeerRole;
use crate::channel::DataChannelAdapter;
use crate::signaling::{
    IceCandidate, SessionDescription, SessionId, Signal, SignalingEnvelope, SignalingError,
    SignalingTransport, TransportConnector, TransportEvent, TransportEvents,
};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinHandle};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum NegotiationError {
    #[error("WebRTC error: {0}")]
    WebRTC(String),

    #[error("Invalid SDP: {0}")]
    InvalidSdp(String),

    #[error("Invalid signaling state: {0}")]
    InvalidState(String),

    #[error("Peer connection is closed")]
    Closed,

    #[error("Signaling transport error: {0}")]
    Transport(#[from] SignalingError),
}

// ============================================================================
// STATE
// ============================================================================

/// Connection state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Negotiating,
    Connected,
    Failed,
    Disconnected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Negotiating => "negotiating",
            ConnectionState::Connected => "connected",
            ConnectionState::Failed => "failed",
            ConnectionState::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NegotiationFlags {
    pub making_offer: bool,
    pub ignore_offer: bool,
}

/// Why the event loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    Requested,
    IceDisconnected,
    TransportClosed,
}

/// Fate of a candidate received from the remote peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CandidateOutcome {
    Applied,
    /// Failed while an offer is being ignored
    Suppressed,
    Rejected,
}

// ============================================================================
// HANDLES
// ============================================================================

pub(crate) enum EngineCommand {
    Disconnect { reply: oneshot::Sender<()> },
}

/// Event sources consumed by the loop
pub struct EngineInputs {
    peer_events: mpsc::UnboundedReceiver<PeerEvent>,
    transport_events: TransportEvents,
}

/// Handle to a running engine
pub struct EngineHandle {
    id: SessionId,
    commands: mpsc::UnboundedSender<EngineCommand>,
    task: JoinHandle<Shutdown>,
}

impl EngineHandle {
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// True once the loop has stopped on its own
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Asks the loop to tear down and waits for it to stop
    pub async fn disconnect(self) -> Option<Shutdown> {
        let (reply, done) = oneshot::channel();
        if self
            .commands
            .send(EngineCommand::Disconnect { reply })
            .is_ok()
        {
            let _ = done.await;
        }

        match self.task.await {
            Ok(shutdown) => Some(shutdown),
            Err(e) => {
                tracing::warn!("Engine task of session {} ended abnormally: {}", self.id, e);
                None
            }
        }
    }
}

type OfferTask = JoinHandle<Result<(), NegotiationError>>;

// ============================================================================
// NEGOTIATION ENGINE
// ============================================================================

pub struct NegotiationEngine {
    id: SessionId,
    peer: Option<Arc<dyn PeerConnection>>,
    transport: Option<Arc<dyn SignalingTransport>>,
    channel: DataChannelAdapter,
    flags: NegotiationFlags,
    state: Arc<watch::Sender<ConnectionState>>,
    ice_state: IceState,
    ice_restarted: bool,
    restart_pending: bool,
    pending_offer: Option<OfferTask>,
}

impl NegotiationEngine {
    /// Opens the transport, builds the peer connection and creates the
    /// application channel
    pub async fn connect(
        transports: &dyn TransportConnector,
        peers: &dyn PeerConnectionFactory,
        channel: DataChannelAdapter,
        state: Arc<watch::Sender<ConnectionState>>,
    ) -> Result<(Self, EngineInputs), NegotiationError> {
        state.send_replace(ConnectionState::Connecting);

        let id = SessionId::generate();
        tracing::info!("Starting session {}", id);

        let (transport, transport_events) = match transports.connect().await {
            Ok(opened) => opened,
            Err(e) => {
                tracing::error!("Failed to open signaling transport: {}", e);
                state.send_replace(ConnectionState::Idle);
                return Err(e.into());
            }
        };

        let (event_tx, peer_events) = mpsc::unbounded_channel();
        let mut engine = Self {
            id,
            peer: None,
            transport: Some(transport),
            channel,
            flags: NegotiationFlags::default(),
            state,
            ice_state: IceState::New,
            ice_restarted: false,
            restart_pending: false,
            pending_offer: None,
        };

        if let Err(e) = engine.open_peer(peers, event_tx).await {
            tracing::error!("Failed to set up peer connection: {}", e);
            engine.disconnect().await;
            return Err(e);
        }

        let inputs = EngineInputs {
            peer_events,
            transport_events,
        };
        Ok((engine, inputs))
    }

    async fn open_peer(
        &mut self,
        peers: &dyn PeerConnectionFactory,
        events: PeerEvents,
    ) -> Result<(), NegotiationError> {
        let peer = peers.create(events).await?;
        self.peer = Some(Arc::clone(&peer));

        let channel = peer.create_data_channel(self.channel.label()).await?;
        self.channel.attach_local(channel);
        Ok(())
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn flags(&self) -> NegotiationFlags {
        self.flags
    }

    /// Runs the event loop on its own task
    pub fn spawn(self, inputs: EngineInputs) -> EngineHandle {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let id = self.id.clone();
        let task = tokio::spawn(self.run(inputs, command_rx));
        EngineHandle { id, commands, task }
    }

    async fn run(
        mut self,
        mut inputs: EngineInputs,
        mut commands: mpsc::UnboundedReceiver<EngineCommand>,
    ) -> Shutdown {
        loop {
            tokio::select! {
                biased;

                command = commands.recv() => {
                    // A dropped handle counts as a disconnect request
                    let reply = command.map(|EngineCommand::Disconnect { reply }| reply);
                    self.disconnect().await;
                    if let Some(reply) = reply {
                        let _ = reply.send(());
                    }
                    return Shutdown::Requested;
                }

                result = wait_offer(&mut self.pending_offer), if self.pending_offer.is_some() => {
                    self.finish_offer(result);
                }

                Some(event) = inputs.peer_events.recv() => {
                    if let Some(shutdown) = self.handle_peer_event(event).await {
                        return shutdown;
                    }
                }

                event = inputs.transport_events.recv() => match event {
                    Some(TransportEvent::Envelope(envelope)) => {
                        self.handle_remote_envelope(envelope).await;
                    }
                    Some(TransportEvent::Closed) | None => {
                        tracing::warn!("Signaling transport of session {} dropped", self.id);
                        self.set_state(ConnectionState::Disconnected);
                        self.disconnect().await;
                        return Shutdown::TransportClosed;
                    }
                },
            }
        }
    }

    async fn handle_peer_event(&mut self, event: PeerEvent) -> Option<Shutdown> {
        match event {
            PeerEvent::LocalCandidate(candidate) => self.on_local_candidate(candidate),
            PeerEvent::NegotiationNeeded => self.on_negotiation_needed(),
            PeerEvent::IceStateChanged(state) => return self.on_ice_state_change(state).await,
            PeerEvent::DataChannel(channel) => {
                self.channel.bind_remote(channel);
            }
            PeerEvent::Track { kind } => {
                tracing::info!("Received remote {} track, no media handling", kind);
            }
        }
        None
    }

    // ========================================================================
    // PRIMITIVE CALLBACKS
    // ========================================================================

    /// Forwards a gathered candidate to the remote peer
    pub fn on_local_candidate(&self, candidate: IceCandidate) {
        let Some(transport) = self.transport.as_ref().filter(|t| t.is_open()) else {
            return;
        };

        let envelope = SignalingEnvelope::candidate(self.id.clone(), candidate);
        if let Err(e) = transport.send(&envelope) {
            tracing::warn!("Failed to send ICE candidate: {}", e);
        }
    }

    pub fn on_negotiation_needed(&mut self) {
        tracing::debug!("Negotiation needed for session {}", self.id);
        self.start_offer(false);
    }

    pub async fn on_ice_state_change(&mut self, state: IceState) -> Option<Shutdown> {
        tracing::info!("ICE connection state of session {}: {:?}", self.id, state);
        self.ice_state = state;

        match state {
            IceState::Connected | IceState::Completed => {
                self.ice_restarted = false;
                self.restart_pending = false;
                self.set_state(ConnectionState::Connected);
            }
            IceState::Failed => {
                self.set_state(ConnectionState::Failed);
                if self.ice_restarted {
                    tracing::error!("ICE failed again after restart, giving up");
                } else if self.flags.making_offer {
                    tracing::warn!("ICE failed during an offer, restarting once it completes");
                    self.ice_restarted = true;
                    self.restart_pending = true;
                } else if self.start_offer(true) {
                    tracing::warn!("ICE failed, restarting");
                    self.ice_restarted = true;
                }
            }
            IceState::Disconnected => {
                self.set_state(ConnectionState::Disconnected);
                self.disconnect().await;
                return Some(Shutdown::IceDisconnected);
            }
            _ => {}
        }
        None
    }

    // ========================================================================
    // OFFERS
    // ========================================================================

    /// Spawns an offer unless one is already in flight
    fn start_offer(&mut self, ice_restart: bool) -> bool {
        if self.flags.making_offer {
            tracing::debug!("Offer already in flight, skipping");
            return false;
        }
        let (Some(peer), Some(transport)) = (self.peer.clone(), self.transport.clone()) else {
            return false;
        };

        self.flags.making_offer = true;
        self.set_state(ConnectionState::Negotiating);

        let id = self.id.clone();
        self.pending_offer = Some(tokio::spawn(make_offer(peer, transport, id, ice_restart)));
        true
    }

    /// Clears `making_offer` whatever the offer task's outcome
    fn finish_offer(&mut self, result: Result<Result<(), NegotiationError>, JoinError>) {
        self.pending_offer = None;
        self.flags.making_offer = false;

        match result {
            Ok(Ok(())) => tracing::debug!("Offer of session {} sent", self.id),
            Ok(Err(e)) => tracing::warn!("Failed to make offer: {}", e),
            Err(e) => tracing::warn!("Offer task ended abnormally: {}", e),
        }

        if std::mem::take(&mut self.restart_pending) && self.start_offer(true) {
            tracing::warn!("Restarting ICE after the previous offer");
        }
    }

    #[cfg(test)]
    pub(crate) async fn settle_offer(&mut self) {
        if self.pending_offer.is_some() {
            let result = wait_offer(&mut self.pending_offer).await;
            self.finish_offer(result);
        }
    }

    // ========================================================================
    // REMOTE ENVELOPES
    // ========================================================================

    /// Applies one envelope from the remote peer
    pub async fn handle_remote_envelope(&mut self, envelope: SignalingEnvelope) {
        let Some(peer) = self.peer.clone() else {
            tracing::debug!("No peer connection, dropping envelope from {}", envelope.id);
            return;
        };
        let role = PeerRole::between(&self.id, &envelope.id);

        match envelope.signal {
            Signal::Description(description) => {
                let kind = description.kind;
                if let Err(e) = self.accept_description(&peer, role, description).await {
                    tracing::warn!("Failed to apply remote {}: {}", kind, e);
                }
            }
            Signal::Candidate(candidate) => {
                self.add_remote_candidate(&peer, candidate).await;
            }
        }
    }

    /// Failures are expected for candidates of an ignored offer
    async fn add_remote_candidate(
        &self,
        peer: &Arc<dyn PeerConnection>,
        candidate: IceCandidate,
    ) -> CandidateOutcome {
        match peer.add_ice_candidate(candidate).await {
            Ok(()) => CandidateOutcome::Applied,
            Err(e) if self.flags.ignore_offer => {
                tracing::debug!("Dropped candidate of ignored offer: {}", e);
                CandidateOutcome::Suppressed
            }
            Err(e) => {
                tracing::warn!("Failed to add remote ICE candidate: {}", e);
                CandidateOutcome::Rejected
            }
        }
    }

    async fn accept_description(
        &mut self,
        peer: &Arc<dyn PeerConnection>,
        role: PeerRole,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        let is_offer = description.is_offer();
        let offer_collision = is_offer
            && (self.flags.making_offer || peer.signaling_state() != SignalingState::Stable);

        self.flags.ignore_offer = !role.is_polite() && offer_collision;
        if self.flags.ignore_offer {
            tracing::debug!("Ignoring colliding offer as impolite peer");
            // Our own offer may have been consumed by the remote rollback
            if !self.flags.making_offer {
                self.start_offer(false);
            }
            return Ok(());
        }

        if offer_collision {
            tracing::debug!("Offer collision, rolling back as polite peer");
            tokio::try_join!(
                peer.set_local_description(SessionDescription::rollback()),
                peer.set_remote_description(description)
            )?;
        } else {
            peer.set_remote_description(description).await?;
        }

        if is_offer {
            self.set_state(ConnectionState::Negotiating);

            let answer = peer.create_answer().await?;
            peer.set_local_description(answer.clone()).await?;
            let answer = peer.local_description().await.unwrap_or(answer);

            self.send_envelope(SignalingEnvelope::description(self.id.clone(), answer))?;
        }

        self.settle_state(peer);
        Ok(())
    }

    fn send_envelope(&self, envelope: SignalingEnvelope) -> Result<(), NegotiationError> {
        let transport = self
            .transport
            .as_ref()
            .ok_or(SignalingError::NotConnected)?;
        transport.send(&envelope)?;
        Ok(())
    }

    /// Back to connected once a renegotiation completes on a live ICE path
    fn settle_state(&self, peer: &Arc<dyn PeerConnection>) {
        if peer.signaling_state() == SignalingState::Stable && self.ice_state.is_connected() {
            self.set_state(ConnectionState::Connected);
        }
    }

    // ========================================================================
    // TEARDOWN
    // ========================================================================

    /// Closes data channel, peer connection and transport, in that order
    pub async fn disconnect(&mut self) {
        if let Some(offer) = self.pending_offer.take() {
            offer.abort();
        }
        self.flags = NegotiationFlags::default();

        self.channel.close().await;

        if let Some(peer) = self.peer.take() {
            if let Err(e) = peer.close().await {
                tracing::warn!("Failed to close peer connection: {}", e);
            }
        }

        if let Some(transport) = self.transport.take() {
            transport.close().await;
            tracing::info!("Session {} closed", self.id);
        }

        self.ice_state = IceState::New;
        self.ice_restarted = false;
        self.restart_pending = false;
        self.set_state(ConnectionState::Idle);
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::info!("Session {} state: {} -> {}", self.id, previous, state);
        }
    }
}

impl fmt::Debug for NegotiationEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NegotiationEngine")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("flags", &self.flags)
            .field("ice_state", &self.ice_state)
            .finish()
    }
}

/// Creates an offer, applies it and sends it to the remote peer
async fn make_offer(
    peer: Arc<dyn PeerConnection>,
    transport: Arc<dyn SignalingTransport>,
    id: SessionId,
    ice_restart: bool,
) -> Result<(), NegotiationError> {
    let offer = peer.create_offer(ice_restart).await?;
    peer.set_local_description(offer.clone()).await?;
    let offer = peer.local_description().await.unwrap_or(offer);

    transport.send(&SignalingEnvelope::description(id, offer))?;
    Ok(())
}

async fn wait_offer(slot: &mut Option<OfferTask>) -> Result<Result<(), NegotiationError>, JoinError> {
    match slot.as_mut() {
        Some(task) => task.await,
        None => std::future::pending().await,
    }
}
