//! In-memory backends for tests
//!
//! - `SimPeer`: JSEP state machine with an offer gate
//! - `SimChannel`: data channel recording what was sent
//! - `RecordingConnector` / `SimTransport`: transports with injectable events
//! - `SimRelay`: pairs two sessions the way the signaling relay does

use crate::channel::{ChannelError, DataChannel, MessageHandler};
use crate::negotiation::{
    IceState, NegotiationError, PeerConnection, PeerConnectionFactory, PeerEvent, PeerEvents,
    SignalingState,
};
use crate::signaling::{
    DescriptionKind, IceCandidate, SessionDescription, Signal, SignalingEnvelope, SignalingError,
    SignalingTransport, TransportConnector, TransportEvent, TransportEvents,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// Lets every runnable task finish; needs a paused clock
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

fn count_descriptions(envelopes: &[SignalingEnvelope], kind: DescriptionKind) -> usize {
    envelopes
        .iter()
        .filter(|e| matches!(&e.signal, Signal::Description(d) if d.kind == kind))
        .count()
}

// ============================================================================
// DATA CHANNEL
// ============================================================================

pub struct SimChannel {
    label: String,
    open: AtomicBool,
    sent: Mutex<Vec<String>>,
    handler: Mutex<Option<MessageHandler>>,
}

impl SimChannel {
    pub fn new(label: &str) -> Arc<Self> {
        Arc::new(Self {
            label: label.to_string(),
            open: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
            handler: Mutex::new(None),
        })
    }

    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::SeqCst);
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }

    /// Hands a text message to the installed handler
    pub fn deliver(&self, text: &str) {
        if let Some(handler) = self.handler.lock().as_ref() {
            handler(text.to_string());
        }
    }
}

#[async_trait]
impl DataChannel for SimChannel {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn is_open(&self) -> bool {
        SimChannel::is_open(self)
    }

    async fn send_text(&self, text: String) -> Result<(), ChannelError> {
        if !SimChannel::is_open(self) {
            return Err(ChannelError::NotOpen);
        }
        self.sent.lock().push(text);
        Ok(())
    }

    fn on_message(&self, handler: MessageHandler) {
        *self.handler.lock() = Some(handler);
    }

    async fn close(&self) {
        self.set_open(false);
    }
}

// ============================================================================
// PEER CONNECTION
// ============================================================================

struct PeerState {
    signaling: SignalingState,
    ice: IceState,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    offers: usize,
    restarts: usize,
    rollbacks: usize,
    candidates: Vec<IceCandidate>,
    channels: Vec<Arc<SimChannel>>,
    closed: bool,
}

/// JSEP-like peer connection
///
/// Gathers one candidate per local description and reports ICE connected
/// (opening its channels) whenever an offer/answer exchange completes.
/// `create_offer` waits while offers are held.
pub struct SimPeer {
    name: String,
    events: PeerEvents,
    gate: watch::Sender<bool>,
    state: Mutex<PeerState>,
}

impl SimPeer {
    pub fn new(name: &str, events: PeerEvents) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            events,
            gate: watch::channel(true).0,
            state: Mutex::new(PeerState {
                signaling: SignalingState::Stable,
                ice: IceState::New,
                local: None,
                remote: None,
                offers: 0,
                restarts: 0,
                rollbacks: 0,
                candidates: Vec::new(),
                channels: Vec::new(),
                closed: false,
            }),
        })
    }

    pub fn hold_offers(&self) {
        self.gate.send_replace(false);
    }

    pub fn release_offers(&self) {
        self.gate.send_replace(true);
    }

    pub fn signaling(&self) -> SignalingState {
        self.signaling_state()
    }

    pub fn local(&self) -> Option<SessionDescription> {
        self.state.lock().local.clone()
    }

    pub fn remote(&self) -> Option<SessionDescription> {
        self.state.lock().remote.clone()
    }

    pub fn offers_created(&self) -> usize {
        self.state.lock().offers
    }

    pub fn ice_restarts(&self) -> usize {
        self.state.lock().restarts
    }

    pub fn rollbacks(&self) -> usize {
        self.state.lock().rollbacks
    }

    pub fn remote_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().candidates.clone()
    }

    pub fn channels(&self) -> Vec<Arc<SimChannel>> {
        self.state.lock().channels.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Reports an ICE state change as the network would
    pub fn emit_ice(&self, ice: IceState) {
        self.state.lock().ice = ice;
        let _ = self.events.send(PeerEvent::IceStateChanged(ice));
    }

    fn gathered(&self) -> PeerEvent {
        PeerEvent::LocalCandidate(IceCandidate {
            payload: format!("candidate:{} 1 udp 1 127.0.0.1 9 typ host", self.name),
            media_id: "0".to_string(),
            line_index: 0,
        })
    }

    /// Offer/answer exchange done: ICE comes up and channels open
    fn complete(state: &mut PeerState, events: &mut Vec<PeerEvent>) {
        if state.ice.is_connected() {
            return;
        }
        state.ice = IceState::Connected;
        for channel in &state.channels {
            channel.set_open(true);
        }
        events.push(PeerEvent::IceStateChanged(IceState::Checking));
        events.push(PeerEvent::IceStateChanged(IceState::Connected));
    }

    fn emit(&self, events: Vec<PeerEvent>) {
        for event in events {
            let _ = self.events.send(event);
        }
    }
}

fn invalid(side: &str, kind: DescriptionKind, state: SignalingState) -> NegotiationError {
    NegotiationError::InvalidState(format!("cannot apply {} {} in {:?}", side, kind, state))
}

#[async_trait]
impl PeerConnection for SimPeer {
    async fn create_offer(
        &self,
        ice_restart: bool,
    ) -> Result<SessionDescription, NegotiationError> {
        let mut gate = self.gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;

        let mut state = self.state.lock();
        if state.closed {
            return Err(NegotiationError::Closed);
        }
        state.offers += 1;
        if ice_restart {
            state.restarts += 1;
        }
        Ok(SessionDescription::offer(format!(
            "{} offer {}",
            self.name, state.offers
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        let state = self.state.lock();
        if state.closed {
            return Err(NegotiationError::Closed);
        }
        if state.signaling != SignalingState::HaveRemoteOffer {
            return Err(NegotiationError::InvalidState(format!(
                "cannot answer in {:?}",
                state.signaling
            )));
        }
        Ok(SessionDescription::answer(format!("{} answer", self.name)))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        let mut events = Vec::new();
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(NegotiationError::Closed);
            }

            match (description.kind, state.signaling) {
                (DescriptionKind::Offer, SignalingState::Stable | SignalingState::HaveLocalOffer) => {
                    state.signaling = SignalingState::HaveLocalOffer;
                    state.local = Some(description);
                    events.push(self.gathered());
                }
                (DescriptionKind::Answer, SignalingState::HaveRemoteOffer) => {
                    state.signaling = SignalingState::Stable;
                    state.local = Some(description);
                    events.push(self.gathered());
                    Self::complete(&mut state, &mut events);
                }
                (DescriptionKind::Rollback, SignalingState::HaveLocalOffer) => {
                    state.signaling = SignalingState::Stable;
                    state.local = None;
                    state.rollbacks += 1;
                }
                // Nothing to roll back
                (DescriptionKind::Rollback, SignalingState::Stable) => {}
                (kind, signaling) => return Err(invalid("local", kind, signaling)),
            }
        }
        self.emit(events);
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        let mut events = Vec::new();
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(NegotiationError::Closed);
            }

            match (description.kind, state.signaling) {
                (DescriptionKind::Offer, SignalingState::Stable | SignalingState::HaveRemoteOffer) => {
                    state.signaling = SignalingState::HaveRemoteOffer;
                    state.remote = Some(description);
                }
                (DescriptionKind::Answer, SignalingState::HaveLocalOffer) => {
                    state.signaling = SignalingState::Stable;
                    state.remote = Some(description);
                    Self::complete(&mut state, &mut events);
                }
                (DescriptionKind::Rollback, SignalingState::HaveRemoteOffer) => {
                    state.signaling = SignalingState::Stable;
                    state.remote = None;
                }
                (kind, signaling) => return Err(invalid("remote", kind, signaling)),
            }
        }
        self.emit(events);
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.local()
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(NegotiationError::Closed);
        }
        if state.remote.is_none() {
            return Err(NegotiationError::InvalidState(
                "no remote description".to_string(),
            ));
        }
        state.candidates.push(candidate);
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        let state = self.state.lock();
        if state.closed {
            SignalingState::Closed
        } else {
            state.signaling
        }
    }

    async fn create_data_channel(
        &self,
        label: &str,
    ) -> Result<Arc<dyn DataChannel>, NegotiationError> {
        let channel = SimChannel::new(label);
        let first = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(NegotiationError::Closed);
            }
            state.channels.push(Arc::clone(&channel));
            state.channels.len() == 1
        };

        if first {
            let _ = self.events.send(PeerEvent::NegotiationNeeded);
        }
        Ok(channel)
    }

    async fn close(&self) -> Result<(), NegotiationError> {
        let mut state = self.state.lock();
        state.closed = true;
        state.ice = IceState::Closed;
        for channel in &state.channels {
            channel.set_open(false);
        }
        Ok(())
    }
}

/// Hands out `SimPeer`s and keeps them for inspection
pub struct SimFactory {
    peers: Mutex<Vec<Arc<SimPeer>>>,
    hold_offers: bool,
    fail: bool,
}

impl SimFactory {
    pub fn new() -> Self {
        Self {
            peers: Mutex::new(Vec::new()),
            hold_offers: false,
            fail: false,
        }
    }

    /// Peers start with their offers held
    pub fn holding_offers() -> Self {
        Self {
            hold_offers: true,
            ..Self::new()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new()
        }
    }

    pub fn created(&self) -> usize {
        self.peers.lock().len()
    }

    /// Most recently created peer
    pub fn last(&self) -> Arc<SimPeer> {
        self.peers
            .lock()
            .last()
            .cloned()
            .expect("no peer created yet")
    }
}

#[async_trait]
impl PeerConnectionFactory for SimFactory {
    async fn create(
        &self,
        events: PeerEvents,
    ) -> Result<Arc<dyn PeerConnection>, NegotiationError> {
        if self.fail {
            return Err(NegotiationError::WebRTC("peer connection refused".to_string()));
        }

        let mut peers = self.peers.lock();
        let peer = SimPeer::new(&format!("peer{}", peers.len() + 1), events);
        if self.hold_offers {
            peer.hold_offers();
        }
        peers.push(Arc::clone(&peer));
        Ok(peer)
    }
}

// ============================================================================
// SIGNALING
// ============================================================================

/// Transport recording sent envelopes, optionally forwarding them
pub struct SimTransport {
    open: AtomicBool,
    sent: Mutex<Vec<SignalingEnvelope>>,
    relay: Option<(Arc<SimRelay>, usize)>,
}

impl SimTransport {
    fn new(relay: Option<(Arc<SimRelay>, usize)>) -> Arc<Self> {
        Arc::new(Self {
            open: AtomicBool::new(true),
            sent: Mutex::new(Vec::new()),
            relay,
        })
    }

    pub fn sent(&self) -> Vec<SignalingEnvelope> {
        self.sent.lock().clone()
    }

    pub fn descriptions(&self, kind: DescriptionKind) -> usize {
        count_descriptions(&self.sent.lock(), kind)
    }
}

#[async_trait]
impl SignalingTransport for SimTransport {
    fn send(&self, envelope: &SignalingEnvelope) -> Result<(), SignalingError> {
        if !self.is_open() {
            return Err(SignalingError::NotConnected);
        }
        self.sent.lock().push(envelope.clone());
        if let Some((relay, slot)) = &self.relay {
            relay.forward(*slot, envelope);
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

/// Connector whose transports are driven by the test
pub struct RecordingConnector {
    transports: Mutex<Vec<Arc<SimTransport>>>,
    inboxes: Mutex<Vec<mpsc::UnboundedSender<TransportEvent>>>,
    failures_left: AtomicUsize,
}

impl RecordingConnector {
    pub fn new() -> Self {
        Self::failing(0)
    }

    /// Refuses the first `failures` connection attempts
    pub fn failing(failures: usize) -> Self {
        Self {
            transports: Mutex::new(Vec::new()),
            inboxes: Mutex::new(Vec::new()),
            failures_left: AtomicUsize::new(failures),
        }
    }

    pub fn connections(&self) -> usize {
        self.transports.lock().len()
    }

    pub fn last_transport(&self) -> Arc<SimTransport> {
        self.transports
            .lock()
            .last()
            .cloned()
            .expect("no transport opened yet")
    }

    /// Delivers an event on the most recent transport
    pub fn inject(&self, event: TransportEvent) {
        if let Some(inbox) = self.inboxes.lock().last() {
            let _ = inbox.send(event);
        }
    }
}

#[async_trait]
impl TransportConnector for RecordingConnector {
    async fn connect(
        &self,
    ) -> Result<(Arc<dyn SignalingTransport>, TransportEvents), SignalingError> {
        let refused = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(SignalingError::ConnectionFailed(
                "connection refused".to_string(),
            ));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let transport = SimTransport::new(None);
        self.transports.lock().push(Arc::clone(&transport));
        self.inboxes.lock().push(tx);
        Ok((transport, rx))
    }
}

/// Broadcast relay between connected sessions, logging every envelope
pub struct SimRelay {
    inboxes: Mutex<Vec<mpsc::UnboundedSender<TransportEvent>>>,
    log: Mutex<Vec<SignalingEnvelope>>,
}

impl SimRelay {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inboxes: Mutex::new(Vec::new()),
            log: Mutex::new(Vec::new()),
        })
    }

    pub fn connector(self: &Arc<Self>) -> RelayConnector {
        RelayConnector {
            relay: Arc::clone(self),
        }
    }

    pub fn descriptions(&self, kind: DescriptionKind) -> usize {
        count_descriptions(&self.log.lock(), kind)
    }

    fn forward(&self, from: usize, envelope: &SignalingEnvelope) {
        self.log.lock().push(envelope.clone());
        for (slot, inbox) in self.inboxes.lock().iter().enumerate() {
            if slot != from {
                let _ = inbox.send(TransportEvent::Envelope(envelope.clone()));
            }
        }
    }
}

pub struct RelayConnector {
    relay: Arc<SimRelay>,
}

#[async_trait]
impl TransportConnector for RelayConnector {
    async fn connect(
        &self,
    ) -> Result<(Arc<dyn SignalingTransport>, TransportEvents), SignalingError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let slot = {
            let mut inboxes = self.relay.inboxes.lock();
            inboxes.push(tx);
            inboxes.len() - 1
        };
        let transport = SimTransport::new(Some((Arc::clone(&self.relay), slot)));
        Ok((transport, rx))
    }
}
