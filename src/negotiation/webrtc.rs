//! webrtc-rs backend for the peer-connection primitive

use super::engine::NegotiationError;
use super::peer::{
    IceState, PeerConnection, PeerConnectionFactory, PeerEvent, PeerEvents, SignalingState,
};
use crate::channel::{ChannelError, DataChannel, MessageHandler};
use crate::signaling::{DescriptionKind, IceCandidate, SessionDescription};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;

fn webrtc_error(e: webrtc::Error) -> NegotiationError {
    NegotiationError::WebRTC(e.to_string())
}

// ============================================================================
// FACTORY
// ============================================================================

/// Builds webrtc-rs peer connections for the configured ICE servers
pub struct WebRtcFactory {
    ice_servers: Vec<RTCIceServer>,
}

impl WebRtcFactory {
    pub fn new(urls: Vec<String>) -> Self {
        let ice_servers = if urls.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls,
                ..Default::default()
            }]
        };
        Self { ice_servers }
    }
}

#[async_trait]
impl PeerConnectionFactory for WebRtcFactory {
    async fn create(
        &self,
        events: PeerEvents,
    ) -> Result<Arc<dyn PeerConnection>, NegotiationError> {
        let generation = Arc::new(AtomicU64::new(0));
        let pc = new_peer_connection(&self.ice_servers).await?;
        register_handlers(&pc, EventSink::new(events.clone(), &generation));

        Ok(Arc::new(WebRtcPeer {
            pc: RwLock::new(pc),
            ice_servers: self.ice_servers.clone(),
            events,
            generation,
            channels: Mutex::new(Vec::new()),
            operations: tokio::sync::Mutex::new(()),
        }))
    }
}

async fn new_peer_connection(
    ice_servers: &[RTCIceServer],
) -> Result<Arc<RTCPeerConnection>, NegotiationError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(webrtc_error)?;

    // Interceptors for RTCP, NACK etc.
    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine).map_err(webrtc_error)?;

    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();

    let config = RTCConfiguration {
        ice_servers: ice_servers.to_vec(),
        ..Default::default()
    };

    let pc = api.new_peer_connection(config).await.map_err(webrtc_error)?;
    Ok(Arc::new(pc))
}

/// Forwards events of one connection generation; stale ones are dropped
#[derive(Clone)]
struct EventSink {
    events: PeerEvents,
    generation: Arc<AtomicU64>,
    current: u64,
}

impl EventSink {
    fn new(events: PeerEvents, generation: &Arc<AtomicU64>) -> Self {
        Self {
            events,
            generation: Arc::clone(generation),
            current: generation.load(Ordering::SeqCst),
        }
    }

    fn send(&self, event: PeerEvent) {
        if self.generation.load(Ordering::SeqCst) == self.current {
            let _ = self.events.send(event);
        }
    }
}

/// Turns connection callbacks into peer events
fn register_handlers(pc: &RTCPeerConnection, sink: EventSink) {
    let tx = sink.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        // None marks the end of gathering
        if let Some(candidate) = candidate {
            match candidate.to_json() {
                Ok(init) => tx.send(PeerEvent::LocalCandidate(from_candidate_init(init))),
                Err(e) => tracing::warn!("Failed to serialize ICE candidate: {}", e),
            }
        }
        Box::pin(async {})
    }));

    let tx = sink.clone();
    pc.on_negotiation_needed(Box::new(move || {
        tx.send(PeerEvent::NegotiationNeeded);
        Box::pin(async {})
    }));

    let tx = sink.clone();
    pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
        tx.send(PeerEvent::IceStateChanged(ice_state(state)));
        Box::pin(async {})
    }));

    let tx = sink.clone();
    pc.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
        tx.send(PeerEvent::DataChannel(Arc::new(WebRtcChannel::new(channel))));
        Box::pin(async {})
    }));

    let tx = sink;
    pc.on_track(Box::new(move |track, _, _| {
        tx.send(PeerEvent::Track {
            kind: track.kind().to_string(),
        });
        Box::pin(async {})
    }));
}

async fn open_channel(
    pc: &RTCPeerConnection,
    label: &str,
) -> Result<Arc<RTCDataChannel>, NegotiationError> {
    let init = RTCDataChannelInit {
        ordered: Some(true),
        ..Default::default()
    };
    pc.create_data_channel(label, Some(init))
        .await
        .map_err(webrtc_error)
}

// ============================================================================
// PEER CONNECTION
// ============================================================================

/// webrtc-rs peer connection with local rollback
///
/// webrtc-rs has no rollback out of `have-local-offer`. Rolling back an
/// initial offer replaces the connection with a fresh one and re-creates
/// the local data channels on it, keeping the handed-out channel handles.
/// Description operations are serialized in call order, so a rollback
/// finishes before a remote offer issued right after it is applied.
pub struct WebRtcPeer {
    pc: RwLock<Arc<RTCPeerConnection>>,
    ice_servers: Vec<RTCIceServer>,
    events: PeerEvents,
    generation: Arc<AtomicU64>,
    channels: Mutex<Vec<Arc<WebRtcChannel>>>,
    operations: tokio::sync::Mutex<()>,
}

impl WebRtcPeer {
    fn pc(&self) -> Arc<RTCPeerConnection> {
        Arc::clone(&self.pc.read())
    }

    async fn rollback(&self) -> Result<(), NegotiationError> {
        let pc = self.pc();
        let has_remote = pc.remote_description().await.is_some();
        match pc.signaling_state() {
            RTCSignalingState::Stable => Ok(()),
            RTCSignalingState::HaveLocalOffer if !has_remote => self.replace_connection().await,
            state => Err(NegotiationError::InvalidState(format!(
                "cannot roll back local description in {}",
                state
            ))),
        }
    }

    async fn replace_connection(&self) -> Result<(), NegotiationError> {
        let pc = new_peer_connection(&self.ice_servers).await?;

        self.generation.fetch_add(1, Ordering::SeqCst);
        register_handlers(&pc, EventSink::new(self.events.clone(), &self.generation));

        let channels = self.channels.lock().clone();
        for channel in channels {
            let inner = open_channel(&pc, &channel.label()).await?;
            channel.replace(inner);
        }

        let old = std::mem::replace(&mut *self.pc.write(), pc);
        if let Err(e) = old.close().await {
            tracing::debug!("Closing rolled back connection: {}", e);
        }
        tracing::debug!("Local offer rolled back on a fresh connection");
        Ok(())
    }
}

#[async_trait]
impl PeerConnection for WebRtcPeer {
    async fn create_offer(
        &self,
        ice_restart: bool,
    ) -> Result<SessionDescription, NegotiationError> {
        let _guard = self.operations.lock().await;
        let options = RTCOfferOptions {
            voice_activity_detection: false,
            ice_restart,
        };
        let offer = self
            .pc()
            .create_offer(Some(options))
            .await
            .map_err(webrtc_error)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        let _guard = self.operations.lock().await;
        let answer = self.pc().create_answer(None).await.map_err(webrtc_error)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        let _guard = self.operations.lock().await;
        if description.kind == DescriptionKind::Rollback {
            return self.rollback().await;
        }
        let description = to_rtc_description(description)?;
        self.pc()
            .set_local_description(description)
            .await
            .map_err(webrtc_error)
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        let _guard = self.operations.lock().await;
        let description = to_rtc_description(description)?;
        self.pc()
            .set_remote_description(description)
            .await
            .map_err(webrtc_error)
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        let description = self.pc().local_description().await?;
        match description.sdp_type {
            RTCSdpType::Offer => Some(SessionDescription::offer(description.sdp)),
            RTCSdpType::Answer => Some(SessionDescription::answer(description.sdp)),
            _ => None,
        }
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        let _guard = self.operations.lock().await;
        let init = RTCIceCandidateInit {
            candidate: candidate.payload,
            sdp_mid: Some(candidate.media_id),
            sdp_mline_index: Some(candidate.line_index),
            username_fragment: None,
        };
        self.pc().add_ice_candidate(init).await.map_err(webrtc_error)
    }

    fn signaling_state(&self) -> SignalingState {
        match self.pc().signaling_state() {
            RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
            RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
            RTCSignalingState::HaveLocalPranswer => SignalingState::HaveLocalPranswer,
            RTCSignalingState::HaveRemotePranswer => SignalingState::HaveRemotePranswer,
            RTCSignalingState::Closed => SignalingState::Closed,
            _ => SignalingState::Stable,
        }
    }

    async fn create_data_channel(
        &self,
        label: &str,
    ) -> Result<Arc<dyn DataChannel>, NegotiationError> {
        let inner = open_channel(&self.pc(), label).await?;
        let channel = Arc::new(WebRtcChannel::new(inner));
        self.channels.lock().push(Arc::clone(&channel));
        Ok(channel)
    }

    async fn close(&self) -> Result<(), NegotiationError> {
        self.pc().close().await.map_err(webrtc_error)
    }
}

// ============================================================================
// DATA CHANNEL
// ============================================================================

type SharedHandler = Arc<dyn Fn(String) + Send + Sync>;

pub struct WebRtcChannel {
    inner: RwLock<Arc<RTCDataChannel>>,
    handler: Mutex<Option<SharedHandler>>,
}

impl WebRtcChannel {
    fn new(inner: Arc<RTCDataChannel>) -> Self {
        Self {
            inner: RwLock::new(inner),
            handler: Mutex::new(None),
        }
    }

    fn inner(&self) -> Arc<RTCDataChannel> {
        Arc::clone(&self.inner.read())
    }

    /// Moves this handle onto a channel of a replacement connection
    fn replace(&self, inner: Arc<RTCDataChannel>) {
        if let Some(handler) = self.handler.lock().clone() {
            install_handler(&inner, handler);
        }
        *self.inner.write() = inner;
    }
}

fn install_handler(channel: &RTCDataChannel, handler: SharedHandler) {
    channel.on_message(Box::new(move |message: DataChannelMessage| {
        if !message.is_string {
            tracing::debug!("Ignoring binary data channel message");
        } else {
            match String::from_utf8(message.data.to_vec()) {
                Ok(text) => handler(text),
                Err(e) => tracing::warn!("Dropping non UTF-8 message: {}", e),
            }
        }
        Box::pin(async {})
    }));
}

#[async_trait]
impl DataChannel for WebRtcChannel {
    fn label(&self) -> String {
        self.inner().label().to_string()
    }

    fn is_open(&self) -> bool {
        self.inner().ready_state() == RTCDataChannelState::Open
    }

    async fn send_text(&self, text: String) -> Result<(), ChannelError> {
        self.inner()
            .send_text(text)
            .await
            .map(|_| ())
            .map_err(|e| ChannelError::SendFailed(e.to_string()))
    }

    fn on_message(&self, handler: MessageHandler) {
        let handler: SharedHandler = Arc::from(handler);
        *self.handler.lock() = Some(Arc::clone(&handler));
        install_handler(&self.inner(), handler);
    }

    async fn close(&self) {
        if let Err(e) = self.inner().close().await {
            tracing::debug!("Data channel close: {}", e);
        }
    }
}

// ============================================================================
// CONVERSIONS
// ============================================================================

/// Offer or answer for webrtc-rs; rollback never reaches the connection
fn to_rtc_description(
    description: SessionDescription,
) -> Result<RTCSessionDescription, NegotiationError> {
    match description.kind {
        DescriptionKind::Offer => RTCSessionDescription::offer(description.payload)
            .map_err(|e| NegotiationError::InvalidSdp(e.to_string())),
        DescriptionKind::Answer => RTCSessionDescription::answer(description.payload)
            .map_err(|e| NegotiationError::InvalidSdp(e.to_string())),
        DescriptionKind::Rollback => Err(NegotiationError::InvalidState(
            "remote rollback is not supported".to_string(),
        )),
    }
}

fn from_candidate_init(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        payload: init.candidate,
        media_id: init.sdp_mid.unwrap_or_default(),
        line_index: init.sdp_mline_index.unwrap_or_default(),
    }
}

fn ice_state(state: RTCIceConnectionState) -> IceState {
    match state {
        RTCIceConnectionState::Checking => IceState::Checking,
        RTCIceConnectionState::Connected => IceState::Connected,
        RTCIceConnectionState::Completed => IceState::Completed,
        RTCIceConnectionState::Failed => IceState::Failed,
        RTCIceConnectionState::Disconnected => IceState::Disconnected,
        RTCIceConnectionState::Closed => IceState::Closed,
        _ => IceState::New,
    }
}
