//! WebRTC transport backed by webrtc-rs.
//!
//! This module contains:
//! - Peer connection setup and event forwarding
//! - The pre-negotiated transfer data channel with send-side flow control

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use ferry_common::Chunk;
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;

use crate::transport::{
    ChannelState, ConnectionState, DataChannel, DataChannelConfig, PeerConnection, PeerEvent,
    PeerTransport, SdpType, SessionDescription, TransportError,
};

/// Google STUN server for NAT traversal
pub const STUN_SERVER: &str = "stun:stun.l.google.com:19302";

const EVENT_CAPACITY: usize = 64;
const INBOX_CAPACITY: usize = 64;
/// Sends wait while more than this is queued in the SCTP buffer.
const BUFFERED_HIGH_WATER: usize = 1024 * 1024;
const BUFFERED_LOW_WATER: usize = 256 * 1024;
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);
const DRAIN_POLL: Duration = Duration::from_millis(10);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn backend(err: webrtc::Error) -> TransportError {
    TransportError::Backend(err.to_string())
}

#[derive(Debug, Clone)]
pub struct WebRtcTransport {
    ice_servers: Vec<String>,
}

impl WebRtcTransport {
    pub fn new(ice_servers: Vec<String>) -> Self {
        Self { ice_servers }
    }

    /// Public STUN server for NAT traversal.
    pub fn with_stun() -> Self {
        Self::new(vec![STUN_SERVER.to_string()])
    }

    /// Host candidates only.
    pub fn offline() -> Self {
        Self::new(Vec::new())
    }
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    fn name(&self) -> &'static str {
        "webrtc"
    }

    async fn connect(&self) -> Result<Arc<dyn PeerConnection>, TransportError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(backend)?;
        let registry =
            register_default_interceptors(Registry::new(), &mut media_engine).map_err(backend)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: if self.ice_servers.is_empty() {
                Vec::new()
            } else {
                vec![RTCIceServer {
                    urls: self.ice_servers.clone(),
                    ..Default::default()
                }]
            },
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(config).await.map_err(backend)?);
        Ok(Arc::new(WebRtcConnection::new(pc)))
    }
}

fn map_connection_state(state: RTCPeerConnectionState) -> ConnectionState {
    match state {
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
        RTCPeerConnectionState::New | RTCPeerConnectionState::Unspecified => ConnectionState::New,
    }
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, TransportError> {
    let parsed = match desc.kind {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
    };
    parsed.map_err(|e| TransportError::InvalidDescription(e.to_string()))
}

fn from_rtc(desc: RTCSessionDescription) -> Result<SessionDescription, TransportError> {
    let kind = match desc.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Answer => SdpType::Answer,
        other => {
            return Err(TransportError::InvalidDescription(format!(
                "unsupported description type {other}"
            )))
        }
    };
    Ok(SessionDescription {
        kind,
        sdp: desc.sdp,
    })
}

pub struct WebRtcConnection {
    pc: Arc<RTCPeerConnection>,
    events_rx: Mutex<Option<mpsc::Receiver<PeerEvent>>>,
}

impl WebRtcConnection {
    fn new(pc: Arc<RTCPeerConnection>) -> Self {
        let (tx, rx) = mpsc::channel(EVENT_CAPACITY);

        let ice_tx = tx.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let ice_tx = ice_tx.clone();
            Box::pin(async move {
                let event = match candidate {
                    Some(candidate) => match candidate.to_json() {
                        Ok(init) => PeerEvent::IceCandidate(init.candidate),
                        Err(e) => {
                            warn!("Failed to serialize ICE candidate: {}", e);
                            return;
                        }
                    },
                    None => PeerEvent::GatheringComplete,
                };
                let _ = ice_tx.send(event).await;
            })
        }));

        // Completion is signalled once, by the end-of-candidates callback
        // above; the gatherer state is diagnostic only.
        let gathering_tx = tx.clone();
        pc.on_ice_gathering_state_change(Box::new(move |state: RTCIceGathererState| {
            let _ = gathering_tx.try_send(PeerEvent::GatheringState(state.to_string()));
            Box::pin(async {})
        }));

        let signaling_tx = tx.clone();
        pc.on_signaling_state_change(Box::new(move |state: RTCSignalingState| {
            let _ = signaling_tx.try_send(PeerEvent::SignalingState(state.to_string()));
            Box::pin(async {})
        }));

        let ice_state_tx = tx.clone();
        pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            let _ = ice_state_tx.try_send(PeerEvent::IceConnectionState(state.to_string()));
            Box::pin(async {})
        }));

        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            if state == RTCPeerConnectionState::Failed {
                warn!("WebRTC connection failed");
            }
            let _ = tx.try_send(PeerEvent::ConnectionState(map_connection_state(state)));
            Box::pin(async {})
        }));

        Self {
            pc,
            events_rx: Mutex::new(Some(rx)),
        }
    }
}

#[async_trait]
impl PeerConnection for WebRtcConnection {
    async fn create_data_channel(
        &self,
        config: &DataChannelConfig,
    ) -> Result<Arc<dyn DataChannel>, TransportError> {
        let init = RTCDataChannelInit {
            ordered: Some(config.ordered),
            protocol: Some(config.protocol.clone()),
            negotiated: config.negotiated.then_some(config.id),
            ..Default::default()
        };
        let dc = self
            .pc
            .create_data_channel(&config.label, Some(init))
            .await
            .map_err(backend)?;
        debug!("Created data channel {}#{}", config.label, config.id);
        Ok(WebRtcChannel::attach(dc, config).await)
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        from_rtc(self.pc.create_offer(None).await.map_err(backend)?)
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| TransportError::InvalidState(e.to_string()))?;
        from_rtc(answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        self.pc
            .set_local_description(to_rtc(desc)?)
            .await
            .map_err(backend)
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        self.pc
            .set_remote_description(to_rtc(desc)?)
            .await
            .map_err(|e| TransportError::InvalidDescription(e.to_string()))
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        let desc = self.pc.local_description().await?;
        from_rtc(desc).ok()
    }

    fn take_events(&self) -> Option<mpsc::Receiver<PeerEvent>> {
        lock(&self.events_rx).take()
    }

    fn connection_state(&self) -> ConnectionState {
        map_connection_state(self.pc.connection_state())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.pc.close().await.map_err(backend)
    }
}

pub struct WebRtcChannel {
    dc: Arc<RTCDataChannel>,
    label: String,
    id: u16,
    state: watch::Receiver<ChannelState>,
    inbox: tokio::sync::Mutex<mpsc::Receiver<Bytes>>,
    buffered_low: Arc<Notify>,
}

impl WebRtcChannel {
    async fn attach(dc: Arc<RTCDataChannel>, config: &DataChannelConfig) -> Arc<Self> {
        let (state_tx, state_rx) = watch::channel(ChannelState::Connecting);
        let state_tx = Arc::new(state_tx);
        let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_CAPACITY);
        let inbox_tx = Arc::new(Mutex::new(Some(inbox_tx)));
        let buffered_low = Arc::new(Notify::new());

        let open_state = state_tx.clone();
        let label = config.label.clone();
        dc.on_open(Box::new(move || {
            debug!("Data channel '{}' opened", label);
            open_state.send_replace(ChannelState::Open);
            Box::pin(async {})
        }));

        let message_inbox = inbox_tx.clone();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let tx = lock(&message_inbox).clone();
            Box::pin(async move {
                if let Some(tx) = tx {
                    if tx.send(msg.data).await.is_err() {
                        debug!("Data channel message dropped; receiver gone");
                    }
                }
            })
        }));

        let label = config.label.clone();
        dc.on_error(Box::new(move |err| {
            warn!("Data channel '{}' error: {}", label, err);
            Box::pin(async {})
        }));

        let close_state = state_tx.clone();
        let close_inbox = inbox_tx;
        let label = config.label.clone();
        dc.on_close(Box::new(move || {
            debug!("Data channel '{}' closed", label);
            close_state.send_replace(ChannelState::Closed);
            lock(&close_inbox).take();
            Box::pin(async {})
        }));

        dc.set_buffered_amount_low_threshold(BUFFERED_LOW_WATER)
            .await;
        let notify = buffered_low.clone();
        dc.on_buffered_amount_low(Box::new(move || {
            notify.notify_waiters();
            Box::pin(async {})
        }))
        .await;

        Arc::new(Self {
            dc,
            label: config.label.clone(),
            id: config.id,
            state: state_rx,
            inbox: tokio::sync::Mutex::new(inbox_rx),
            buffered_low,
        })
    }
}

#[async_trait]
impl DataChannel for WebRtcChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn id(&self) -> u16 {
        self.id
    }

    fn state(&self) -> ChannelState {
        match self.dc.ready_state() {
            RTCDataChannelState::Open => ChannelState::Open,
            RTCDataChannelState::Closing => ChannelState::Closing,
            RTCDataChannelState::Closed => ChannelState::Closed,
            RTCDataChannelState::Connecting | RTCDataChannelState::Unspecified => {
                ChannelState::Connecting
            }
        }
    }

    async fn wait_open(&self) -> Result<(), TransportError> {
        let mut rx = self.state.clone();
        loop {
            match *rx.borrow_and_update() {
                ChannelState::Open => return Ok(()),
                ChannelState::Closing | ChannelState::Closed => {
                    return Err(TransportError::ChannelClosed)
                }
                ChannelState::Connecting => {}
            }
            if rx.changed().await.is_err() {
                return Err(TransportError::ChannelClosed);
            }
        }
    }

    async fn send(&self, chunk: Chunk) -> Result<(), TransportError> {
        loop {
            let low = self.buffered_low.notified();
            if self.dc.buffered_amount().await <= BUFFERED_HIGH_WATER {
                break;
            }
            low.await;
        }
        if self.state() != ChannelState::Open {
            return Err(TransportError::ChannelClosed);
        }
        self.dc
            .send(chunk.as_bytes())
            .await
            .map(|_| ())
            .map_err(|_| TransportError::ChannelClosed)
    }

    async fn recv(&self) -> Option<Bytes> {
        self.inbox.lock().await.recv().await
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.state() == ChannelState::Closed {
            return Ok(());
        }
        // Let queued messages leave before the close reaches the peer.
        let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
            while self.dc.buffered_amount().await > 0 {
                tokio::time::sleep(DRAIN_POLL).await;
            }
        })
        .await;
        if drained.is_err() {
            warn!(
                "Data channel '{}' closing with {} bytes unsent",
                self.label,
                self.dc.buffered_amount().await
            );
        }
        self.dc.close().await.map_err(backend)
    }
}
