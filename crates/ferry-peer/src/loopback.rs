//! In-memory transport.
//!
//! Connections created by the same [`LoopbackTransport`] find each other
//! through the `a=ice-ufrag` of their descriptions: once both sides hold a
//! local description and a remote description naming the other, they link
//! and their pre-negotiated channels open. Channel queues are bounded, so a
//! slow receiver holds back the sender.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use ferry_common::Chunk;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::transport::{
    ChannelState, ConnectionState, DataChannel, DataChannelConfig, PeerConnection, PeerEvent,
    PeerTransport, SdpType, SessionDescription, TransportError,
};

const EVENT_CAPACITY: usize = 64;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone)]
pub struct LoopbackOptions {
    /// Host candidates emitted per connection.
    pub candidates: usize,
    /// Append `a=end-of-candidates` to local descriptions once gathering
    /// completes.
    pub native_end_of_candidates: bool,
    /// Fail every `set_remote_description`.
    pub reject_remote_descriptions: bool,
    /// Messages buffered per channel direction.
    pub channel_capacity: usize,
}

impl Default for LoopbackOptions {
    fn default() -> Self {
        Self {
            candidates: 2,
            native_end_of_candidates: false,
            reject_remote_descriptions: false,
            channel_capacity: 64,
        }
    }
}

type Registry = Arc<Mutex<HashMap<String, Weak<LoopbackConnection>>>>;

#[derive(Clone, Default)]
pub struct LoopbackTransport {
    registry: Registry,
    options: LoopbackOptions,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: LoopbackOptions) -> Self {
        Self {
            registry: Registry::default(),
            options,
        }
    }

    pub fn options(&self) -> &LoopbackOptions {
        &self.options
    }
}

#[async_trait]
impl PeerTransport for LoopbackTransport {
    fn name(&self) -> &'static str {
        "loopback"
    }

    async fn connect(&self) -> Result<Arc<dyn PeerConnection>, TransportError> {
        let conn = Arc::new(LoopbackConnection::new(
            self.registry.clone(),
            self.options.clone(),
        ));
        let mut registry = lock(&self.registry);
        registry.retain(|_, weak| weak.strong_count() > 0);
        registry.insert(conn.ufrag.clone(), Arc::downgrade(&conn));
        debug!("Loopback connection {} created", conn.ufrag);
        Ok(conn)
    }
}

fn parse_ufrag(sdp: &str) -> Option<&str> {
    sdp.lines()
        .find_map(|line| line.trim_end().strip_prefix("a=ice-ufrag:"))
}

fn build_sdp(ufrag: &str, pwd: &str, kind: SdpType) -> String {
    let (session, _) = Uuid::new_v4().as_u64_pair();
    let setup = match kind {
        SdpType::Offer => "actpass",
        SdpType::Answer => "active",
    };
    format!(
        "v=0\r\n\
         o=- {} 2 IN IP4 127.0.0.1\r\n\
         s=-\r\n\
         t=0 0\r\n\
         a=group:BUNDLE 0\r\n\
         m=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n\
         c=IN IP4 0.0.0.0\r\n\
         a=ice-ufrag:{}\r\n\
         a=ice-pwd:{}\r\n\
         a=setup:{}\r\n\
         a=mid:0\r\n\
         a=sctp-port:5000\r\n",
        session >> 1,
        ufrag,
        pwd,
        setup
    )
}

struct ConnInner {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    remote_ufrag: Option<String>,
    candidates: Vec<String>,
    gathered: bool,
    channel: Option<Arc<LoopbackChannel>>,
    peer: Option<Weak<LoopbackConnection>>,
    state: ConnectionState,
}

pub struct LoopbackConnection {
    ufrag: String,
    pwd: String,
    registry: Registry,
    options: LoopbackOptions,
    inner: Mutex<ConnInner>,
    events_tx: mpsc::Sender<PeerEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<PeerEvent>>>,
}

impl LoopbackConnection {
    fn new(registry: Registry, options: LoopbackOptions) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CAPACITY);
        Self {
            ufrag: Uuid::new_v4().simple().to_string(),
            pwd: Uuid::new_v4().simple().to_string(),
            registry,
            options,
            inner: Mutex::new(ConnInner {
                local: None,
                remote: None,
                remote_ufrag: None,
                candidates: Vec::new(),
                gathered: false,
                channel: None,
                peer: None,
                state: ConnectionState::New,
            }),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    pub fn ufrag(&self) -> &str {
        &self.ufrag
    }

    fn emit(&self, event: PeerEvent) {
        if self.events_tx.try_send(event).is_err() {
            debug!("Loopback {} event dropped; nobody is listening", self.ufrag);
        }
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if lock(&self.inner).state == ConnectionState::Closed {
            return Err(TransportError::ConnectionClosed);
        }
        Ok(())
    }

    fn gather(&self) {
        self.emit(PeerEvent::GatheringState("gathering".into()));
        let count = self.options.candidates;
        let candidates: Vec<String> = (0..count)
            .map(|i| {
                format!(
                    "candidate:{} 1 udp {} 127.0.0.1 {} typ host",
                    i + 1,
                    2_130_706_431u32.saturating_sub(i as u32),
                    50_000 + i
                )
            })
            .collect();
        {
            let mut inner = lock(&self.inner);
            inner.candidates = candidates.clone();
            inner.gathered = true;
        }
        for candidate in candidates {
            self.emit(PeerEvent::IceCandidate(candidate));
        }
        self.emit(PeerEvent::GatheringState("complete".into()));
        self.emit(PeerEvent::GatheringComplete);
    }

    /// Link with the connection named by our remote description, if it
    /// names us back.
    fn try_link(&self) {
        let registry = lock(&self.registry);

        let remote_ufrag = {
            let inner = lock(&self.inner);
            if inner.local.is_none() || inner.remote.is_none() || inner.peer.is_some() {
                return;
            }
            match &inner.remote_ufrag {
                Some(ufrag) => ufrag.clone(),
                None => return,
            }
        };
        let Some(peer) = registry.get(&remote_ufrag).and_then(Weak::upgrade) else {
            return;
        };
        let Some(me) = registry.get(&self.ufrag).and_then(Weak::upgrade) else {
            return;
        };
        {
            let p = lock(&peer.inner);
            let names_us = p.remote_ufrag.as_deref() == Some(self.ufrag.as_str());
            if p.local.is_none() || !names_us || p.peer.is_some() {
                return;
            }
        }

        let mine = {
            let mut inner = lock(&self.inner);
            inner.peer = Some(Arc::downgrade(&peer));
            inner.state = ConnectionState::Connected;
            inner.channel.clone()
        };
        let theirs = {
            let mut p = lock(&peer.inner);
            p.peer = Some(Arc::downgrade(&me));
            p.state = ConnectionState::Connected;
            p.channel.clone()
        };
        if let (Some(a), Some(b)) = (mine, theirs) {
            LoopbackChannel::pair(&a, &b);
        }
        drop(registry);

        debug!("Loopback {} linked with {}", self.ufrag, peer.ufrag);
        for conn in [&*me, &*peer] {
            conn.emit(PeerEvent::IceConnectionState("connected".into()));
            conn.emit(PeerEvent::ConnectionState(ConnectionState::Connected));
        }
    }

    fn on_peer_closed(&self) {
        {
            let mut inner = lock(&self.inner);
            if inner.state == ConnectionState::Closed {
                return;
            }
            inner.state = ConnectionState::Disconnected;
        }
        self.emit(PeerEvent::ConnectionState(ConnectionState::Disconnected));
    }
}

#[async_trait]
impl PeerConnection for LoopbackConnection {
    async fn create_data_channel(
        &self,
        config: &DataChannelConfig,
    ) -> Result<Arc<dyn DataChannel>, TransportError> {
        self.ensure_open()?;
        if !config.negotiated {
            return Err(TransportError::Backend(
                "loopback only supports pre-negotiated channels".into(),
            ));
        }

        let registry = lock(&self.registry);
        let channel = LoopbackChannel::new(config, self.options.channel_capacity);
        let peer = {
            let mut inner = lock(&self.inner);
            if inner.channel.is_some() {
                return Err(TransportError::InvalidState(
                    "data channel already created".into(),
                ));
            }
            inner.channel = Some(channel.clone());
            inner.peer.as_ref().and_then(Weak::upgrade)
        };
        if let Some(peer) = peer {
            let theirs = lock(&peer.inner).channel.clone();
            if let Some(theirs) = theirs {
                LoopbackChannel::pair(&channel, &theirs);
            }
        }
        drop(registry);

        Ok(channel)
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        self.ensure_open()?;
        Ok(SessionDescription::offer(build_sdp(
            &self.ufrag,
            &self.pwd,
            SdpType::Offer,
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        self.ensure_open()?;
        let has_offer = lock(&self.inner)
            .remote
            .as_ref()
            .is_some_and(|d| d.kind == SdpType::Offer);
        if !has_offer {
            return Err(TransportError::InvalidState(
                "cannot answer without a remote offer".into(),
            ));
        }
        Ok(SessionDescription::answer(build_sdp(
            &self.ufrag,
            &self.pwd,
            SdpType::Answer,
        )))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        self.ensure_open()?;
        if parse_ufrag(&desc.sdp) != Some(self.ufrag.as_str()) {
            return Err(TransportError::InvalidDescription(
                "local description was not created by this connection".into(),
            ));
        }
        let kind = desc.kind;
        lock(&self.inner).local = Some(desc);

        self.emit(PeerEvent::SignalingState(
            match kind {
                SdpType::Offer => "have-local-offer",
                SdpType::Answer => "stable",
            }
            .into(),
        ));
        self.gather();
        self.try_link();
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        if self.options.reject_remote_descriptions {
            return Err(TransportError::InvalidDescription(
                "rejected by loopback configuration".into(),
            ));
        }
        if !desc.sdp.starts_with("v=0") {
            return Err(TransportError::InvalidDescription(
                "missing version line".into(),
            ));
        }
        let Some(ufrag) = parse_ufrag(&desc.sdp) else {
            return Err(TransportError::InvalidDescription(
                "missing a=ice-ufrag".into(),
            ));
        };
        if ufrag == self.ufrag {
            return Err(TransportError::InvalidDescription(
                "remote description is our own".into(),
            ));
        }
        let ufrag = ufrag.to_string();
        let kind = desc.kind;
        {
            let mut inner = lock(&self.inner);
            if inner.local.as_ref().is_some_and(|l| l.kind == kind) {
                return Err(TransportError::InvalidState(format!(
                    "remote {kind} conflicts with local {kind}"
                )));
            }
            inner.remote = Some(desc);
            inner.remote_ufrag = Some(ufrag);
            if inner.state == ConnectionState::New {
                inner.state = ConnectionState::Connecting;
            }
        }

        self.emit(PeerEvent::SignalingState(
            match kind {
                SdpType::Offer => "have-remote-offer",
                SdpType::Answer => "stable",
            }
            .into(),
        ));
        self.try_link();
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        let inner = lock(&self.inner);
        let local = inner.local.as_ref()?;
        let mut sdp = local.sdp.clone();
        for candidate in &inner.candidates {
            sdp.push_str("a=");
            sdp.push_str(candidate);
            sdp.push_str("\r\n");
        }
        if inner.gathered && self.options.native_end_of_candidates {
            sdp.push_str("a=end-of-candidates\r\n");
        }
        Some(SessionDescription {
            kind: local.kind,
            sdp,
        })
    }

    fn take_events(&self) -> Option<mpsc::Receiver<PeerEvent>> {
        lock(&self.events_rx).take()
    }

    fn connection_state(&self) -> ConnectionState {
        lock(&self.inner).state
    }

    async fn close(&self) -> Result<(), TransportError> {
        let (channel, peer) = {
            let mut inner = lock(&self.inner);
            if inner.state == ConnectionState::Closed {
                return Ok(());
            }
            inner.state = ConnectionState::Closed;
            (
                inner.channel.clone(),
                inner.peer.as_ref().and_then(Weak::upgrade),
            )
        };
        if let Some(channel) = channel {
            channel.close().await?;
        }
        lock(&self.registry).remove(&self.ufrag);
        self.emit(PeerEvent::ConnectionState(ConnectionState::Closed));
        if let Some(peer) = peer {
            peer.on_peer_closed();
        }
        debug!("Loopback connection {} closed", self.ufrag);
        Ok(())
    }
}

pub struct LoopbackChannel {
    label: String,
    id: u16,
    state: watch::Sender<ChannelState>,
    /// Sender half of our inbox, handed to the peer on pairing.
    inbox_tx: Mutex<Option<mpsc::Sender<Bytes>>>,
    inbox_rx: tokio::sync::Mutex<mpsc::Receiver<Bytes>>,
    /// Sender into the peer's inbox.
    outbox: Mutex<Option<mpsc::Sender<Bytes>>>,
    peer: Mutex<Weak<LoopbackChannel>>,
}

impl LoopbackChannel {
    fn new(config: &DataChannelConfig, capacity: usize) -> Arc<Self> {
        let (inbox_tx, inbox_rx) = mpsc::channel(capacity.max(1));
        let (state, _) = watch::channel(ChannelState::Connecting);
        Arc::new(Self {
            label: config.label.clone(),
            id: config.id,
            state,
            inbox_tx: Mutex::new(Some(inbox_tx)),
            inbox_rx: tokio::sync::Mutex::new(inbox_rx),
            outbox: Mutex::new(None),
            peer: Mutex::new(Weak::new()),
        })
    }

    fn pair(a: &Arc<Self>, b: &Arc<Self>) {
        if a.id != b.id || a.label != b.label {
            warn!(
                "Channel mismatch: {}#{} vs {}#{}; not opening",
                a.label, a.id, b.label, b.id
            );
            return;
        }
        if *a.state.borrow() != ChannelState::Connecting
            || *b.state.borrow() != ChannelState::Connecting
        {
            return;
        }
        let (Some(to_b), Some(to_a)) = (lock(&b.inbox_tx).take(), lock(&a.inbox_tx).take())
        else {
            return;
        };

        *lock(&a.outbox) = Some(to_b);
        *lock(&b.outbox) = Some(to_a);
        *lock(&a.peer) = Arc::downgrade(b);
        *lock(&b.peer) = Arc::downgrade(a);
        a.state.send_replace(ChannelState::Open);
        b.state.send_replace(ChannelState::Open);
        debug!("Loopback channel {}#{} open", a.label, a.id);
    }

    /// The other side closed: stop sending, keep draining what arrived.
    fn on_peer_closed(&self) {
        lock(&self.outbox).take();
        self.state.send_replace(ChannelState::Closed);
    }
}

#[async_trait]
impl DataChannel for LoopbackChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn id(&self) -> u16 {
        self.id
    }

    fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    async fn wait_open(&self) -> Result<(), TransportError> {
        let mut rx = self.state.subscribe();
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
        if self.state() != ChannelState::Open {
            return Err(TransportError::ChannelClosed);
        }
        let tx = lock(&self.outbox)
            .clone()
            .ok_or(TransportError::ChannelClosed)?;
        tx.send(chunk.into_bytes())
            .await
            .map_err(|_| TransportError::ChannelClosed)
    }

    async fn recv(&self) -> Option<Bytes> {
        self.inbox_rx.lock().await.recv().await
    }

    async fn close(&self) -> Result<(), TransportError> {
        let previous = self.state.send_replace(ChannelState::Closed);
        if previous == ChannelState::Closed {
            return Ok(());
        }
        lock(&self.outbox).take();
        lock(&self.inbox_tx).take();
        let peer = lock(&self.peer).upgrade();
        if let Some(peer) = peer {
            peer.on_peer_closed();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_common::has_end_of_candidates;
    use std::time::Duration;

    struct Side {
        conn: Arc<dyn PeerConnection>,
        channel: Arc<dyn DataChannel>,
    }

    async fn linked(transport: &LoopbackTransport) -> (Side, Side) {
        let offerer = transport.connect().await.unwrap();
        let answerer = transport.connect().await.unwrap();
        let config = DataChannelConfig::transfer();
        let offer_channel = offerer.create_data_channel(&config).await.unwrap();
        let answer_channel = answerer.create_data_channel(&config).await.unwrap();

        let offer = offerer.create_offer().await.unwrap();
        offerer.set_local_description(offer).await.unwrap();
        let offer = offerer.local_description().await.unwrap();

        answerer.set_remote_description(offer).await.unwrap();
        let answer = answerer.create_answer().await.unwrap();
        answerer.set_local_description(answer).await.unwrap();
        let answer = answerer.local_description().await.unwrap();

        assert_eq!(offer_channel.state(), ChannelState::Connecting);
        offerer.set_remote_description(answer).await.unwrap();

        (
            Side {
                conn: offerer,
                channel: offer_channel,
            },
            Side {
                conn: answerer,
                channel: answer_channel,
            },
        )
    }

    #[tokio::test]
    async fn test_link_opens_channels() {
        let transport = LoopbackTransport::new();
        let (offer, answer) = linked(&transport).await;

        offer.channel.wait_open().await.unwrap();
        answer.channel.wait_open().await.unwrap();
        assert_eq!(offer.conn.connection_state(), ConnectionState::Connected);
        assert_eq!(answer.channel.label(), "transfer");
        assert_eq!(answer.channel.id(), 0);

        offer.channel.send(Chunk::new(&b"hello"[..])).await.unwrap();
        answer.channel.send(Chunk::new(&b"back"[..])).await.unwrap();
        assert_eq!(answer.channel.recv().await.unwrap(), Bytes::from_static(b"hello"));
        assert_eq!(offer.channel.recv().await.unwrap(), Bytes::from_static(b"back"));
    }

    #[tokio::test]
    async fn test_close_drains_then_ends() {
        let transport = LoopbackTransport::new();
        let (offer, answer) = linked(&transport).await;

        for i in 0..3u8 {
            offer.channel.send(Chunk::new(vec![i])).await.unwrap();
        }
        offer.channel.close().await.unwrap();
        offer.conn.close().await.unwrap();

        for i in 0..3u8 {
            assert_eq!(answer.channel.recv().await.unwrap(), Bytes::from(vec![i]));
        }
        assert!(answer.channel.recv().await.is_none());
        assert_eq!(answer.channel.state(), ChannelState::Closed);
        assert_eq!(answer.conn.connection_state(), ConnectionState::Disconnected);
        assert!(matches!(
            offer.channel.send(Chunk::new(vec![9])).await,
            Err(TransportError::ChannelClosed)
        ));
    }

    #[tokio::test]
    async fn test_bounded_queue_applies_backpressure() {
        let transport = LoopbackTransport::with_options(LoopbackOptions {
            channel_capacity: 2,
            ..LoopbackOptions::default()
        });
        let (offer, answer) = linked(&transport).await;

        offer.channel.send(Chunk::new(vec![1])).await.unwrap();
        offer.channel.send(Chunk::new(vec![2])).await.unwrap();
        let blocked = tokio::time::timeout(
            Duration::from_millis(50),
            offer.channel.send(Chunk::new(vec![3])),
        )
        .await;
        assert!(blocked.is_err());

        answer.channel.recv().await.unwrap();
        offer.channel.send(Chunk::new(vec![3])).await.unwrap();
    }

    #[tokio::test]
    async fn test_gathering_events_and_candidates() {
        let transport = LoopbackTransport::new();
        let conn = transport.connect().await.unwrap();
        let mut events = conn.take_events().unwrap();
        assert!(conn.take_events().is_none());

        let offer = conn.create_offer().await.unwrap();
        conn.set_local_description(offer).await.unwrap();

        let mut candidates = 0;
        loop {
            match events.recv().await.unwrap() {
                PeerEvent::IceCandidate(_) => candidates += 1,
                PeerEvent::GatheringComplete => break,
                _ => {}
            }
        }
        assert_eq!(candidates, 2);

        let local = conn.local_description().await.unwrap();
        assert_eq!(local.kind, SdpType::Offer);
        assert_eq!(local.sdp.matches("a=candidate:").count(), 2);
        assert!(!has_end_of_candidates(&local.sdp));
    }

    #[tokio::test]
    async fn test_native_end_of_candidates() {
        let transport = LoopbackTransport::with_options(LoopbackOptions {
            native_end_of_candidates: true,
            ..LoopbackOptions::default()
        });
        let conn = transport.connect().await.unwrap();
        let offer = conn.create_offer().await.unwrap();
        conn.set_local_description(offer).await.unwrap();
        assert!(has_end_of_candidates(
            &conn.local_description().await.unwrap().sdp
        ));
    }

    #[tokio::test]
    async fn test_rejects_bad_remote_descriptions() {
        let transport = LoopbackTransport::new();
        let conn = transport.connect().await.unwrap();

        assert!(matches!(
            conn.create_answer().await,
            Err(TransportError::InvalidState(_))
        ));
        assert!(matches!(
            conn.set_remote_description(SessionDescription::offer("garbage")).await,
            Err(TransportError::InvalidDescription(_))
        ));

        let own = conn.create_offer().await.unwrap();
        assert!(matches!(
            conn.set_remote_description(own).await,
            Err(TransportError::InvalidDescription(_))
        ));

        let failing = LoopbackTransport::with_options(LoopbackOptions {
            reject_remote_descriptions: true,
            ..LoopbackOptions::default()
        });
        let a = failing.connect().await.unwrap();
        let b = failing.connect().await.unwrap();
        let offer = a.create_offer().await.unwrap();
        assert!(matches!(
            b.set_remote_description(offer).await,
            Err(TransportError::InvalidDescription(_))
        ));
    }

    #[tokio::test]
    async fn test_channel_created_after_link_still_opens() {
        let transport = LoopbackTransport::new();
        let offerer = transport.connect().await.unwrap();
        let answerer = transport.connect().await.unwrap();

        let offer = offerer.create_offer().await.unwrap();
        offerer.set_local_description(offer.clone()).await.unwrap();
        answerer.set_remote_description(offer).await.unwrap();
        let answer = answerer.create_answer().await.unwrap();
        answerer.set_local_description(answer.clone()).await.unwrap();
        offerer.set_remote_description(answer).await.unwrap();

        let config = DataChannelConfig::transfer();
        let a = offerer.create_data_channel(&config).await.unwrap();
        assert_eq!(a.state(), ChannelState::Connecting);
        let b = answerer.create_data_channel(&config).await.unwrap();
        a.wait_open().await.unwrap();
        b.wait_open().await.unwrap();
    }
}
