//! Offer/answer negotiation over a signaling port.
//!
//! State machine (offer side):
//! - IDLE → GATHERING_CANDIDATES: offer created and applied
//! - GATHERING_CANDIDATES → DESCRIPTION_READY: gathering complete
//! - DESCRIPTION_READY → AWAITING_PEER_DESCRIPTION: offer posted
//! - AWAITING_PEER_DESCRIPTION → NEGOTIATED: answer applied
//!
//! The answer side waits for the offer first, then gathers. Any failure
//! moves to FAILED; negotiation is single-shot and never retried.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use ferry_common::helpers::sdp_preview;
use ferry_common::{
    ensure_end_of_candidates, Error, Port, RelayConfig, Result, Role, SignalingMessage,
};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::transport::{
    ChannelState, ConnectionState, DataChannel, DataChannelConfig, PeerConnection, PeerEvent,
    PeerTransport, SessionDescription,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    GatheringCandidates,
    DescriptionReady,
    AwaitingPeerDescription,
    Negotiated,
    Failed,
    Closed,
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::GatheringCandidates => "gathering-candidates",
            Self::DescriptionReady => "description-ready",
            Self::AwaitingPeerDescription => "awaiting-peer-description",
            Self::Negotiated => "negotiated",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Per-endpoint negotiation state. `Remote` is the offer side, `Local` the
/// answer side.
#[derive(Debug)]
pub struct Negotiator {
    role: Role,
    state: NegotiationState,
}

impl Negotiator {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            state: NegotiationState::Idle,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn advance(&mut self, next: NegotiationState) -> Result<()> {
        use NegotiationState::*;

        let allowed = match (self.role, self.state, next) {
            (_, Closed, _) => false,
            (_, _, Closed) => true,
            (_, Failed, _) => false,
            (_, _, Failed) => true,
            (Role::Remote, Idle, GatheringCandidates)
            | (Role::Remote, GatheringCandidates, DescriptionReady)
            | (Role::Remote, DescriptionReady, AwaitingPeerDescription)
            | (Role::Remote, AwaitingPeerDescription, Negotiated) => true,
            (Role::Local, Idle, AwaitingPeerDescription)
            | (Role::Local, AwaitingPeerDescription, GatheringCandidates)
            | (Role::Local, GatheringCandidates, DescriptionReady)
            | (Role::Local, DescriptionReady, Negotiated) => true,
            _ => false,
        };
        if !allowed {
            return Err(Error::negotiation(format!(
                "{} endpoint cannot go from {} to {}",
                self.role, self.state, next
            )));
        }

        debug!("{} negotiation: {} -> {}", self.role, self.state, next);
        self.state = next;
        Ok(())
    }

    pub fn fail(&mut self, err: &Error) {
        error!("{} negotiation failed in {}: {}", self.role, self.state, err);
        if self.state != NegotiationState::Closed {
            self.state = NegotiationState::Failed;
        }
    }
}

#[derive(Debug, Clone)]
pub struct NegotiationOptions {
    pub gather_timeout: Duration,
    pub channel: DataChannelConfig,
}

impl NegotiationOptions {
    pub fn from_config(config: &RelayConfig) -> Self {
        Self {
            gather_timeout: config.gather_timeout,
            channel: DataChannelConfig::transfer(),
        }
    }
}

impl Default for NegotiationOptions {
    fn default() -> Self {
        Self::from_config(&RelayConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerSessionState {
    New,
    HaveLocalOffer,
    HaveLocalAnswer,
    Connected,
    Closed,
}

/// Channel and connection states observed once a session has closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionClosure {
    pub channel: ChannelState,
    pub connection: ConnectionState,
}

impl SessionClosure {
    pub fn is_closed(&self) -> bool {
        self.channel == ChannelState::Closed && self.connection == ConnectionState::Closed
    }
}

/// A negotiated peer connection and its transfer channel.
pub struct PeerSession {
    role: Role,
    state: PeerSessionState,
    negotiation: NegotiationState,
    connection: Arc<dyn PeerConnection>,
    channel: Arc<dyn DataChannel>,
    candidates: Vec<String>,
}

impl PeerSession {
    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> PeerSessionState {
        self.state
    }

    pub fn negotiation_state(&self) -> NegotiationState {
        self.negotiation
    }

    pub fn candidates(&self) -> &[String] {
        &self.candidates
    }

    pub fn connection(&self) -> &Arc<dyn PeerConnection> {
        &self.connection
    }

    pub fn channel(&self) -> &Arc<dyn DataChannel> {
        &self.channel
    }

    /// Wait for the transfer channel to open.
    pub async fn wait_open(&mut self, timeout: Duration) -> Result<()> {
        match tokio::time::timeout(timeout, self.channel.wait_open()).await {
            Ok(Ok(())) => {
                info!(
                    "{} channel '{}' open",
                    self.role,
                    self.channel.label()
                );
                self.state = PeerSessionState::Connected;
                Ok(())
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(Error::timeout(format!(
                "channel '{}' did not open within {:?}",
                self.channel.label(),
                timeout
            ))),
        }
    }

    /// Close the channel, then the connection. Safe to call more than once.
    pub async fn close(&mut self) -> SessionClosure {
        if self.state != PeerSessionState::Closed {
            self.shutdown().await;
        }
        SessionClosure {
            channel: self.channel.state(),
            connection: self.connection.connection_state(),
        }
    }

    async fn shutdown(&mut self) {
        if let Err(e) = self.channel.close().await {
            warn!("Failed to close {} channel: {}", self.role, e);
        }
        if let Err(e) = self.connection.close().await {
            warn!("Failed to close {} connection: {}", self.role, e);
        }
        self.state = PeerSessionState::Closed;
        self.negotiation = NegotiationState::Closed;
        debug!("{} peer session closed", self.role);
    }
}

/// Collect candidates until gathering completes or `timeout` elapses.
async fn gather_candidates(
    role: Role,
    events: &mut mpsc::Receiver<PeerEvent>,
    timeout: Duration,
) -> Vec<String> {
    let mut candidates = Vec::new();
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => {
                warn!("{} ICE gathering timed out with {} candidates", role, candidates.len());
                break;
            }
            event = events.recv() => match event {
                Some(PeerEvent::IceCandidate(candidate)) => {
                    debug!("{} candidate: {}", role, candidate);
                    candidates.push(candidate);
                }
                Some(PeerEvent::GatheringComplete) => break,
                Some(other) => log_event(role, &other),
                None => break,
            },
        }
    }
    candidates
}

fn log_event(role: Role, event: &PeerEvent) {
    match event {
        PeerEvent::SignalingState(state) => debug!("{} signaling state: {}", role, state),
        PeerEvent::IceConnectionState(state) => debug!("{} ICE connection state: {}", role, state),
        PeerEvent::GatheringState(state) => debug!("{} ICE gathering state: {}", role, state),
        PeerEvent::ConnectionState(state) => debug!("{} connection state: {:?}", role, state),
        PeerEvent::IceCandidate(candidate) => debug!("{} late candidate: {}", role, candidate),
        PeerEvent::GatheringComplete => {}
    }
}

/// Log remaining connection events until the connection goes away.
fn spawn_observer(role: Role, mut events: mpsc::Receiver<PeerEvent>) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            log_event(role, &event);
        }
    });
}

fn negotiation_err(err: crate::transport::TransportError) -> Error {
    Error::negotiation(err)
}

struct Attempt {
    negotiator: Negotiator,
    connection: Arc<dyn PeerConnection>,
}

impl Attempt {
    async fn new(role: Role, transport: &dyn PeerTransport) -> Result<Self> {
        let connection = transport.connect().await.map_err(negotiation_err)?;
        Ok(Self {
            negotiator: Negotiator::new(role),
            connection,
        })
    }

    async fn fail(mut self, err: Error) -> Error {
        self.negotiator.fail(&err);
        if let Err(e) = self.connection.close().await {
            debug!("Closing failed connection: {}", e);
        }
        err
    }

    fn finish(
        self,
        state: PeerSessionState,
        channel: Arc<dyn DataChannel>,
        candidates: Vec<String>,
        events: mpsc::Receiver<PeerEvent>,
    ) -> PeerSession {
        let role = self.negotiator.role();
        spawn_observer(role, events);
        info!("{} negotiation complete", role);
        PeerSession {
            role,
            state,
            negotiation: self.negotiator.state(),
            connection: self.connection,
            channel,
            candidates,
        }
    }
}

/// Offer endpoint: create the offer, publish it once gathering completes,
/// then apply the answer the relay hands back.
pub async fn negotiate_offer(
    transport: &dyn PeerTransport,
    port: &mut Port,
    options: &NegotiationOptions,
) -> Result<PeerSession> {
    let mut attempt = Attempt::new(Role::Remote, transport).await?;
    let steps = offer_steps(&mut attempt, port, options).await;
    match steps {
        Ok((channel, candidates, events)) => Ok(attempt.finish(
            PeerSessionState::HaveLocalOffer,
            channel,
            candidates,
            events,
        )),
        Err(err) => Err(attempt.fail(err).await),
    }
}

type Steps = (Arc<dyn DataChannel>, Vec<String>, mpsc::Receiver<PeerEvent>);

async fn offer_steps(
    attempt: &mut Attempt,
    port: &mut Port,
    options: &NegotiationOptions,
) -> Result<Steps> {
    let role = Role::Remote;
    let conn = attempt.connection.clone();
    let mut events = conn
        .take_events()
        .ok_or_else(|| Error::internal("connection events already taken"))?;
    let channel = conn
        .create_data_channel(&options.channel)
        .await
        .map_err(negotiation_err)?;

    let offer = conn.create_offer().await.map_err(negotiation_err)?;
    conn.set_local_description(offer)
        .await
        .map_err(negotiation_err)?;
    attempt.negotiator.advance(NegotiationState::GatheringCandidates)?;

    let candidates = gather_candidates(role, &mut events, options.gather_timeout).await;
    let local = conn
        .local_description()
        .await
        .ok_or_else(|| Error::negotiation("no local description after gathering"))?;
    let sdp = ensure_end_of_candidates(&local.sdp);
    attempt.negotiator.advance(NegotiationState::DescriptionReady)?;

    port.post(SignalingMessage::description(role, sdp.clone()))
        .await?;
    info!("Offer posted ({} candidates): {}", candidates.len(), sdp_preview(&sdp));
    attempt
        .negotiator
        .advance(NegotiationState::AwaitingPeerDescription)?;

    let answer = port.request_description(Role::Local).await?;
    debug!("Answer received: {}", sdp_preview(&answer));
    conn.set_remote_description(SessionDescription::answer(answer))
        .await
        .map_err(negotiation_err)?;
    attempt.negotiator.advance(NegotiationState::Negotiated)?;

    Ok((channel, candidates, events))
}

/// Answer endpoint: ask for the offer, apply it, answer, and publish the
/// answer once gathering completes.
pub async fn negotiate_answer(
    transport: &dyn PeerTransport,
    port: &mut Port,
    options: &NegotiationOptions,
) -> Result<PeerSession> {
    let mut attempt = Attempt::new(Role::Local, transport).await?;
    let steps = answer_steps(&mut attempt, port, options).await;
    match steps {
        Ok((channel, candidates, events)) => Ok(attempt.finish(
            PeerSessionState::HaveLocalAnswer,
            channel,
            candidates,
            events,
        )),
        Err(err) => Err(attempt.fail(err).await),
    }
}

async fn answer_steps(
    attempt: &mut Attempt,
    port: &mut Port,
    options: &NegotiationOptions,
) -> Result<Steps> {
    let role = Role::Local;
    let conn = attempt.connection.clone();
    let mut events = conn
        .take_events()
        .ok_or_else(|| Error::internal("connection events already taken"))?;
    let channel = conn
        .create_data_channel(&options.channel)
        .await
        .map_err(negotiation_err)?;

    attempt
        .negotiator
        .advance(NegotiationState::AwaitingPeerDescription)?;
    let offer = port.request_description(Role::Remote).await?;
    debug!("Offer received: {}", sdp_preview(&offer));
    conn.set_remote_description(SessionDescription::offer(offer))
        .await
        .map_err(negotiation_err)?;

    let answer = conn.create_answer().await.map_err(negotiation_err)?;
    conn.set_local_description(answer)
        .await
        .map_err(negotiation_err)?;
    attempt.negotiator.advance(NegotiationState::GatheringCandidates)?;

    let candidates = gather_candidates(role, &mut events, options.gather_timeout).await;
    let local = conn
        .local_description()
        .await
        .ok_or_else(|| Error::negotiation("no local description after gathering"))?;
    let sdp = ensure_end_of_candidates(&local.sdp);
    attempt.negotiator.advance(NegotiationState::DescriptionReady)?;

    port.post(SignalingMessage::description(role, sdp.clone()))
        .await?;
    info!("Answer posted ({} candidates): {}", candidates.len(), sdp_preview(&sdp));
    attempt.negotiator.advance(NegotiationState::Negotiated)?;

    Ok((channel, candidates, events))
}
