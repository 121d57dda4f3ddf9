//! Transport seam between the negotiation/streaming logic and a concrete
//! peer-connection implementation.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use ferry_common::{Chunk, Error};
use thiserror::Error as ThisError;
use tokio::sync::mpsc;

pub const TRANSFER_CHANNEL_LABEL: &str = "transfer";
pub const TRANSFER_CHANNEL_ID: u16 = 0;
pub const TRANSFER_CHANNEL_PROTOCOL: &str = "raw";

#[derive(Debug, ThisError)]
pub enum TransportError {
    #[error("invalid session description: {0}")]
    InvalidDescription(String),
    #[error("operation not valid in state {0}")]
    InvalidState(String),
    #[error("data channel closed")]
    ChannelClosed,
    #[error("peer connection closed")]
    ConnectionClosed,
    #[error("transport backend error: {0}")]
    Backend(String),
}

impl From<TransportError> for Error {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::ChannelClosed => Error::transfer(err),
            TransportError::ConnectionClosed => Error::port_closed(err),
            _ => Error::negotiation(err),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpType {
    Offer,
    Answer,
}

impl fmt::Display for SdpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SdpType::Offer => f.write_str("offer"),
            SdpType::Answer => f.write_str("answer"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Connection-level notifications. Candidates and gathering completion
/// drive negotiation; the rest are diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    IceCandidate(String),
    GatheringComplete,
    SignalingState(String),
    IceConnectionState(String),
    GatheringState(String),
    ConnectionState(ConnectionState),
}

/// Data channel parameters. Both sides must agree out of band.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataChannelConfig {
    pub label: String,
    pub id: u16,
    pub negotiated: bool,
    pub ordered: bool,
    pub protocol: String,
}

impl DataChannelConfig {
    /// Pre-negotiated, ordered, reliable binary channel used for payloads.
    pub fn transfer() -> Self {
        Self {
            label: TRANSFER_CHANNEL_LABEL.to_string(),
            id: TRANSFER_CHANNEL_ID,
            negotiated: true,
            ordered: true,
            protocol: TRANSFER_CHANNEL_PROTOCOL.to_string(),
        }
    }
}

impl Default for DataChannelConfig {
    fn default() -> Self {
        Self::transfer()
    }
}

/// Creates peer connections.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    fn name(&self) -> &'static str;

    async fn connect(&self) -> Result<Arc<dyn PeerConnection>, TransportError>;
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_data_channel(
        &self,
        config: &DataChannelConfig,
    ) -> Result<Arc<dyn DataChannel>, TransportError>;

    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError>;

    async fn set_remote_description(&self, desc: SessionDescription)
        -> Result<(), TransportError>;

    /// Current local description, including candidates gathered so far.
    async fn local_description(&self) -> Option<SessionDescription>;

    /// Event stream for this connection. Can be taken once.
    fn take_events(&self) -> Option<mpsc::Receiver<PeerEvent>>;

    fn connection_state(&self) -> ConnectionState;

    async fn close(&self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;

    fn id(&self) -> u16;

    fn state(&self) -> ChannelState;

    async fn wait_open(&self) -> Result<(), TransportError>;

    /// Queue one message. Waits while the channel's send buffer is full.
    async fn send(&self, chunk: Chunk) -> Result<(), TransportError>;

    /// Next message, or `None` once the channel is closed and drained.
    async fn recv(&self) -> Option<Bytes>;

    async fn close(&self) -> Result<(), TransportError>;
}
