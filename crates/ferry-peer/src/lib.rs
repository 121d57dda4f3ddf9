//! Ferry peer endpoints.
//!
//! The offer endpoint (the streaming helper) and the answer endpoint (the
//! consumer) negotiate a peer connection through relay ports, then move the
//! payload over the pre-negotiated "transfer" data channel. The peer
//! connection itself sits behind the [`PeerTransport`] seam: an in-process
//! loopback transport is always available, the webrtc-rs backend behind the
//! `webrtc-transport` feature.

#![forbid(unsafe_code)]

pub mod endpoint;
pub mod loopback;
pub mod negotiation;
pub mod streaming;
pub mod transport;
#[cfg(feature = "webrtc-transport")]
pub mod webrtc;

pub use endpoint::{run_answer_endpoint, run_offer_endpoint, EndpointOptions};
pub use loopback::{LoopbackOptions, LoopbackTransport};
pub use negotiation::{
    negotiate_answer, negotiate_offer, NegotiationOptions, NegotiationState, Negotiator,
    PeerSession, PeerSessionState, SessionClosure,
};
pub use streaming::{receive_payload, send_payload, ReceiveReport, TransferReport};
pub use transport::{
    ChannelState, ConnectionState, DataChannel, DataChannelConfig, PeerConnection, PeerEvent,
    PeerTransport, SessionDescription, TransportError,
};
#[cfg(feature = "webrtc-transport")]
pub use webrtc::WebRtcTransport;
