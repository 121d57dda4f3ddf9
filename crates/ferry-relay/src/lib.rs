#![forbid(unsafe_code)]

//! Ferry relay - store-and-forward signaling and payload origin.
//!
//! The relay:
//! 1. Gates which origins may start a transfer (allow-list plus approval)
//! 2. Creates the streaming helper and the consumer, one port each
//! 3. Stores and forwards their session descriptions; beyond a size check
//!    and an end-of-candidates marker they pass through untouched
//! 4. Hands the payload to the helper on `start` and stays alive while it
//!    streams

pub mod auth;
pub mod host;
pub mod keepalive;
pub mod service;
pub mod session;
pub mod signaling;
pub mod source;
pub mod transfer;

pub use auth::{
    normalize_origin, Approver, FileOriginGate, OriginGate, PendingOperation, StaticApprover,
};
pub use host::{ConsumerLink, ContextHost, HelperLink};
pub use keepalive::IdleMonitor;
pub use service::{ActionOutcome, RelayExit, RelayHandle, RelayLink, RelayService, RelayStatus};
pub use session::{Delivery, NegotiationId, SessionState, SessionStateCounts};
pub use signaling::{DescriptionWaiter, SignalingError, SignalingRelay};
pub use source::{FileSource, HttpSource, MemorySource, PayloadSource};
pub use transfer::{TransferId, TransferOutcome, TransferRecord};
