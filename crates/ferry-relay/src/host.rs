//! Contexts the relay creates and talks to: the streaming helper (offer
//! side) and the consumer (answer side).

use async_trait::async_trait;
use ferry_common::{Port, Result};

use crate::service::{RelayHandle, RelayLink};
use crate::session::NegotiationId;

/// Everything a streaming helper needs at creation.
#[derive(Debug)]
pub struct HelperLink {
    pub negotiation: NegotiationId,
    /// Signaling port, role `remote`.
    pub port: Port,
    /// In-process link for `start` and keep-alive.
    pub host: RelayLink,
}

/// Everything injected into the consumer context.
#[derive(Debug, Clone)]
pub struct ConsumerLink {
    pub negotiation: NegotiationId,
    pub origin: String,
    /// The consumer obtains its `local` port through
    /// [`RelayHandle::connect_external`].
    pub relay: RelayHandle,
}

/// Creates and tears down the relay's helper and consumer contexts.
///
/// Implementations must not call back into the relay from inside these
/// methods; the relay is blocked on them. Spawn and return.
#[async_trait]
pub trait ContextHost: Send + Sync {
    async fn has_helper(&self) -> bool;

    async fn create_helper(&self, link: HelperLink) -> Result<()>;

    async fn close_helper(&self) -> Result<()>;

    async fn inject_consumer(&self, link: ConsumerLink) -> Result<()>;
}
