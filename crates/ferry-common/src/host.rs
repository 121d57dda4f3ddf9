use async_trait::async_trait;

use crate::payload::Payload;
use crate::Result;

/// In-process link from the streaming helper back to the relay.
///
/// This never travels over the peer channel; it is how the helper obtains
/// the payload and keeps the relay from being reclaimed while streaming.
#[async_trait]
pub trait HostChannel: Send + Sync {
    /// Send the activation signal and receive the payload.
    async fn start(&self) -> Result<Payload>;

    /// Reset the relay's idle timer.
    async fn keep_alive(&self) -> Result<()>;
}
