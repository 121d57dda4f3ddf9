//! Bidirectional in-process message ports.
//!
//! A port pair is the only link between the relay and an endpoint. Messages
//! are delivered in send order; dropping one end is observed by the other
//! as the port closing.

use tokio::sync::mpsc;
use tracing::debug;

use crate::protocol::{Role, SignalingMessage};
use crate::{Error, Result};

pub const PORT_CAPACITY: usize = 32;

/// One end of a signaling port, named after the endpoint role it serves.
#[derive(Debug)]
pub struct Port {
    role: Role,
    tx: mpsc::Sender<SignalingMessage>,
    rx: mpsc::Receiver<SignalingMessage>,
}

/// Create a connected pair of ports for `role`.
///
/// The first port goes to the endpoint, the second stays with the relay.
pub fn port_pair(role: Role) -> (Port, Port) {
    let (to_relay_tx, to_relay_rx) = mpsc::channel(PORT_CAPACITY);
    let (to_endpoint_tx, to_endpoint_rx) = mpsc::channel(PORT_CAPACITY);
    (
        Port {
            role,
            tx: to_relay_tx,
            rx: to_endpoint_rx,
        },
        Port {
            role,
            tx: to_endpoint_tx,
            rx: to_relay_rx,
        },
    )
}

impl Port {
    pub fn role(&self) -> Role {
        self.role
    }

    pub async fn post(&self, message: SignalingMessage) -> Result<()> {
        self.tx
            .send(message)
            .await
            .map_err(|_| Error::port_closed(format!("{} port", self.role)))
    }

    /// Next message, or `None` once the other end is dropped.
    pub async fn recv(&mut self) -> Option<SignalingMessage> {
        self.rx.recv().await
    }

    /// Ask the other end for the description of `role` and wait for it.
    ///
    /// Resolves exactly once, with the first description for `role` that
    /// arrives after the request was posted.
    pub async fn request_description(&mut self, role: Role) -> Result<String> {
        self.post(SignalingMessage::request(role)).await?;
        loop {
            match self.rx.recv().await {
                Some(SignalingMessage::Description { role: got, sdp }) if got == role => {
                    return Ok(sdp)
                }
                Some(other) => {
                    debug!(port = %self.role, ?other, "ignoring message while awaiting {} description", role);
                }
                None => {
                    return Err(Error::port_closed(format!(
                        "{} port closed while awaiting {} description",
                        self.role, role
                    )))
                }
            }
        }
    }

    /// Split into the outbound sender and inbound receiver.
    pub fn into_parts(
        self,
    ) -> (
        mpsc::Sender<SignalingMessage>,
        mpsc::Receiver<SignalingMessage>,
    ) {
        (self.tx, self.rx)
    }
}
