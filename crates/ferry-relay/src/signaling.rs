//! Store-and-forward signaling between the two endpoints of a negotiation.
//!
//! Endpoints never talk to each other directly. Each one publishes its own
//! description here and asks for the other side's; whichever happens first,
//! the request resolves exactly once with the latest description.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use ferry_common::helpers::sdp_preview;
use ferry_common::{ensure_end_of_candidates, Error, Role, SignalingMessage};
use thiserror::Error as ThisError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::session::{
    Delivery, NegotiationId, NegotiationPool, NegotiationSession, SessionStateCounts,
};

#[derive(Debug, ThisError)]
pub enum SignalingError {
    #[error("negotiation not found")]
    SessionNotFound,
    #[error("a negotiation is already active")]
    SessionFull,
    #[error("negotiation expired")]
    SessionExpired,
    #[error("{0} endpoint already connected")]
    PeerAlreadyRegistered(Role),
    #[error("a request for the {0} description is already outstanding")]
    RequestOutstanding(Role),
    #[error("request for the {0} description was discarded")]
    RequestDiscarded(Role),
    #[error("{role} description is {len} bytes, limit is {max}")]
    DescriptionTooLarge { role: Role, len: usize, max: usize },
    #[error("{0} description is empty")]
    EmptyDescription(Role),
}

impl From<SignalingError> for Error {
    fn from(err: SignalingError) -> Self {
        match err {
            SignalingError::SessionFull
            | SignalingError::PeerAlreadyRegistered(_)
            | SignalingError::RequestOutstanding(_) => Error::contention(err),
            SignalingError::RequestDiscarded(_) => Error::stale(err),
            SignalingError::SessionNotFound | SignalingError::SessionExpired => {
                Error::port_closed(err)
            }
            SignalingError::DescriptionTooLarge { .. } | SignalingError::EmptyDescription(_) => {
                Error::negotiation(err)
            }
        }
    }
}

/// Pending answer to a description request.
///
/// Resolves with the description, or with [`SignalingError::RequestDiscarded`]
/// if the requester disconnected or the negotiation ended first.
#[derive(Debug)]
pub struct DescriptionWaiter {
    role: Role,
    rx: oneshot::Receiver<String>,
}

impl DescriptionWaiter {
    pub fn role(&self) -> Role {
        self.role
    }
}

impl Future for DescriptionWaiter {
    type Output = Result<String, SignalingError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let role = self.role;
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|res| res.map_err(|_| SignalingError::RequestDiscarded(role)))
    }
}

/// Signaling state for every live negotiation.
#[derive(Debug)]
pub struct SignalingRelay {
    pool: NegotiationPool,
    max_description_bytes: usize,
}

impl SignalingRelay {
    pub fn new(max_negotiations: usize, ttl: Duration, max_description_bytes: usize) -> Self {
        Self {
            pool: NegotiationPool::new(max_negotiations, ttl),
            max_description_bytes,
        }
    }

    pub fn open(&mut self, origin: &str) -> Result<NegotiationId, SignalingError> {
        let id = self.pool.open(origin)?;
        info!("Negotiation {} opened for {}", id, origin);
        Ok(id)
    }

    /// End a negotiation. Outstanding requests are discarded and every
    /// endpoint port held for it is released.
    pub fn close(&mut self, id: &NegotiationId) -> Option<NegotiationSession> {
        let session = self.pool.remove(id)?;
        info!(
            "Negotiation {} closed after {} descriptions",
            id, session.descriptions_forwarded
        );
        Some(session)
    }

    /// Attach the relay side of an endpoint's port.
    pub fn connect(
        &mut self,
        id: &NegotiationId,
        role: Role,
        outbound: mpsc::Sender<SignalingMessage>,
    ) -> Result<(), SignalingError> {
        let session = self
            .pool
            .get_mut(id)
            .ok_or(SignalingError::SessionNotFound)?;
        session.register_peer(role, outbound)?;
        debug!("{} endpoint connected to negotiation {}", role, id);
        Ok(())
    }

    /// Detach an endpoint. Its outstanding request is dropped unresolved and
    /// its buffered description cleared; the other role is untouched.
    pub fn disconnect(&mut self, id: &NegotiationId, role: Role) -> Result<usize, SignalingError> {
        let session = self
            .pool
            .get_mut(id)
            .ok_or(SignalingError::SessionNotFound)?;
        let dropped = session.unregister_peer(role);
        debug!(
            "{} endpoint left negotiation {} ({} pending items dropped)",
            role, id, dropped
        );
        Ok(dropped)
    }

    /// Store the description for `role`, resolving a waiting request.
    ///
    /// Last write wins. The stored text always carries an end-of-candidates
    /// marker.
    pub fn forward(
        &mut self,
        id: &NegotiationId,
        role: Role,
        sdp: &str,
    ) -> Result<Delivery, SignalingError> {
        if sdp.trim().is_empty() {
            return Err(SignalingError::EmptyDescription(role));
        }
        if sdp.len() > self.max_description_bytes {
            return Err(SignalingError::DescriptionTooLarge {
                role,
                len: sdp.len(),
                max: self.max_description_bytes,
            });
        }

        let session = self
            .pool
            .get_mut(id)
            .ok_or(SignalingError::SessionNotFound)?;
        let delivery = session.slot_mut(role).offer(ensure_end_of_candidates(sdp));
        if delivery == Delivery::Resolved {
            session.descriptions_forwarded += 1;
        }

        debug!(
            "{} description {:?} on negotiation {}: {}",
            role,
            delivery,
            id,
            sdp_preview(sdp)
        );
        Ok(delivery)
    }

    /// Ask for the description of `role`.
    ///
    /// The request belongs to the endpoint of the other role. At most one may
    /// be outstanding per role.
    pub fn request(
        &mut self,
        id: &NegotiationId,
        role: Role,
    ) -> Result<DescriptionWaiter, SignalingError> {
        let session = self
            .pool
            .get_mut(id)
            .ok_or(SignalingError::SessionNotFound)?;
        let had_pending = session.slot(role).has_pending();
        let rx = session.slot_mut(role).request(role)?;
        if had_pending {
            session.descriptions_forwarded += 1;
        }
        Ok(DescriptionWaiter { role, rx })
    }

    /// Relay-to-endpoint sender for `role`, if that endpoint is connected.
    pub fn outbound(
        &self,
        id: &NegotiationId,
        role: Role,
    ) -> Option<mpsc::Sender<SignalingMessage>> {
        self.pool
            .get(id)
            .and_then(|session| session.peer(role))
            .map(|peer| peer.outbound.clone())
    }

    pub fn session(&self, id: &NegotiationId) -> Option<&NegotiationSession> {
        self.pool.get(id)
    }

    pub fn cleanup(&mut self) -> usize {
        self.pool.cleanup()
    }

    pub fn active_negotiations(&self) -> usize {
        self.pool.len()
    }

    pub fn state_counts(&self) -> SessionStateCounts {
        self.pool.state_counts()
    }
}
