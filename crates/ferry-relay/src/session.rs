//! Negotiation session management and state machine.
//!
//! One session exists per negotiation:
//! - INIT: session opened, no endpoint connected yet
//! - WAITING_PEER: one endpoint connected, waiting for the other
//! - ACTIVE: both endpoints connected, descriptions flowing
//! - EXPIRED: session ended

use std::collections::HashMap;
use std::time::Duration;

use ferry_common::{Role, SignalingMessage};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use uuid::Uuid;

use crate::signaling::SignalingError;

pub type NegotiationId = Uuid;

/// Session state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Opened, no endpoint connected
    Init,
    /// One endpoint connected, waiting for the other
    WaitingPeer,
    /// Both endpoints connected
    Active,
    /// Session ended, cleaning up
    Expired,
}

/// Per-endpoint state within a session
#[derive(Debug)]
pub struct PeerState {
    /// Relay-to-endpoint half of the endpoint's port
    pub outbound: mpsc::Sender<SignalingMessage>,
}

impl PeerState {
    pub fn new(outbound: mpsc::Sender<SignalingMessage>) -> Self {
        Self { outbound }
    }
}

/// Outcome of storing a description.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Handed straight to a waiting request.
    Resolved,
    /// Buffered until someone asks for it.
    Buffered,
    /// Buffered, replacing an older description for the same role.
    Replaced,
}

/// Buffered description and outstanding request for one role.
///
/// The request for a role is always owned by the endpoint of the other role.
#[derive(Debug, Default)]
pub struct RoleSlot {
    pending: Option<String>,
    waiter: Option<oneshot::Sender<String>>,
}

impl RoleSlot {
    /// Store `sdp`, resolving the outstanding request if there is one.
    pub fn offer(&mut self, sdp: String) -> Delivery {
        let sdp = match self.waiter.take() {
            Some(waiter) => match waiter.send(sdp) {
                Ok(()) => {
                    self.pending = None;
                    return Delivery::Resolved;
                }
                // Requester went away without telling us; keep the value.
                Err(sdp) => sdp,
            },
            None => sdp,
        };

        match self.pending.replace(sdp) {
            Some(_) => Delivery::Replaced,
            None => Delivery::Buffered,
        }
    }

    /// Take the buffered description, or park a request until one arrives.
    pub fn request(&mut self, role: Role) -> Result<oneshot::Receiver<String>, SignalingError> {
        if self.has_waiter() {
            return Err(SignalingError::RequestOutstanding(role));
        }

        let (tx, rx) = oneshot::channel();
        match self.pending.take() {
            Some(sdp) => {
                // Receiver is alive in this scope, send cannot fail.
                let _ = tx.send(sdp);
            }
            None => self.waiter = Some(tx),
        }
        Ok(rx)
    }

    pub fn has_waiter(&self) -> bool {
        self.waiter.as_ref().is_some_and(|w| !w.is_closed())
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Drop the outstanding request without resolving it.
    pub fn discard_waiter(&mut self) -> bool {
        self.waiter.take().is_some()
    }

    pub fn discard_pending(&mut self) -> bool {
        self.pending.take().is_some()
    }
}

/// A signaling session between the two endpoints of one negotiation
#[derive(Debug)]
pub struct NegotiationSession {
    pub id: NegotiationId,
    /// Origin that triggered the negotiation
    pub origin: String,
    pub state: SessionState,
    pub local: Option<PeerState>,
    pub remote: Option<PeerState>,
    local_slot: RoleSlot,
    remote_slot: RoleSlot,
    pub created_at: Instant,
    pub descriptions_forwarded: u64,
}

impl NegotiationSession {
    pub fn new(id: NegotiationId, origin: impl Into<String>) -> Self {
        Self {
            id,
            origin: origin.into(),
            state: SessionState::Init,
            local: None,
            remote: None,
            local_slot: RoleSlot::default(),
            remote_slot: RoleSlot::default(),
            created_at: Instant::now(),
            descriptions_forwarded: 0,
        }
    }

    /// Register an endpoint's port with this session
    pub fn register_peer(
        &mut self,
        role: Role,
        outbound: mpsc::Sender<SignalingMessage>,
    ) -> Result<(), SignalingError> {
        if self.state == SessionState::Expired {
            return Err(SignalingError::SessionExpired);
        }

        let slot = match role {
            Role::Local => &mut self.local,
            Role::Remote => &mut self.remote,
        };
        if slot.is_some() {
            return Err(SignalingError::PeerAlreadyRegistered(role));
        }
        *slot = Some(PeerState::new(outbound));

        self.refresh_state();
        Ok(())
    }

    /// Forget an endpoint that disconnected.
    ///
    /// Its outstanding request is discarded, never resolved, and any
    /// description it left behind is cleared. Returns how many items were
    /// dropped.
    pub fn unregister_peer(&mut self, role: Role) -> usize {
        let removed = match role {
            Role::Local => self.local.take(),
            Role::Remote => self.remote.take(),
        };

        let mut dropped = 0;
        if self.slot_mut(role.peer()).discard_waiter() {
            dropped += 1;
        }
        if self.slot_mut(role).discard_pending() {
            dropped += 1;
        }

        if removed.is_some() {
            self.refresh_state();
        }
        dropped
    }

    pub fn peer(&self, role: Role) -> Option<&PeerState> {
        match role {
            Role::Local => self.local.as_ref(),
            Role::Remote => self.remote.as_ref(),
        }
    }

    pub fn slot(&self, role: Role) -> &RoleSlot {
        match role {
            Role::Local => &self.local_slot,
            Role::Remote => &self.remote_slot,
        }
    }

    pub fn slot_mut(&mut self, role: Role) -> &mut RoleSlot {
        match role {
            Role::Local => &mut self.local_slot,
            Role::Remote => &mut self.remote_slot,
        }
    }

    pub fn connected_peers(&self) -> usize {
        self.local.is_some() as usize + self.remote.is_some() as usize
    }

    pub fn is_expired(&self, ttl: Duration) -> bool {
        self.state == SessionState::Expired || self.created_at.elapsed() >= ttl
    }

    /// Expire the session, dropping every outstanding request
    pub fn expire(&mut self) {
        self.state = SessionState::Expired;
        self.local_slot = RoleSlot::default();
        self.remote_slot = RoleSlot::default();
        self.local = None;
        self.remote = None;
    }

    fn refresh_state(&mut self) {
        if self.state == SessionState::Expired {
            return;
        }
        self.state = match (&self.local, &self.remote) {
            (Some(_), Some(_)) => SessionState::Active,
            (Some(_), None) | (None, Some(_)) => SessionState::WaitingPeer,
            (None, None) => SessionState::Init,
        };
    }
}

/// Pool of negotiation sessions owned by the relay
#[derive(Debug)]
pub struct NegotiationPool {
    sessions: HashMap<NegotiationId, NegotiationSession>,
    max_sessions: usize,
    ttl: Duration,
}

impl NegotiationPool {
    pub fn new(max_sessions: usize, ttl: Duration) -> Self {
        Self {
            sessions: HashMap::new(),
            max_sessions,
            ttl,
        }
    }

    /// Open a new session; fails while the pool is at capacity
    pub fn open(&mut self, origin: &str) -> Result<NegotiationId, SignalingError> {
        if self.sessions.len() >= self.max_sessions {
            return Err(SignalingError::SessionFull);
        }
        let id = Uuid::new_v4();
        self.sessions.insert(id, NegotiationSession::new(id, origin));
        Ok(id)
    }

    pub fn get(&self, id: &NegotiationId) -> Option<&NegotiationSession> {
        self.sessions.get(id)
    }

    pub fn get_mut(&mut self, id: &NegotiationId) -> Option<&mut NegotiationSession> {
        self.sessions.get_mut(id)
    }

    pub fn remove(&mut self, id: &NegotiationId) -> Option<NegotiationSession> {
        self.sessions.remove(id).map(|mut session| {
            session.expire();
            session
        })
    }

    /// Drop expired sessions, returning how many were removed
    pub fn cleanup(&mut self) -> usize {
        let ttl = self.ttl;
        let before = self.sessions.len();
        self.sessions.retain(|_, session| !session.is_expired(ttl));
        before - self.sessions.len()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Get counts by state
    pub fn state_counts(&self) -> SessionStateCounts {
        let mut counts = SessionStateCounts::default();
        for session in self.sessions.values() {
            match session.state {
                SessionState::Init => counts.init += 1,
                SessionState::WaitingPeer => counts.waiting_peer += 1,
                SessionState::Active => counts.active += 1,
                SessionState::Expired => counts.expired += 1,
            }
        }
        counts
    }
}

/// Session state counts for status reporting
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SessionStateCounts {
    pub init: usize,
    pub waiting_peer: usize,
    pub active: usize,
    pub expired: usize,
}
