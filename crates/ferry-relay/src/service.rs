//! The relay service.
//!
//! A single task owns every piece of relay state and handles events one at a
//! time, in arrival order. Other contexts reach it only through a
//! [`RelayHandle`] (user actions, external connections) or a [`RelayLink`]
//! (the streaming helper's `start` and keep-alive).
//!
//! A helper counts as running until the last copy of its link is dropped;
//! user actions are refused until then.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ferry_common::{
    port_pair, Error, HostChannel, HostSignal, Payload, Port, RelayConfig, Result, Role,
    SignalingMessage,
};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::auth::{normalize_origin, OriginGate, PendingOperation};
use crate::host::{ConsumerLink, ContextHost, HelperLink};
use crate::keepalive::IdleMonitor;
use crate::session::{NegotiationId, SessionStateCounts};
use crate::signaling::{SignalingError, SignalingRelay};
use crate::source::PayloadSource;
use crate::transfer::{TrackedStream, TransferId, TransferOutcome, TransferRecord, TransferState};

const EVENT_CAPACITY: usize = 64;
const CLEANUP_INTERVAL: Duration = Duration::from_secs(10);

/// Result of a user-triggered action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionOutcome {
    /// Helper and consumer created; negotiation under way.
    Started(NegotiationId),
    /// Origin approved; the relay exits with [`RelayExit::Restart`] and
    /// resumes the action on its next start.
    RestartRequired,
    /// Origin not approved. Nothing was started.
    Denied,
}

/// Why [`RelayService::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayExit {
    Shutdown,
    Restart,
    /// Idle timeout elapsed with no events.
    Reclaimed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayStatus {
    pub negotiations: usize,
    pub sessions: SessionStateCounts,
    /// Origin currently allowed to connect, if any.
    pub accepting: Option<String>,
    /// A streaming helper still holds its link.
    pub helper_active: bool,
    pub transfer_active: bool,
    pub transfers_completed: u64,
    pub keepalives: u64,
    pub last_transfer: Option<TransferRecord>,
}

pub(crate) enum HostReply {
    Payload(Payload),
    Ack,
}

pub(crate) enum RelayEvent {
    Action {
        origin: String,
        reply: oneshot::Sender<Result<ActionOutcome>>,
    },
    ConnectExternal {
        origin: String,
        reply: oneshot::Sender<Result<Port>>,
    },
    Message {
        negotiation: NegotiationId,
        role: Role,
        message: SignalingMessage,
    },
    PortClosed {
        negotiation: NegotiationId,
        role: Role,
    },
    Host {
        signal: HostSignal,
        reply: oneshot::Sender<Result<HostReply>>,
    },
    TransferEnded {
        transfer: TransferId,
        outcome: TransferOutcome,
    },
    HelperExited {
        negotiation: NegotiationId,
    },
    Status {
        reply: oneshot::Sender<RelayStatus>,
    },
    Shutdown,
}

async fn call<T>(
    tx: &mpsc::Sender<RelayEvent>,
    make: impl FnOnce(oneshot::Sender<T>) -> RelayEvent,
) -> Result<T> {
    let (reply, rx) = oneshot::channel();
    tx.send(make(reply))
        .await
        .map_err(|_| Error::port_closed("relay is not running"))?;
    rx.await
        .map_err(|_| Error::port_closed("relay stopped before replying"))
}

/// Cloneable entry point into a running relay.
#[derive(Debug, Clone)]
pub struct RelayHandle {
    tx: mpsc::Sender<RelayEvent>,
}

impl RelayHandle {
    /// User action for `origin` (the toolbar click).
    pub async fn handle_action(&self, origin: &str) -> Result<ActionOutcome> {
        call(&self.tx, |reply| RelayEvent::Action {
            origin: origin.to_string(),
            reply,
        })
        .await?
    }

    /// Open the consumer's signaling port (role `local`).
    pub async fn connect_external(&self, origin: &str) -> Result<Port> {
        call(&self.tx, |reply| RelayEvent::ConnectExternal {
            origin: origin.to_string(),
            reply,
        })
        .await?
    }

    pub async fn status(&self) -> Result<RelayStatus> {
        call(&self.tx, |reply| RelayEvent::Status { reply }).await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.tx
            .send(RelayEvent::Shutdown)
            .await
            .map_err(|_| Error::port_closed("relay is not running"))
    }

    pub fn link(&self) -> RelayLink {
        RelayLink {
            tx: self.tx.clone(),
            _guard: None,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Reports a helper's exit once every copy of its link is gone.
#[derive(Debug)]
struct HelperGuard {
    negotiation: NegotiationId,
    tx: mpsc::Sender<RelayEvent>,
}

impl Drop for HelperGuard {
    fn drop(&mut self) {
        let event = RelayEvent::HelperExited {
            negotiation: self.negotiation,
        };
        match self.tx.try_send(event) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(event)) => {
                let tx = self.tx.clone();
                match tokio::runtime::Handle::try_current() {
                    Ok(runtime) => {
                        runtime.spawn(async move {
                            let _ = tx.send(event).await;
                        });
                    }
                    Err(_) => warn!(
                        "Relay busy; exit of helper for {} not reported",
                        self.negotiation
                    ),
                }
            }
        }
    }
}

/// The streaming helper's in-process channel to the relay.
#[derive(Debug, Clone)]
pub struct RelayLink {
    tx: mpsc::Sender<RelayEvent>,
    _guard: Option<Arc<HelperGuard>>,
}

impl RelayLink {
    async fn signal(&self, signal: HostSignal) -> Result<HostReply> {
        call(&self.tx, |reply| RelayEvent::Host { signal, reply }).await?
    }
}

#[async_trait]
impl HostChannel for RelayLink {
    async fn start(&self) -> Result<Payload> {
        match self.signal(HostSignal::Start).await? {
            HostReply::Payload(payload) => Ok(payload),
            HostReply::Ack => Err(Error::internal("relay acknowledged start without a payload")),
        }
    }

    async fn keep_alive(&self) -> Result<()> {
        self.signal(HostSignal::KeepAlive).await.map(|_| ())
    }
}

/// Negotiation currently accepting an external connection.
#[derive(Debug)]
struct Acceptance {
    negotiation: NegotiationId,
    origin: String,
}

pub struct RelayService {
    gate: Arc<dyn OriginGate>,
    host: Arc<dyn ContextHost>,
    source: Arc<dyn PayloadSource>,
    signaling: SignalingRelay,
    transfer: TransferState,
    idle: IdleMonitor,
    accepting: Option<Acceptance>,
    /// Negotiation whose helper still holds its link.
    helper: Option<NegotiationId>,
    restart_requested: bool,
    events_tx: mpsc::Sender<RelayEvent>,
    events_rx: mpsc::Receiver<RelayEvent>,
}

impl RelayService {
    pub fn new(
        config: RelayConfig,
        gate: Arc<dyn OriginGate>,
        host: Arc<dyn ContextHost>,
        source: Arc<dyn PayloadSource>,
    ) -> Result<Self> {
        config.validate()?;
        let (events_tx, events_rx) = mpsc::channel(EVENT_CAPACITY);
        Ok(Self {
            gate,
            host,
            source,
            signaling: SignalingRelay::new(
                config.max_negotiations,
                config.negotiation_ttl,
                config.max_description_bytes,
            ),
            transfer: TransferState::new(),
            idle: IdleMonitor::new(config.idle_timeout),
            accepting: None,
            helper: None,
            restart_requested: false,
            events_tx,
            events_rx,
        })
    }

    pub fn handle(&self) -> RelayHandle {
        RelayHandle {
            tx: self.events_tx.clone(),
        }
    }

    fn helper_link(&self, negotiation: NegotiationId) -> RelayLink {
        let guard = HelperGuard {
            negotiation,
            tx: self.events_tx.clone(),
        };
        RelayLink {
            tx: self.events_tx.clone(),
            _guard: Some(Arc::new(guard)),
        }
    }

    /// Resume an operation persisted before an approval-triggered restart.
    pub async fn resume_pending(&mut self) -> Result<Option<ActionOutcome>> {
        let Some(op) = self.gate.consume_pending_operation()? else {
            return Ok(None);
        };
        info!(
            "Resuming operation for {} requested at {}",
            op.origin, op.requested_at
        );
        self.handle_action(op.origin).await.map(Some)
    }

    pub async fn run(mut self) -> RelayExit {
        info!(
            "Relay running (idle timeout {:?}, source {})",
            self.idle.timeout(),
            self.source.describe()
        );
        let mut cleanup_interval = tokio::time::interval(CLEANUP_INTERVAL);
        cleanup_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if self.restart_requested {
                info!("Relay restarting to apply allow-list changes");
                self.teardown().await;
                return RelayExit::Restart;
            }

            let deadline = self.idle.deadline();
            tokio::select! {
                event = self.events_rx.recv() => {
                    let Some(event) = event else {
                        return RelayExit::Shutdown;
                    };
                    if let RelayEvent::Shutdown = event {
                        info!("Relay shutting down");
                        self.teardown().await;
                        return RelayExit::Shutdown;
                    }
                    self.idle.touch();
                    self.handle_event(event).await;
                }
                _ = tokio::time::sleep_until(deadline) => {
                    if self.transfer.is_active() {
                        warn!("Relay idle for {:?} with a transfer in progress; reclaiming", self.idle.idle_for());
                    } else {
                        info!("Relay idle for {:?}; reclaiming", self.idle.idle_for());
                    }
                    self.teardown().await;
                    return RelayExit::Reclaimed;
                }
                _ = cleanup_interval.tick() => {
                    self.cleanup();
                }
            }
        }
    }

    async fn handle_event(&mut self, event: RelayEvent) {
        match event {
            RelayEvent::Action { origin, reply } => {
                let outcome = self.handle_action(origin).await;
                let _ = reply.send(outcome);
            }
            RelayEvent::ConnectExternal { origin, reply } => {
                let _ = reply.send(self.connect_external(&origin));
            }
            RelayEvent::Message {
                negotiation,
                role,
                message,
            } => self.on_port_message(negotiation, role, message),
            RelayEvent::PortClosed { negotiation, role } => {
                self.on_port_closed(negotiation, role)
            }
            RelayEvent::Host {
                signal: HostSignal::Start,
                reply,
            } => {
                let payload = self.start_transfer().await;
                let _ = reply.send(payload.map(HostReply::Payload));
            }
            RelayEvent::Host {
                signal: HostSignal::KeepAlive,
                reply,
            } => {
                self.idle.record_keepalive();
                self.transfer.record_keepalive();
                let _ = reply.send(Ok(HostReply::Ack));
            }
            RelayEvent::TransferEnded { transfer, outcome } => {
                self.transfer.finish(transfer, outcome);
            }
            RelayEvent::HelperExited { negotiation } => {
                if self.helper == Some(negotiation) {
                    debug!("Helper for negotiation {} exited", negotiation);
                    self.helper = None;
                }
            }
            RelayEvent::Status { reply } => {
                let _ = reply.send(self.status());
            }
            RelayEvent::Shutdown => {}
        }
    }

    async fn handle_action(&mut self, origin: String) -> Result<ActionOutcome> {
        let origin = normalize_origin(&origin)?;

        if let Some(active) = self.transfer.active() {
            return Err(Error::contention(format!("{} in progress", active.id)));
        }
        if let Some(acc) = &self.accepting {
            return Err(Error::contention(format!(
                "negotiation {} for {} is active",
                acc.negotiation, acc.origin
            )));
        }
        if let Some(negotiation) = self.helper {
            return Err(Error::contention(format!(
                "helper for negotiation {negotiation} is still running"
            )));
        }

        if self.host.has_helper().await {
            info!("Closing leftover helper context");
            if let Err(e) = self.host.close_helper().await {
                warn!("Failed to close helper context: {}", e);
            }
        }

        if !self.gate.is_authorized(&origin) {
            return self.elevate(origin).await;
        }
        self.begin_negotiation(origin).await
    }

    async fn elevate(&mut self, origin: String) -> Result<ActionOutcome> {
        info!("{} is not on the allow-list; requesting authorization", origin);
        match self.gate.request_authorization(&origin).await {
            Ok(true) => {
                self.gate
                    .persist_pending_operation(&PendingOperation::new(origin.clone()))?;
                self.restart_requested = true;
                info!("{} approved; restart required", origin);
                Ok(ActionOutcome::RestartRequired)
            }
            Ok(false) => {
                self.clear_pending();
                warn!("Authorization for {} denied", origin);
                Ok(ActionOutcome::Denied)
            }
            Err(e) => {
                self.clear_pending();
                warn!("Authorization for {} failed: {}", origin, e);
                Ok(ActionOutcome::Denied)
            }
        }
    }

    async fn begin_negotiation(&mut self, origin: String) -> Result<ActionOutcome> {
        let negotiation = self.signaling.open(&origin)?;

        let (helper_port, relay_port) = port_pair(Role::Remote);
        if let Err(e) = self.attach_port(negotiation, relay_port) {
            self.signaling.close(&negotiation);
            return Err(e);
        }
        self.accepting = Some(Acceptance {
            negotiation,
            origin: origin.clone(),
        });

        let helper = HelperLink {
            negotiation,
            port: helper_port,
            host: self.helper_link(negotiation),
        };
        if let Err(e) = self.host.create_helper(helper).await {
            error!("Failed to create helper context: {}", e);
            self.abort_negotiation(negotiation);
            return Err(e);
        }
        self.helper = Some(negotiation);

        let consumer = ConsumerLink {
            negotiation,
            origin,
            relay: self.handle(),
        };
        if let Err(e) = self.host.inject_consumer(consumer).await {
            error!("Failed to inject consumer: {}", e);
            self.abort_negotiation(negotiation);
            if let Err(e) = self.host.close_helper().await {
                warn!("Failed to close helper context: {}", e);
            }
            self.helper = None;
            return Err(e);
        }

        Ok(ActionOutcome::Started(negotiation))
    }

    fn connect_external(&mut self, origin: &str) -> Result<Port> {
        let origin = normalize_origin(origin)?;
        let negotiation = match &self.accepting {
            Some(acc) if acc.origin == origin && self.gate.is_authorized(&origin) => {
                acc.negotiation
            }
            _ => {
                warn!("Rejected external connection from {}", origin);
                return Err(Error::denied(format!(
                    "not accepting connections from {origin}"
                )));
            }
        };

        let (endpoint, relay_side) = port_pair(Role::Local);
        self.attach_port(negotiation, relay_side)?;
        info!(
            "Accepted external connection from {} for negotiation {}",
            origin, negotiation
        );
        Ok(endpoint)
    }

    /// Register the relay half of a port and pump its messages into the
    /// event queue, followed by a close notification.
    fn attach_port(&mut self, negotiation: NegotiationId, port: Port) -> Result<()> {
        let role = port.role();
        let (outbound, mut inbound) = port.into_parts();
        self.signaling.connect(&negotiation, role, outbound)?;

        let events = self.events_tx.clone();
        tokio::spawn(async move {
            while let Some(message) = inbound.recv().await {
                let event = RelayEvent::Message {
                    negotiation,
                    role,
                    message,
                };
                if events.send(event).await.is_err() {
                    return;
                }
            }
            let _ = events
                .send(RelayEvent::PortClosed { negotiation, role })
                .await;
        });
        Ok(())
    }

    fn on_port_message(&mut self, negotiation: NegotiationId, role: Role, message: SignalingMessage) {
        match message {
            SignalingMessage::Description {
                role: described,
                sdp,
            } => {
                if described != role {
                    warn!(
                        "{} endpoint published a {} description; dropped",
                        role, described
                    );
                    return;
                }
                if let Err(e) = self.signaling.forward(&negotiation, role, &sdp) {
                    warn!("Dropped {} description for {}: {}", role, negotiation, e);
                }
            }
            SignalingMessage::Request(tag) => {
                let wanted = tag.role();
                if wanted == role {
                    warn!("{} endpoint asked for its own description; ignored", role);
                    return;
                }
                let waiter = match self.signaling.request(&negotiation, wanted) {
                    Ok(waiter) => waiter,
                    Err(e) => {
                        warn!("Rejected request from {} endpoint: {}", role, e);
                        return;
                    }
                };
                let Some(outbound) = self.signaling.outbound(&negotiation, role) else {
                    debug!("{} endpoint is gone; request dropped", role);
                    return;
                };
                tokio::spawn(async move {
                    match waiter.await {
                        Ok(sdp) => {
                            let message = SignalingMessage::description(wanted, sdp);
                            if outbound.send(message).await.is_err() {
                                debug!("{} endpoint left before the {} description arrived", role, wanted);
                            }
                        }
                        Err(e) => debug!("{}", e),
                    }
                });
            }
        }
    }

    fn on_port_closed(&mut self, negotiation: NegotiationId, role: Role) {
        match self.signaling.disconnect(&negotiation, role) {
            Ok(_) => {}
            Err(SignalingError::SessionNotFound) => {
                debug!("{} port closed after negotiation {} ended", role, negotiation);
                return;
            }
            Err(e) => {
                warn!("Failed to detach {} endpoint: {}", role, e);
                return;
            }
        }

        // Without the helper the negotiation cannot complete.
        let finished = role == Role::Remote
            || self
                .signaling
                .session(&negotiation)
                .is_some_and(|s| s.connected_peers() == 0);
        if finished {
            info!("{} endpoint left negotiation {}; closing it", role, negotiation);
            self.abort_negotiation(negotiation);
        }
    }

    async fn start_transfer(&mut self) -> Result<Payload> {
        if let Some(active) = self.transfer.active() {
            return Err(Error::contention(format!("{} already in progress", active.id)));
        }

        let payload = match self.source.fetch().await {
            Ok(payload) => payload,
            Err(e) => {
                error!("Failed to fetch payload from {}: {}", self.source.describe(), e);
                return Err(e);
            }
        };
        let id = self.transfer.begin(payload.mode())?;

        // Signaling is done; nobody else may connect.
        if let Some(acc) = self.accepting.take() {
            self.signaling.close(&acc.negotiation);
        }
        self.clear_pending();

        Ok(match payload {
            Payload::Buffer(data) => {
                let outcome = TransferOutcome::Completed {
                    chunks: 1,
                    bytes: data.len() as u64,
                };
                self.transfer.finish(id, outcome);
                Payload::Buffer(data)
            }
            Payload::Stream(stream) => {
                let events = self.events_tx.clone();
                let tracked = TrackedStream::new(stream, move |outcome| {
                    let event = RelayEvent::TransferEnded {
                        transfer: id,
                        outcome,
                    };
                    if events.try_send(event).is_err() {
                        warn!("Relay unavailable; outcome of {} dropped", id);
                    }
                });
                Payload::Stream(Box::pin(tracked))
            }
        })
    }

    fn abort_negotiation(&mut self, negotiation: NegotiationId) {
        self.signaling.close(&negotiation);
        if self
            .accepting
            .as_ref()
            .is_some_and(|acc| acc.negotiation == negotiation)
        {
            self.accepting = None;
        }
    }

    fn clear_pending(&self) {
        if let Err(e) = self.gate.clear_pending_operation() {
            warn!("Failed to clear pending operation: {}", e);
        }
    }

    fn cleanup(&mut self) {
        let cleaned = self.signaling.cleanup();
        if cleaned > 0 {
            info!("Cleaned up {} expired negotiations", cleaned);
        }
        if let Some(acc) = &self.accepting {
            if self.signaling.session(&acc.negotiation).is_none() {
                self.accepting = None;
            }
        }
    }

    async fn teardown(&mut self) {
        if let Some(acc) = self.accepting.take() {
            self.signaling.close(&acc.negotiation);
        }
        if self.restart_requested && self.host.has_helper().await {
            if let Err(e) = self.host.close_helper().await {
                warn!("Failed to close helper context: {}", e);
            }
        }
    }

    fn status(&self) -> RelayStatus {
        RelayStatus {
            negotiations: self.signaling.active_negotiations(),
            sessions: self.signaling.state_counts(),
            accepting: self.accepting.as_ref().map(|acc| acc.origin.clone()),
            helper_active: self.helper.is_some(),
            transfer_active: self.transfer.is_active(),
            transfers_completed: self.transfer.completed(),
            keepalives: self.idle.keepalives(),
            last_transfer: self.transfer.last().cloned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemorySource;
    use bytes::Bytes;
    use futures_util::StreamExt;
    use std::collections::HashSet;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemoryGate {
        allowed: Mutex<HashSet<String>>,
        approve: bool,
        pending: Mutex<Option<PendingOperation>>,
    }

    impl MemoryGate {
        fn allowing(origin: &str) -> Self {
            let gate = Self::default();
            gate.allowed.lock().unwrap().insert(origin.to_string());
            gate
        }

        fn approving(approve: bool) -> Self {
            Self {
                approve,
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl OriginGate for MemoryGate {
        fn is_authorized(&self, origin: &str) -> bool {
            self.allowed.lock().unwrap().contains(origin)
        }

        async fn request_authorization(&self, origin: &str) -> Result<bool> {
            if self.approve {
                self.allowed.lock().unwrap().insert(origin.to_string());
            }
            Ok(self.approve)
        }

        fn persist_pending_operation(&self, op: &PendingOperation) -> Result<()> {
            *self.pending.lock().unwrap() = Some(op.clone());
            Ok(())
        }

        fn consume_pending_operation(&self) -> Result<Option<PendingOperation>> {
            Ok(self.pending.lock().unwrap().take())
        }

        fn clear_pending_operation(&self) -> Result<()> {
            *self.pending.lock().unwrap() = None;
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingHost {
        helper: Mutex<Option<HelperLink>>,
        consumers: Mutex<Vec<ConsumerLink>>,
        closed: Mutex<usize>,
    }

    impl RecordingHost {
        fn take_helper(&self) -> HelperLink {
            self.helper.lock().unwrap().take().unwrap()
        }
    }

    #[async_trait]
    impl ContextHost for RecordingHost {
        async fn has_helper(&self) -> bool {
            self.helper.lock().unwrap().is_some()
        }

        async fn create_helper(&self, link: HelperLink) -> Result<()> {
            *self.helper.lock().unwrap() = Some(link);
            Ok(())
        }

        async fn close_helper(&self) -> Result<()> {
            *self.helper.lock().unwrap() = None;
            *self.closed.lock().unwrap() += 1;
            Ok(())
        }

        async fn inject_consumer(&self, link: ConsumerLink) -> Result<()> {
            self.consumers.lock().unwrap().push(link);
            Ok(())
        }
    }

    const ORIGIN: &str = "https://a.test";

    fn chunks(n: usize) -> MemorySource {
        MemorySource::Chunks((0..n).map(|i| Bytes::from(vec![i as u8; 8])).collect())
    }

    fn spawn_relay(
        gate: Arc<MemoryGate>,
        host: Arc<RecordingHost>,
        source: MemorySource,
    ) -> (RelayHandle, tokio::task::JoinHandle<RelayExit>) {
        let service =
            RelayService::new(RelayConfig::default(), gate, host, Arc::new(source)).unwrap();
        let handle = service.handle();
        (handle, tokio::spawn(service.run()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_reclaimed_when_idle() {
        let (_handle, task) = spawn_relay(
            Arc::new(MemoryGate::default()),
            Arc::new(RecordingHost::default()),
            chunks(1),
        );
        let started = tokio::time::Instant::now();
        assert_eq!(task.await.unwrap(), RelayExit::Reclaimed);
        assert!(started.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_defers_reclamation() {
        let (handle, task) = spawn_relay(
            Arc::new(MemoryGate::default()),
            Arc::new(RecordingHost::default()),
            chunks(1),
        );
        let link = handle.link();
        let started = tokio::time::Instant::now();

        for _ in 0..5 {
            tokio::time::sleep(Duration::from_secs(20)).await;
            link.keep_alive().await.unwrap();
        }
        assert!(!task.is_finished());
        assert_eq!(handle.status().await.unwrap().keepalives, 5);

        assert_eq!(task.await.unwrap(), RelayExit::Reclaimed);
        assert!(started.elapsed() >= Duration::from_secs(130));
    }

    #[tokio::test]
    async fn test_denied_origin_starts_nothing() {
        let gate = Arc::new(MemoryGate::approving(false));
        let host = Arc::new(RecordingHost::default());
        let (handle, _task) = spawn_relay(gate.clone(), host.clone(), chunks(1));

        assert_eq!(
            handle.handle_action(ORIGIN).await.unwrap(),
            ActionOutcome::Denied
        );
        let status = handle.status().await.unwrap();
        assert_eq!(status.negotiations, 0);
        assert!(status.accepting.is_none());
        assert!(gate.pending.lock().unwrap().is_none());
        assert!(!host.has_helper().await);
        assert!(host.consumers.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_approval_restarts_and_resumes() {
        let gate = Arc::new(MemoryGate::approving(true));
        let host = Arc::new(RecordingHost::default());
        let (handle, task) = spawn_relay(gate.clone(), host.clone(), chunks(1));

        assert_eq!(
            handle.handle_action("https://a.test/page").await.unwrap(),
            ActionOutcome::RestartRequired
        );
        assert_eq!(task.await.unwrap(), RelayExit::Restart);
        assert_eq!(
            gate.pending.lock().unwrap().as_ref().map(|op| op.origin.as_str()),
            Some(ORIGIN)
        );

        let mut service = RelayService::new(
            RelayConfig::default(),
            gate.clone(),
            host.clone(),
            Arc::new(chunks(1)),
        )
        .unwrap();
        let outcome = service.resume_pending().await.unwrap();
        assert!(matches!(outcome, Some(ActionOutcome::Started(_))));
        assert!(gate.pending.lock().unwrap().is_none());
        assert!(host.has_helper().await);
        assert_eq!(host.consumers.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_authorized_action_wires_both_ports() {
        let host = Arc::new(RecordingHost::default());
        let (handle, _task) =
            spawn_relay(Arc::new(MemoryGate::allowing(ORIGIN)), host.clone(), chunks(1));

        let ActionOutcome::Started(id) = handle.handle_action(ORIGIN).await.unwrap() else {
            panic!("expected negotiation to start");
        };
        let helper = host.take_helper();
        assert_eq!(helper.negotiation, id);
        assert_eq!(helper.port.role(), Role::Remote);

        assert!(matches!(
            handle.connect_external("https://evil.test").await,
            Err(Error::AuthorizationDenied(_))
        ));
        let mut local = handle.connect_external(ORIGIN).await.unwrap();
        assert_eq!(local.role(), Role::Local);
        let status = handle.status().await.unwrap();
        assert!(status.helper_active);
        assert_eq!(
            status.sessions,
            SessionStateCounts {
                active: 1,
                ..Default::default()
            }
        );
        assert!(matches!(
            handle.connect_external(ORIGIN).await,
            Err(Error::Contention(_))
        ));

        // Answer side asks first; the offer arrives afterwards.
        let mut remote = helper.port;
        let asked = tokio::spawn(async move {
            let offer = local.request_description(Role::Remote).await.unwrap();
            local
                .post(SignalingMessage::description(Role::Local, "v=0\r\na=answer\r\n"))
                .await
                .unwrap();
            (offer, local)
        });
        remote
            .post(SignalingMessage::description(Role::Remote, "v=0\r\na=offer\r\n"))
            .await
            .unwrap();
        let (offer, _local) = asked.await.unwrap();
        assert_eq!(offer, "v=0\r\na=offer\r\na=end-of-candidates\r\n");

        let answer = remote.request_description(Role::Local).await.unwrap();
        assert_eq!(answer, "v=0\r\na=answer\r\na=end-of-candidates\r\n");
    }

    #[tokio::test]
    async fn test_second_action_while_negotiating_is_contention() {
        let host = Arc::new(RecordingHost::default());
        let (handle, _task) =
            spawn_relay(Arc::new(MemoryGate::allowing(ORIGIN)), host.clone(), chunks(1));

        handle.handle_action(ORIGIN).await.unwrap();
        assert!(matches!(
            handle.handle_action(ORIGIN).await,
            Err(Error::Contention(_))
        ));
        // The live helper was not torn down.
        assert!(host.has_helper().await);
        assert_eq!(*host.closed.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_action_while_helper_runs_is_contention() {
        let host = Arc::new(RecordingHost::default());
        let (handle, _task) =
            spawn_relay(Arc::new(MemoryGate::allowing(ORIGIN)), host.clone(), chunks(1));

        let ActionOutcome::Started(first) = handle.handle_action(ORIGIN).await.unwrap() else {
            panic!("expected negotiation to start");
        };
        // The helper is done signaling but still holds its link.
        let HelperLink { port, host: link, .. } = host.take_helper();
        drop(port);

        let mut status = handle.status().await.unwrap();
        while status.negotiations > 0 {
            tokio::task::yield_now().await;
            status = handle.status().await.unwrap();
        }
        assert!(status.accepting.is_none());
        assert!(status.helper_active);

        assert!(matches!(
            handle.handle_action(ORIGIN).await,
            Err(Error::Contention(_))
        ));
        assert_eq!(*host.closed.lock().unwrap(), 0);
        link.keep_alive().await.unwrap();

        // Once the helper lets go, the next action starts afresh.
        drop(link);
        while handle.status().await.unwrap().helper_active {
            tokio::task::yield_now().await;
        }
        assert!(matches!(
            handle.handle_action(ORIGIN).await.unwrap(),
            ActionOutcome::Started(next) if next != first
        ));
        assert_eq!(*host.closed.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_helper_leaving_ends_negotiation() {
        let host = Arc::new(RecordingHost::default());
        let (handle, _task) =
            spawn_relay(Arc::new(MemoryGate::allowing(ORIGIN)), host.clone(), chunks(1));

        handle.handle_action(ORIGIN).await.unwrap();
        drop(host.take_helper());

        // PortClosed is queued ahead of later events.
        tokio::task::yield_now().await;
        let mut status = handle.status().await.unwrap();
        while status.negotiations > 0 {
            tokio::task::yield_now().await;
            status = handle.status().await.unwrap();
        }
        assert!(status.accepting.is_none());
        assert_eq!(status.sessions, SessionStateCounts::default());
        assert!(handle.connect_external(ORIGIN).await.is_err());
    }

    #[tokio::test]
    async fn test_start_streams_and_reports_completion() {
        let host = Arc::new(RecordingHost::default());
        let (handle, _task) =
            spawn_relay(Arc::new(MemoryGate::allowing(ORIGIN)), host.clone(), chunks(3));
        handle.handle_action(ORIGIN).await.unwrap();
        let link = host.take_helper().host;

        let Payload::Stream(mut stream) = link.start().await.unwrap() else {
            panic!("expected stream payload");
        };
        let status = handle.status().await.unwrap();
        assert!(status.transfer_active);
        assert_eq!(status.negotiations, 0);
        assert!(status.accepting.is_none());

        assert!(matches!(link.start().await, Err(Error::Contention(_))));
        assert!(matches!(
            handle.handle_action(ORIGIN).await,
            Err(Error::Contention(_))
        ));

        let mut pulled = 0;
        while let Some(chunk) = stream.next().await {
            chunk.unwrap();
            pulled += 1;
            link.keep_alive().await.unwrap();
        }
        assert_eq!(pulled, 3);

        let status = handle.status().await.unwrap();
        assert!(!status.transfer_active);
        assert_eq!(status.transfers_completed, 1);
        let record = status.last_transfer.unwrap();
        assert_eq!(record.outcome, TransferOutcome::Completed { chunks: 3, bytes: 24 });
        assert_eq!(record.keepalives, 3);
    }

    #[tokio::test]
    async fn test_buffer_start_ends_at_handoff() {
        let host = Arc::new(RecordingHost::default());
        let (handle, _task) = spawn_relay(
            Arc::new(MemoryGate::allowing(ORIGIN)),
            host.clone(),
            MemorySource::Buffer(Bytes::from_static(b"whole payload")),
        );
        handle.handle_action(ORIGIN).await.unwrap();
        let link = host.take_helper().host;

        let payload = link.start().await.unwrap();
        assert!(matches!(payload, Payload::Buffer(ref data) if data.len() == 13));
        let status = handle.status().await.unwrap();
        assert!(!status.transfer_active);
        assert_eq!(status.transfers_completed, 1);
    }

    #[tokio::test]
    async fn test_dropped_stream_frees_transfer_slot() {
        let host = Arc::new(RecordingHost::default());
        let (handle, _task) =
            spawn_relay(Arc::new(MemoryGate::allowing(ORIGIN)), host.clone(), chunks(3));
        handle.handle_action(ORIGIN).await.unwrap();
        let link = host.take_helper().host;

        let payload = link.start().await.unwrap();
        drop(payload);

        let status = handle.status().await.unwrap();
        assert!(!status.transfer_active);
        assert!(matches!(
            status.last_transfer.map(|r| r.outcome),
            Some(TransferOutcome::Abandoned { chunks: 0, .. })
        ));
    }

    #[tokio::test]
    async fn test_shutdown() {
        let (handle, task) = spawn_relay(
            Arc::new(MemoryGate::default()),
            Arc::new(RecordingHost::default()),
            chunks(1),
        );
        handle.shutdown().await.unwrap();
        assert_eq!(task.await.unwrap(), RelayExit::Shutdown);
        assert!(handle.status().await.is_err());
    }
}
