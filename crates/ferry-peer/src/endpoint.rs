//! The two peer endpoints as complete tasks: negotiate, open the transfer
//! channel, move the payload, close.

use std::sync::Arc;
use std::time::Duration;

use ferry_common::{Error, HostChannel, Port, RelayConfig, Result, Role};
use tokio::io::AsyncWrite;
use tracing::{error, info};

use crate::negotiation::{negotiate_answer, negotiate_offer, NegotiationOptions, PeerSession};
use crate::streaming::{receive_payload, send_payload, ReceiveReport, TransferReport};
use crate::transport::PeerTransport;

pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct EndpointOptions {
    pub negotiation: NegotiationOptions,
    /// How long to wait for the transfer channel after negotiation.
    pub open_timeout: Duration,
    pub heartbeat: Duration,
}

impl EndpointOptions {
    pub fn from_config(config: &RelayConfig) -> Self {
        Self {
            negotiation: NegotiationOptions::from_config(config),
            open_timeout: DEFAULT_OPEN_TIMEOUT,
            heartbeat: config.keepalive_interval,
        }
    }
}

impl Default for EndpointOptions {
    fn default() -> Self {
        Self::from_config(&RelayConfig::default())
    }
}

/// Streaming helper: offer, wait for the channel, activate the relay and
/// send what it hands back.
pub async fn run_offer_endpoint(
    transport: Arc<dyn PeerTransport>,
    mut port: Port,
    host: Arc<dyn HostChannel>,
    options: EndpointOptions,
) -> Result<TransferReport> {
    info!("Offer endpoint starting over {} transport", transport.name());
    let mut session = negotiate_offer(transport.as_ref(), &mut port, &options.negotiation).await?;

    let result = offer_transfer(&mut session, port, host.as_ref(), &options).await;
    let closure = session.close().await;
    match result {
        Ok(mut report) => {
            report.closure = Some(closure);
            Ok(report)
        }
        Err(e) => {
            error!("Offer endpoint failed: {}", e);
            Err(e)
        }
    }
}

async fn offer_transfer(
    session: &mut PeerSession,
    port: Port,
    host: &dyn HostChannel,
    options: &EndpointOptions,
) -> Result<TransferReport> {
    session.wait_open(options.open_timeout).await?;
    // An open channel means both descriptions were applied; leaving the
    // relay now lets it release the negotiation.
    drop(port);
    let payload = host.start().await?;
    info!("Relay activated, sending {} payload", payload.mode());
    send_payload(session.channel().as_ref(), payload, host, options.heartbeat).await
}

/// Consumer: answer, wait for the channel and write everything received
/// into `writer`.
///
/// The port stays connected until the channel opens: the relay discards
/// an answer whose poster has gone before the helper collected it.
pub async fn run_answer_endpoint<W>(
    transport: Arc<dyn PeerTransport>,
    mut port: Port,
    writer: &mut W,
    expected_bytes: Option<u64>,
    options: EndpointOptions,
) -> Result<ReceiveReport>
where
    W: AsyncWrite + Unpin + Send + ?Sized,
{
    if port.role() != Role::Local {
        return Err(Error::negotiation(format!(
            "answer endpoint needs a {} port, got {}",
            Role::Local,
            port.role()
        )));
    }
    info!("Answer endpoint starting over {} transport", transport.name());
    let mut session =
        negotiate_answer(transport.as_ref(), &mut port, &options.negotiation).await?;

    let opened = session.wait_open(options.open_timeout).await;
    drop(port);
    let result = match opened {
        Ok(()) => receive_payload(session.channel().as_ref(), writer, expected_bytes).await,
        Err(e) => Err(e),
    };
    let closure = session.close().await;
    match result {
        Ok(mut report) => {
            report.closure = Some(closure);
            Ok(report)
        }
        Err(e) => {
            error!("Answer endpoint failed: {}", e);
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackTransport;
    use async_trait::async_trait;
    use bytes::Bytes;
    use ferry_common::{port_pair, Payload, SignalingMessage};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    /// Stores descriptions and answers requests, enough for two endpoints.
    fn mini_relay(mut local: Port, mut remote: Port) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut offer: Option<String> = None;
            let mut answer: Option<String> = None;
            let mut offer_wanted = false;
            let mut answer_wanted = false;
            loop {
                tokio::select! {
                    m = local.recv() => match m {
                        Some(SignalingMessage::Request(_)) => offer_wanted = true,
                        Some(SignalingMessage::Description { sdp, .. }) => answer = Some(sdp),
                        None => return,
                    },
                    m = remote.recv() => match m {
                        Some(SignalingMessage::Request(_)) => answer_wanted = true,
                        Some(SignalingMessage::Description { sdp, .. }) => offer = Some(sdp),
                        None => return,
                    },
                }
                if offer_wanted {
                    if let Some(sdp) = offer.take() {
                        offer_wanted = false;
                        let _ = local.post(SignalingMessage::description(Role::Remote, sdp)).await;
                    }
                }
                if answer_wanted {
                    if let Some(sdp) = answer.take() {
                        answer_wanted = false;
                        let _ = remote.post(SignalingMessage::description(Role::Local, sdp)).await;
                    }
                }
            }
        })
    }

    /// Like `mini_relay`, but drops the consumer's answer when the
    /// consumer leaves before the answer settles, as the real relay does
    /// when a port disconnects.
    fn discarding_relay(mut local: Port, mut remote: Port) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut offer: Option<String> = None;
            let mut answer: Option<String> = None;
            let mut offer_wanted = false;
            let mut answer_wanted = false;
            loop {
                tokio::select! {
                    m = local.recv() => match m {
                        Some(SignalingMessage::Request(_)) => offer_wanted = true,
                        Some(SignalingMessage::Description { sdp, .. }) => {
                            tokio::select! {
                                m = local.recv() => {
                                    if m.is_none() {
                                        return;
                                    }
                                }
                                _ = tokio::time::sleep(Duration::from_millis(50)) => {}
                            }
                            answer = Some(sdp);
                        }
                        None => return,
                    },
                    m = remote.recv() => match m {
                        Some(SignalingMessage::Request(_)) => answer_wanted = true,
                        Some(SignalingMessage::Description { sdp, .. }) => offer = Some(sdp),
                        None => return,
                    },
                }
                if offer_wanted {
                    if let Some(sdp) = offer.take() {
                        offer_wanted = false;
                        let _ = local.post(SignalingMessage::description(Role::Remote, sdp)).await;
                    }
                }
                if answer_wanted {
                    if let Some(sdp) = answer.take() {
                        answer_wanted = false;
                        let _ = remote.post(SignalingMessage::description(Role::Local, sdp)).await;
                    }
                }
            }
        })
    }

    struct FixedHost {
        payload: Mutex<Option<Payload>>,
        pings: AtomicU64,
    }

    #[async_trait]
    impl HostChannel for FixedHost {
        async fn start(&self) -> Result<Payload> {
            self.payload
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| Error::contention("already started"))
        }

        async fn keep_alive(&self) -> Result<()> {
            self.pings.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_stream_between_endpoints() {
        let transport: Arc<dyn PeerTransport> = Arc::new(LoopbackTransport::new());
        let (local, local_relay) = port_pair(Role::Local);
        let (remote, remote_relay) = port_pair(Role::Remote);
        let _relay = mini_relay(local_relay, remote_relay);

        let chunks: Vec<Bytes> = (0..50u8).map(|i| Bytes::from(vec![i; 1024])).collect();
        let host = Arc::new(FixedHost {
            payload: Mutex::new(Some(Payload::from_chunks(chunks))),
            pings: AtomicU64::new(0),
        });

        let consumer_transport = transport.clone();
        let consumer = tokio::spawn(async move {
            let mut out = Vec::new();
            let report = run_answer_endpoint(
                consumer_transport,
                local,
                &mut out,
                Some(50 * 1024),
                EndpointOptions::default(),
            )
            .await;
            (report, out)
        });

        let sent = run_offer_endpoint(transport, remote, host.clone(), EndpointOptions::default())
            .await
            .unwrap();
        let (received, out) = consumer.await.unwrap();
        let received = received.unwrap();

        assert_eq!(sent.chunks, 50);
        assert_eq!(received.bytes, 50 * 1024);
        assert_eq!(sent.sha256, received.sha256);
        assert_eq!(out[1024], 1);
        assert_eq!(host.pings.load(Ordering::SeqCst), 50);
        assert!(sent.closure.unwrap().is_closed());
        assert!(received.closure.unwrap().is_closed());
    }

    #[tokio::test]
    async fn test_consumer_stays_until_answer_is_collected() {
        let transport: Arc<dyn PeerTransport> = Arc::new(LoopbackTransport::new());
        let (local, local_relay) = port_pair(Role::Local);
        let (remote, remote_relay) = port_pair(Role::Remote);
        let _relay = discarding_relay(local_relay, remote_relay);

        let host = Arc::new(FixedHost {
            payload: Mutex::new(Some(Payload::Buffer(Bytes::from_static(b"answered")))),
            pings: AtomicU64::new(0),
        });

        let consumer_transport = transport.clone();
        let consumer = tokio::spawn(async move {
            let mut out = Vec::new();
            let report = run_answer_endpoint(
                consumer_transport,
                local,
                &mut out,
                Some(8),
                EndpointOptions::default(),
            )
            .await;
            (report, out)
        });

        let sent = tokio::time::timeout(
            Duration::from_secs(5),
            run_offer_endpoint(transport, remote, host, EndpointOptions::default()),
        )
        .await
        .unwrap()
        .unwrap();
        let (received, out) = consumer.await.unwrap();
        assert_eq!(sent.bytes, 8);
        assert_eq!(received.unwrap().bytes, 8);
        assert_eq!(out, b"answered");
    }

    #[tokio::test]
    async fn test_answer_endpoint_rejects_wrong_port() {
        let transport: Arc<dyn PeerTransport> = Arc::new(LoopbackTransport::new());
        let (remote, _relay) = port_pair(Role::Remote);
        let mut out = Vec::new();

        let err = run_answer_endpoint(transport, remote, &mut out, None, EndpointOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Negotiation(_)));
    }
}
