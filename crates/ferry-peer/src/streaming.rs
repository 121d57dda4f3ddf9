//! Payload transfer over the negotiated data channel.
//!
//! Buffer payloads go out as one message. Stream payloads are pulled chunk
//! by chunk; every chunk that is handed to the channel is followed by a
//! keep-alive so the relay is not reclaimed mid-transfer. A heartbeat covers
//! sources that stall between chunks.

use std::time::Duration;

use ferry_common::{Chunk, Error, HostChannel, Payload, PayloadMode, Result};
use futures_util::StreamExt;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, trace};

use crate::negotiation::SessionClosure;
use crate::transport::DataChannel;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReport {
    pub mode: PayloadMode,
    pub chunks: u64,
    pub bytes: u64,
    pub keepalives: u64,
    pub sha256: String,
    /// Filled in by the endpoint once its session has closed.
    pub closure: Option<SessionClosure>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveReport {
    pub chunks: u64,
    pub bytes: u64,
    pub sha256: String,
    pub closure: Option<SessionClosure>,
}

/// Send `payload` over `channel`, pinging `host` as chunks go out.
pub async fn send_payload(
    channel: &dyn DataChannel,
    payload: Payload,
    host: &dyn HostChannel,
    heartbeat: Duration,
) -> Result<TransferReport> {
    let mode = payload.mode();
    let mut hasher = Sha256::new();
    let mut chunks = 0u64;
    let mut bytes = 0u64;
    let mut keepalives = 0u64;

    match payload {
        Payload::Buffer(data) => {
            hasher.update(&data);
            bytes = data.len() as u64;
            chunks = 1;
            channel.send(Chunk::from(data)).await?;
        }
        Payload::Stream(mut stream) => {
            let mut ticker = interval_at(Instant::now() + heartbeat, heartbeat);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    next = stream.next() => match next {
                        Some(Ok(data)) => {
                            if data.is_empty() {
                                continue;
                            }
                            hasher.update(&data);
                            bytes += data.len() as u64;
                            chunks += 1;
                            channel.send(Chunk::from(data)).await?;
                            host.keep_alive().await?;
                            keepalives += 1;
                            ticker.reset();
                            trace!("chunk {} sent ({} bytes total)", chunks, bytes);
                        }
                        Some(Err(e)) => {
                            return Err(Error::transfer(format!(
                                "source failed after {} chunks: {}",
                                chunks, e
                            )));
                        }
                        None => break,
                    },
                    _ = ticker.tick() => {
                        debug!("Source idle, sending heartbeat");
                        host.keep_alive().await?;
                        keepalives += 1;
                    }
                }
            }
        }
    }

    let sha256 = hex::encode(hasher.finalize());
    info!(
        "Sent {} payload: {} chunks, {} bytes, sha256 {}",
        mode, chunks, bytes, sha256
    );
    Ok(TransferReport {
        mode,
        chunks,
        bytes,
        keepalives,
        sha256,
        closure: None,
    })
}

/// Drain `channel` into `writer` until the sender closes it.
pub async fn receive_payload<W>(
    channel: &dyn DataChannel,
    writer: &mut W,
    expected_bytes: Option<u64>,
) -> Result<ReceiveReport>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut hasher = Sha256::new();
    let mut chunks = 0u64;
    let mut bytes = 0u64;

    while let Some(data) = channel.recv().await {
        hasher.update(&data);
        writer.write_all(&data).await?;
        chunks += 1;
        bytes += data.len() as u64;
    }
    writer.flush().await?;

    if let Some(expected) = expected_bytes {
        if expected != bytes {
            return Err(Error::transfer(format!(
                "expected {} bytes, received {}",
                expected, bytes
            )));
        }
    }

    let sha256 = hex::encode(hasher.finalize());
    info!("Received {} chunks, {} bytes, sha256 {}", chunks, bytes, sha256);
    Ok(ReceiveReport {
        chunks,
        bytes,
        sha256,
        closure: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{ChannelState, TransportError};
    use async_trait::async_trait;
    use bytes::Bytes;
    use futures_util::stream;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Send(usize),
        Ping,
    }

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<Call>>,
        inbox: Mutex<VecDeque<Bytes>>,
        fail_pings: bool,
    }

    impl Recorder {
        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }
    }

    struct MockChannel(Arc<Recorder>);

    #[async_trait]
    impl DataChannel for MockChannel {
        fn label(&self) -> &str {
            "transfer"
        }

        fn id(&self) -> u16 {
            0
        }

        fn state(&self) -> ChannelState {
            ChannelState::Open
        }

        async fn wait_open(&self) -> std::result::Result<(), TransportError> {
            Ok(())
        }

        async fn send(&self, chunk: Chunk) -> std::result::Result<(), TransportError> {
            self.0.calls.lock().unwrap().push(Call::Send(chunk.len()));
            Ok(())
        }

        async fn recv(&self) -> Option<Bytes> {
            self.0.inbox.lock().unwrap().pop_front()
        }

        async fn close(&self) -> std::result::Result<(), TransportError> {
            Ok(())
        }
    }

    struct MockHost(Arc<Recorder>);

    #[async_trait]
    impl HostChannel for MockHost {
        async fn start(&self) -> Result<Payload> {
            Err(Error::internal("not used"))
        }

        async fn keep_alive(&self) -> Result<()> {
            if self.0.fail_pings {
                return Err(Error::port_closed("relay gone"));
            }
            self.0.calls.lock().unwrap().push(Call::Ping);
            Ok(())
        }
    }

    fn mocks(recorder: &Arc<Recorder>) -> (MockChannel, MockHost) {
        (MockChannel(recorder.clone()), MockHost(recorder.clone()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_each_chunk_followed_by_keepalive() {
        let recorder = Arc::new(Recorder::default());
        let (channel, host) = mocks(&recorder);
        let chunks = (0..300).map(|_| Bytes::from(vec![7u8; 16 * 1024])).collect();

        let report = send_payload(
            &channel,
            Payload::from_chunks(chunks),
            &host,
            Duration::from_secs(10),
        )
        .await
        .unwrap();

        assert_eq!(report.mode, PayloadMode::Stream);
        assert_eq!(report.chunks, 300);
        assert_eq!(report.bytes, 300 * 16 * 1024);
        assert_eq!(report.keepalives, 300);

        let calls = recorder.calls();
        assert_eq!(calls.len(), 600);
        for pair in calls.chunks(2) {
            assert_eq!(pair, [Call::Send(16 * 1024), Call::Ping]);
        }
    }

    #[tokio::test]
    async fn test_buffer_sent_once_without_keepalive() {
        let recorder = Arc::new(Recorder::default());
        let (channel, host) = mocks(&recorder);
        let data = Bytes::from(vec![1u8; 100_000]);

        let report = send_payload(
            &channel,
            Payload::Buffer(data.clone()),
            &host,
            Duration::from_secs(10),
        )
        .await
        .unwrap();

        assert_eq!(report.mode, PayloadMode::Buffer);
        assert_eq!(report.chunks, 1);
        assert_eq!(report.keepalives, 0);
        assert_eq!(report.sha256, hex::encode(Sha256::digest(&data)));
        assert_eq!(recorder.calls(), vec![Call::Send(100_000)]);
    }

    #[tokio::test]
    async fn test_empty_chunks_skipped() {
        let recorder = Arc::new(Recorder::default());
        let (channel, host) = mocks(&recorder);
        let chunks = vec![
            Bytes::from_static(b"ab"),
            Bytes::new(),
            Bytes::from_static(b"c"),
        ];

        let report = send_payload(
            &channel,
            Payload::from_chunks(chunks),
            &host,
            Duration::from_secs(10),
        )
        .await
        .unwrap();

        assert_eq!(report.chunks, 2);
        assert_eq!(
            recorder.calls(),
            vec![Call::Send(2), Call::Ping, Call::Send(1), Call::Ping]
        );
    }

    #[tokio::test]
    async fn test_source_error_fails_transfer() {
        let recorder = Arc::new(Recorder::default());
        let (channel, host) = mocks(&recorder);
        let items: Vec<Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"ok")),
            Err(Error::transfer("upstream reset")),
        ];
        let payload = Payload::Stream(Box::pin(stream::iter(items)));

        let err = send_payload(&channel, payload, &host, Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transfer(_)));
        assert_eq!(recorder.calls(), vec![Call::Send(2), Call::Ping]);
    }

    #[tokio::test]
    async fn test_failed_keepalive_stops_stream() {
        let recorder = Arc::new(Recorder {
            fail_pings: true,
            ..Recorder::default()
        });
        let (channel, host) = mocks(&recorder);
        let chunks = vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")];

        let result = send_payload(
            &channel,
            Payload::from_chunks(chunks),
            &host,
            Duration::from_secs(10),
        )
        .await;
        assert!(matches!(result, Err(Error::PortClosed(_))));
        assert_eq!(recorder.calls(), vec![Call::Send(1)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_covers_stalled_source() {
        let recorder = Arc::new(Recorder::default());
        let (channel, host) = mocks(&recorder);
        let slow = stream::unfold(0u8, |n| async move {
            if n == 2 {
                return None;
            }
            tokio::time::sleep(Duration::from_secs(25)).await;
            Some((Ok(Bytes::from(vec![n; 4])), n + 1))
        });

        let report = send_payload(
            &channel,
            Payload::Stream(Box::pin(slow)),
            &host,
            Duration::from_secs(10),
        )
        .await
        .unwrap();

        assert_eq!(report.chunks, 2);
        // Two heartbeats during each 25s stall, plus one per chunk.
        assert_eq!(report.keepalives, 6);
    }

    #[tokio::test]
    async fn test_receive_writes_all_chunks() {
        let recorder = Arc::new(Recorder::default());
        recorder
            .inbox
            .lock()
            .unwrap()
            .extend([Bytes::from_static(b"hello "), Bytes::from_static(b"world")]);
        let channel = MockChannel(recorder);
        let mut out = Vec::new();

        let report = receive_payload(&channel, &mut out, Some(11)).await.unwrap();
        assert_eq!(out, b"hello world");
        assert_eq!(report.chunks, 2);
        assert_eq!(report.sha256, hex::encode(Sha256::digest(b"hello world")));
    }

    #[tokio::test]
    async fn test_receive_detects_short_payload() {
        let recorder = Arc::new(Recorder::default());
        recorder
            .inbox
            .lock()
            .unwrap()
            .push_back(Bytes::from_static(b"abc"));
        let channel = MockChannel(recorder);
        let mut out = Vec::new();

        let err = receive_payload(&channel, &mut out, Some(10))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transfer(_)));
    }
}
