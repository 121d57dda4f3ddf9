//! Relay-side bookkeeping for the single in-flight transfer.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use ferry_common::{ByteStream, Error, PayloadMode, Result};
use futures_util::Stream;
use tokio::time::Instant;
use tracing::{info, warn};

/// Identifies one transfer for the lifetime of the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferId(u64);

impl std::fmt::Display for TransferId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "transfer-{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    /// Source exhausted; every chunk was pulled.
    Completed { chunks: u64, bytes: u64 },
    /// Source stream errored.
    Failed { chunks: u64, bytes: u64, error: String },
    /// Consumer dropped the stream before it ended.
    Abandoned { chunks: u64, bytes: u64 },
}

impl TransferOutcome {
    pub fn chunks(&self) -> u64 {
        match self {
            Self::Completed { chunks, .. }
            | Self::Failed { chunks, .. }
            | Self::Abandoned { chunks, .. } => *chunks,
        }
    }

    pub fn bytes(&self) -> u64 {
        match self {
            Self::Completed { bytes, .. }
            | Self::Failed { bytes, .. }
            | Self::Abandoned { bytes, .. } => *bytes,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

#[derive(Debug)]
pub struct ActiveTransfer {
    pub id: TransferId,
    pub mode: PayloadMode,
    pub started_at: Instant,
    pub keepalives: u64,
}

/// Finished transfer summary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRecord {
    pub id: TransferId,
    pub mode: PayloadMode,
    pub outcome: TransferOutcome,
    pub keepalives: u64,
    pub elapsed: Duration,
}

/// At most one transfer is in flight at a time.
#[derive(Debug, Default)]
pub struct TransferState {
    active: Option<ActiveTransfer>,
    next_id: u64,
    last: Option<TransferRecord>,
    completed: u64,
}

impl TransferState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&mut self, mode: PayloadMode) -> Result<TransferId> {
        if let Some(active) = &self.active {
            return Err(Error::contention(format!(
                "{} ({}) still in progress",
                active.id, active.mode
            )));
        }

        self.next_id += 1;
        let id = TransferId(self.next_id);
        self.active = Some(ActiveTransfer {
            id,
            mode,
            started_at: Instant::now(),
            keepalives: 0,
        });
        info!("Started {} in {} mode", id, mode);
        Ok(id)
    }

    pub fn record_keepalive(&mut self) {
        if let Some(active) = &mut self.active {
            active.keepalives += 1;
        }
    }

    /// Close out `id`. Outcomes for anything but the active transfer are
    /// ignored.
    pub fn finish(&mut self, id: TransferId, outcome: TransferOutcome) -> Option<&TransferRecord> {
        match &self.active {
            Some(active) if active.id == id => {}
            _ => {
                warn!("Ignoring outcome for inactive {}", id);
                return None;
            }
        }
        let active = self.active.take()?;

        let record = TransferRecord {
            id,
            mode: active.mode,
            keepalives: active.keepalives,
            elapsed: active.started_at.elapsed(),
            outcome,
        };
        match &record.outcome {
            TransferOutcome::Completed { chunks, bytes } => {
                self.completed += 1;
                info!(
                    "{} completed: {} chunks, {} bytes, {} keep-alives in {:?}",
                    id, chunks, bytes, record.keepalives, record.elapsed
                );
            }
            TransferOutcome::Failed { chunks, error, .. } => {
                warn!("{} failed after {} chunks: {}", id, chunks, error);
            }
            TransferOutcome::Abandoned { chunks, .. } => {
                warn!("{} abandoned after {} chunks", id, chunks);
            }
        }
        self.last = Some(record);
        self.last.as_ref()
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn active(&self) -> Option<&ActiveTransfer> {
        self.active.as_ref()
    }

    pub fn last(&self) -> Option<&TransferRecord> {
        self.last.as_ref()
    }

    pub fn completed(&self) -> u64 {
        self.completed
    }
}

type OutcomeHook = Box<dyn FnOnce(TransferOutcome) + Send>;

/// Wraps a payload stream and reports how it ended, exactly once.
pub struct TrackedStream {
    inner: ByteStream,
    chunks: u64,
    bytes: u64,
    on_end: Option<OutcomeHook>,
}

impl TrackedStream {
    pub fn new(inner: ByteStream, on_end: impl FnOnce(TransferOutcome) + Send + 'static) -> Self {
        Self {
            inner,
            chunks: 0,
            bytes: 0,
            on_end: Some(Box::new(on_end)),
        }
    }

    fn report(&mut self, outcome: TransferOutcome) {
        if let Some(hook) = self.on_end.take() {
            hook(outcome);
        }
    }
}

impl Stream for TrackedStream {
    type Item = Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.on_end.is_none() {
            return Poll::Ready(None);
        }

        match this.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.chunks += 1;
                this.bytes += chunk.len() as u64;
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(err))) => {
                let outcome = TransferOutcome::Failed {
                    chunks: this.chunks,
                    bytes: this.bytes,
                    error: err.to_string(),
                };
                this.report(outcome);
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(None) => {
                let outcome = TransferOutcome::Completed {
                    chunks: this.chunks,
                    bytes: this.bytes,
                };
                this.report(outcome);
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for TrackedStream {
    fn drop(&mut self) {
        let outcome = TransferOutcome::Abandoned {
            chunks: self.chunks,
            bytes: self.bytes,
        };
        self.report(outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{stream, StreamExt};
    use std::sync::{Arc, Mutex};

    fn recorder() -> (
        Arc<Mutex<Vec<TransferOutcome>>>,
        impl FnOnce(TransferOutcome) + Send + 'static,
    ) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, move |outcome| sink.lock().unwrap().push(outcome))
    }

    #[test]
    fn test_single_transfer_at_a_time() {
        let mut state = TransferState::new();
        let id = state.begin(PayloadMode::Stream).unwrap();
        assert!(matches!(
            state.begin(PayloadMode::Buffer),
            Err(Error::Contention(_))
        ));

        state.record_keepalive();
        let record = state
            .finish(id, TransferOutcome::Completed { chunks: 2, bytes: 10 })
            .unwrap();
        assert_eq!(record.keepalives, 1);
        assert!(!state.is_active());
        assert_eq!(state.completed(), 1);
        assert!(state.begin(PayloadMode::Buffer).is_ok());
    }

    #[test]
    fn test_finish_ignores_other_ids() {
        let mut state = TransferState::new();
        let first = state.begin(PayloadMode::Buffer).unwrap();
        state
            .finish(first, TransferOutcome::Completed { chunks: 1, bytes: 1 })
            .unwrap();
        let _second = state.begin(PayloadMode::Stream).unwrap();

        assert!(state
            .finish(first, TransferOutcome::Abandoned { chunks: 0, bytes: 0 })
            .is_none());
        assert!(state.is_active());
    }

    #[tokio::test]
    async fn test_tracked_stream_reports_completion_once() {
        let (seen, hook) = recorder();
        let inner: ByteStream = Box::pin(stream::iter(vec![
            Ok(Bytes::from_static(b"abc")),
            Ok(Bytes::from_static(b"de")),
        ]));
        let mut tracked = TrackedStream::new(inner, hook);

        while let Some(item) = tracked.next().await {
            item.unwrap();
        }
        assert!(tracked.next().await.is_none());
        drop(tracked);

        assert_eq!(
            *seen.lock().unwrap(),
            vec![TransferOutcome::Completed { chunks: 2, bytes: 5 }]
        );
    }

    #[tokio::test]
    async fn test_tracked_stream_reports_error() {
        let (seen, hook) = recorder();
        let inner: ByteStream = Box::pin(stream::iter(vec![
            Ok(Bytes::from_static(b"abc")),
            Err(Error::transfer("source reset")),
        ]));
        let mut tracked = TrackedStream::new(inner, hook);

        assert!(tracked.next().await.unwrap().is_ok());
        assert!(tracked.next().await.unwrap().is_err());
        assert!(tracked.next().await.is_none());

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(matches!(
            &seen[0],
            TransferOutcome::Failed { chunks: 1, bytes: 3, .. }
        ));
    }

    #[tokio::test]
    async fn test_tracked_stream_reports_abandon_on_drop() {
        let (seen, hook) = recorder();
        let inner: ByteStream = Box::pin(stream::iter(vec![
            Ok(Bytes::from_static(b"abc")),
            Ok(Bytes::from_static(b"def")),
        ]));
        let mut tracked = TrackedStream::new(inner, hook);
        tracked.next().await.unwrap().unwrap();
        drop(tracked);

        assert_eq!(
            *seen.lock().unwrap(),
            vec![TransferOutcome::Abandoned { chunks: 1, bytes: 3 }]
        );
    }
}
