//! Runs the relay's helper and consumer contexts as tokio tasks.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use ferry_common::{HostChannel, Result};
use ferry_peer::{
    run_answer_endpoint, run_offer_endpoint, EndpointOptions, PeerTransport, ReceiveReport,
    TransferReport,
};
use ferry_relay::{ConsumerLink, ContextHost, HelperLink, NegotiationId};
use tokio::fs::File;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, Instrument};

/// Final result of one endpoint task.
#[derive(Debug)]
pub enum EndpointReport {
    Helper {
        negotiation: NegotiationId,
        result: Result<TransferReport>,
    },
    Consumer {
        negotiation: NegotiationId,
        result: Result<ReceiveReport>,
    },
}

pub struct TaskHost {
    transport: Arc<dyn PeerTransport>,
    options: EndpointOptions,
    output: PathBuf,
    expected_bytes: Option<u64>,
    helper: Mutex<Option<JoinHandle<()>>>,
    reports: mpsc::UnboundedSender<EndpointReport>,
}

impl TaskHost {
    /// The receiver yields one report per finished endpoint task.
    pub fn new(
        transport: Arc<dyn PeerTransport>,
        options: EndpointOptions,
        output: impl Into<PathBuf>,
        expected_bytes: Option<u64>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<EndpointReport>) {
        let (reports, rx) = mpsc::unbounded_channel();
        let host = Arc::new(Self {
            transport,
            options,
            output: output.into(),
            expected_bytes,
            helper: Mutex::new(None),
            reports,
        });
        (host, rx)
    }
}

#[async_trait]
impl ContextHost for TaskHost {
    async fn has_helper(&self) -> bool {
        self.helper
            .lock()
            .await
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    async fn create_helper(&self, link: HelperLink) -> Result<()> {
        let HelperLink {
            negotiation,
            port,
            host,
        } = link;
        let transport = self.transport.clone();
        let options = self.options.clone();
        let reports = self.reports.clone();
        let host: Arc<dyn HostChannel> = Arc::new(host);

        let task = tokio::spawn(
            async move {
                let result = run_offer_endpoint(transport, port, host, options).await;
                let _ = reports.send(EndpointReport::Helper {
                    negotiation,
                    result,
                });
            }
            .instrument(tracing::info_span!("helper", %negotiation)),
        );

        if let Some(previous) = self.helper.lock().await.replace(task) {
            previous.abort();
        }
        info!("Helper context created for negotiation {}", negotiation);
        Ok(())
    }

    async fn close_helper(&self) -> Result<()> {
        if let Some(task) = self.helper.lock().await.take() {
            task.abort();
            debug!("Helper context closed");
        }
        Ok(())
    }

    async fn inject_consumer(&self, link: ConsumerLink) -> Result<()> {
        let ConsumerLink {
            negotiation,
            origin,
            relay,
        } = link;
        let transport = self.transport.clone();
        let options = self.options.clone();
        let output = self.output.clone();
        let expected = self.expected_bytes;
        let reports = self.reports.clone();

        tokio::spawn(
            async move {
                let result = async {
                    let port = relay.connect_external(&origin).await?;
                    let mut file = File::create(&output).await?;
                    run_answer_endpoint(transport, port, &mut file, expected, options).await
                }
                .await;
                let _ = reports.send(EndpointReport::Consumer {
                    negotiation,
                    result,
                });
            }
            .instrument(tracing::info_span!("consumer", %negotiation)),
        );
        info!("Consumer injected for negotiation {}", negotiation);
        Ok(())
    }
}
