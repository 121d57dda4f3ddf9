//! One complete transfer: relay, helper and consumer in this process.
//!
//! An origin that is not yet allowed triggers approval; when approved the
//! relay exits for a restart and the next iteration resumes the persisted
//! operation.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use ferry_common::RelayConfig;
use ferry_peer::{EndpointOptions, PeerTransport, ReceiveReport, TransferReport};
use ferry_relay::{
    ActionOutcome, Approver, FileOriginGate, NegotiationId, PayloadSource, RelayExit,
    RelayService, RelayStatus,
};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::host::{EndpointReport, TaskHost};

/// Approval restarts allowed before giving up.
pub const MAX_RESTARTS: u32 = 3;

pub struct SendRequest {
    pub config: RelayConfig,
    pub origin: String,
    pub output: PathBuf,
    pub source: Arc<dyn PayloadSource>,
    pub approver: Arc<dyn Approver>,
    pub transport: Arc<dyn PeerTransport>,
    pub expected_bytes: Option<u64>,
}

#[derive(Debug)]
pub struct SendSummary {
    pub negotiation: NegotiationId,
    pub sent: TransferReport,
    pub received: ReceiveReport,
    pub restarts: u32,
    pub relay: RelayStatus,
}

pub async fn run_send(request: SendRequest) -> anyhow::Result<SendSummary> {
    let options = EndpointOptions::from_config(&request.config);

    for restarts in 0..=MAX_RESTARTS {
        let gate = Arc::new(
            FileOriginGate::open(&request.config.state_dir, request.approver.clone())
                .context("opening allow-list")?,
        );
        let (host, reports) = TaskHost::new(
            request.transport.clone(),
            options.clone(),
            &request.output,
            request.expected_bytes,
        );
        let mut service = RelayService::new(
            request.config.clone(),
            gate,
            host,
            request.source.clone(),
        )?;
        let handle = service.handle();

        let resumed = service.resume_pending().await?;
        let mut relay = tokio::spawn(service.run());
        let outcome = match resumed {
            Some(outcome) => outcome,
            None => handle.handle_action(&request.origin).await?,
        };

        match outcome {
            ActionOutcome::Started(negotiation) => {
                info!("Negotiation {} started for {}", negotiation, request.origin);
                let (sent, received) = match wait_for_endpoints(reports, &mut relay).await {
                    Ok(reports) => reports,
                    Err(e) => {
                        let _ = handle.shutdown().await;
                        return Err(e);
                    }
                };
                let status = handle.status().await?;
                handle.shutdown().await?;
                let exit = relay.await?;
                info!("Relay stopped ({:?})", exit);

                if sent.sha256 != received.sha256 {
                    bail!(
                        "checksum mismatch: sent {} received {}",
                        sent.sha256,
                        received.sha256
                    );
                }
                return Ok(SendSummary {
                    negotiation,
                    sent,
                    received,
                    restarts,
                    relay: status,
                });
            }
            ActionOutcome::RestartRequired => {
                let exit = relay.await?;
                if exit != RelayExit::Restart {
                    bail!("relay exited with {:?} instead of restarting", exit);
                }
                info!("Restarting relay to resume the transfer");
            }
            ActionOutcome::Denied => {
                let _ = handle.shutdown().await;
                bail!("{} was not approved", request.origin);
            }
        }
    }

    bail!("gave up after {} restarts", MAX_RESTARTS)
}

async fn wait_for_endpoints(
    mut reports: mpsc::UnboundedReceiver<EndpointReport>,
    relay: &mut tokio::task::JoinHandle<RelayExit>,
) -> anyhow::Result<(TransferReport, ReceiveReport)> {
    let mut sent = None;
    let mut received = None;

    while sent.is_none() || received.is_none() {
        tokio::select! {
            report = reports.recv() => match report {
                Some(EndpointReport::Helper { result, .. }) => {
                    sent = Some(result.context("streaming helper failed")?);
                }
                Some(EndpointReport::Consumer { result, .. }) => {
                    received = Some(result.context("consumer failed")?);
                }
                None => bail!("endpoint tasks went away"),
            },
            exit = &mut *relay => {
                let exit = exit?;
                warn!("Relay exited ({:?}) before the transfer finished", exit);
                bail!("relay exited early: {:?}", exit);
            }
        }
    }

    match (sent, received) {
        (Some(sent), Some(received)) => Ok((sent, received)),
        _ => Err(anyhow!("transfer reports missing")),
    }
}
