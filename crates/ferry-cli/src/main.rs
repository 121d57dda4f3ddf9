//! Ferry CLI: stream a file or URL to a local output through the relay.

#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand, ValueEnum};
use ferry_cli::{run_send, PromptApprover, SendRequest};
use ferry_common::RelayConfig;
use ferry_peer::{LoopbackTransport, PeerTransport};
use ferry_relay::{
    Approver, FileOriginGate, FileSource, HttpSource, PayloadSource, StaticApprover,
};

#[derive(Parser, Debug)]
#[command(name = "ferry")]
#[command(about = "Ferry: peer-to-peer payload transfer through a signaling relay")]
struct Args {
    /// Log level used when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info", env = "FERRY_LOG")]
    log_level: String,

    /// Directory holding the allow-list and pending operation
    #[arg(long, global = true, env = "FERRY_STATE_DIR")]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum TransportKind {
    Loopback,
    Webrtc,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Transfer a payload to the consumer for an origin
    Send {
        /// Read the payload from a local file
        #[arg(long, conflicts_with = "url", required_unless_present = "url")]
        file: Option<PathBuf>,

        /// Fetch the payload from an HTTP(S) URL
        #[arg(long)]
        url: Option<String>,

        /// Load the whole file and send it as one message
        #[arg(long, requires = "file")]
        buffered: bool,

        /// Origin the consumer connects from
        #[arg(long)]
        origin: String,

        /// Where the consumer writes what it receives
        #[arg(short, long)]
        output: PathBuf,

        /// Approve unknown origins without asking
        #[arg(long)]
        auto_approve: bool,

        #[arg(long, value_enum, default_value_t = TransportKind::Loopback)]
        transport: TransportKind,
    },

    /// Manage the origin allow-list
    Origins {
        #[command(subcommand)]
        command: OriginsCommand,
    },

    /// Show version information
    Version,
}

#[derive(Subcommand, Debug)]
enum OriginsCommand {
    /// Print allowed origin patterns
    List,
    /// Allow an origin
    Add { origin: String },
    /// Replace the allow-list; no origins revokes everything
    Reset { origins: Vec<String> },
}

fn build_transport(kind: TransportKind) -> Result<Arc<dyn PeerTransport>> {
    match kind {
        TransportKind::Loopback => Ok(Arc::new(LoopbackTransport::new())),
        #[cfg(feature = "webrtc-transport")]
        TransportKind::Webrtc => Ok(Arc::new(ferry_peer::WebRtcTransport::with_stun())),
        #[cfg(not(feature = "webrtc-transport"))]
        TransportKind::Webrtc => bail!("built without the webrtc-transport feature"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    ferry_common::init_tracing_with_default(&format!(
        "{},hyper=warn,reqwest=warn",
        args.log_level
    ));

    let mut config = RelayConfig::from_env();
    if let Some(dir) = args.state_dir {
        config.state_dir = dir;
    }
    config.validate()?;

    match args.command {
        Command::Send {
            file,
            url,
            buffered,
            origin,
            output,
            auto_approve,
            transport,
        } => {
            let (source, expected_bytes): (Arc<dyn PayloadSource>, Option<u64>) =
                match (file, url) {
                    (Some(path), None) => {
                        let len = tokio::fs::metadata(&path).await?.len();
                        let source = FileSource::new(path, config.chunk_size).buffered(buffered);
                        (Arc::new(source), Some(len))
                    }
                    (None, Some(url)) => (Arc::new(HttpSource::new(&url, config.chunk_size)?), None),
                    _ => bail!("exactly one of --file or --url is required"),
                };
            let approver: Arc<dyn Approver> = if auto_approve {
                Arc::new(StaticApprover(true))
            } else {
                Arc::new(PromptApprover)
            };

            let summary = run_send(SendRequest {
                config,
                origin,
                output: output.clone(),
                source,
                approver,
                transport: build_transport(transport)?,
                expected_bytes,
            })
            .await?;

            println!("Negotiation: {}", summary.negotiation);
            println!("Mode:        {}", summary.sent.mode);
            println!("Chunks:      {}", summary.sent.chunks);
            println!("Bytes:       {}", summary.received.bytes);
            println!("SHA-256:     {}", summary.received.sha256);
            println!("Output:      {}", output.display());
            if summary.restarts > 0 {
                println!("Restarts:    {}", summary.restarts);
            }
        }
        Command::Origins { command } => {
            let gate = FileOriginGate::open(&config.state_dir, Arc::new(StaticApprover(false)))?;
            match command {
                OriginsCommand::List => {
                    for pattern in gate.list()? {
                        println!("{}", pattern);
                    }
                }
                OriginsCommand::Add { origin } => {
                    if gate.add(&origin)? {
                        println!("Added {}", origin);
                    } else {
                        println!("{} is already allowed", origin);
                    }
                }
                OriginsCommand::Reset { origins } => {
                    gate.reset(&origins)?;
                    println!("Allow-list now has {} entries", gate.list()?.len());
                }
            }
        }
        Command::Version => {
            println!("ferry {}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
