use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use polar_core::{
    ChannelEvent, CloseChannelRequest, Config, InvoiceRequest, LightningNode, OpenChannelRequest,
};
use polar_nodes::{ChannelEventCallback, LightningFactory};
use serde::Serialize;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[command(name = "polar")]
#[command(author, version, about = "Drive Lightning nodes of a local regtest network")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Configuration file, the per-user config when absent
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Node descriptor (JSON)
    #[arg(long, value_name = "NODE.json")]
    node: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Show node identity and sync state
    Info,
    /// Show on-chain and channel balances
    Balances,
    /// Generate a new on-chain address
    NewAddress,
    /// List open and pending channels
    Channels,
    /// List connected peers
    Peers,
    /// Connect to peers
    Connect {
        /// Peer URIs (pubkey@host:port)
        #[arg(required = true)]
        uris: Vec<String>,
    },
    /// Open a channel
    Open {
        /// Counterparty URI (pubkey@host:port)
        uri: String,
        /// Capacity in satoshis
        sats: u64,
        /// Satoshis pushed to the counterparty
        #[arg(long, value_name = "SATS")]
        push: Option<u64>,
        /// Do not announce the channel
        #[arg(long)]
        private: bool,
    },
    /// Close a channel
    Close {
        /// Channel point (txid:index) or channel id
        channel: String,
        /// Counterparty pubkey
        #[arg(long, value_name = "PUBKEY")]
        counterparty: Option<String>,
        /// Close unilaterally
        #[arg(long)]
        force: bool,
    },
    /// Create an invoice
    Invoice {
        /// Amount in satoshis
        sats: u64,
        /// Invoice description
        #[arg(long, value_name = "TEXT")]
        memo: Option<String>,
        /// Expiry in seconds
        #[arg(long, value_name = "SECS")]
        expiry: Option<u32>,
    },
    /// Pay an invoice
    Pay {
        /// BOLT11 invoice
        invoice: String,
        /// Amount in satoshis for amountless invoices
        #[arg(long, value_name = "SATS")]
        amount: Option<u64>,
    },
    /// Decode an invoice
    Decode {
        /// BOLT11 invoice
        invoice: String,
    },
    /// Print channel events until interrupted
    Events,
}

fn setup_logging(verbosity: u8) {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    // stdout carries the JSON output.
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::new(filter))
        .init();
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    let config = match path {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    config.validate()?;
    Ok(config)
}

fn load_node(path: &PathBuf) -> Result<LightningNode> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read node descriptor {}", path.display()))?;
    serde_json::from_str(&text)
        .with_context(|| format!("invalid node descriptor {}", path.display()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let config = load_config(cli.config.as_ref())?;
    let node = load_node(&cli.node)?;
    let factory = LightningFactory::new(config)?;
    let service = factory.get_service(&node);
    tracing::info!(node = %node.name, implementation = %node.implementation, "using node");

    match cli.command {
        Commands::Info => print_json(&service.get_info(&node).await?),
        Commands::Balances => print_json(&service.get_balances(&node).await?),
        Commands::NewAddress => print_json(&service.get_new_address(&node).await?),
        Commands::Channels => print_json(&service.get_channels(&node).await?),
        Commands::Peers => print_json(&service.get_peers(&node).await?),
        Commands::Connect { uris } => print_json(&service.connect_peers(&node, &uris).await?),
        Commands::Open {
            uri,
            sats,
            push,
            private,
        } => {
            let request = OpenChannelRequest {
                to_rpc_url: uri,
                amount: sats,
                push_amount: push,
                is_private: private,
            };
            print_json(&service.open_channel(&node, &request).await?)
        }
        Commands::Close {
            channel,
            counterparty,
            force,
        } => {
            let request = CloseChannelRequest {
                channel_point: channel,
                counterparty,
            };
            if force {
                service.force_close_channel(&node, &request).await?;
            } else {
                service.close_channel(&node, &request).await?;
            }
            print_json(&serde_json::json!({ "closing": request.channel_point, "force": force }))
        }
        Commands::Invoice { sats, memo, expiry } => {
            let request = InvoiceRequest {
                amount: sats,
                memo,
                expiry_secs: expiry,
            };
            let invoice = service.create_invoice(&node, &request).await?;
            print_json(&serde_json::json!({ "payment_request": invoice }))
        }
        Commands::Pay { invoice, amount } => {
            print_json(&service.pay_invoice(&node, &invoice, amount).await?)
        }
        Commands::Decode { invoice } => print_json(&service.decode_invoice(&node, &invoice).await?),
        Commands::Events => {
            let callback: ChannelEventCallback = Arc::new(|event: ChannelEvent| {
                match serde_json::to_string(&serde_json::json!({ "event": event })) {
                    Ok(line) => println!("{line}"),
                    Err(e) => tracing::warn!(error = %e, "failed to print channel event"),
                }
            });
            service.subscribe_channel_events(&node, callback).await?;
            eprintln!("Listening for channel events on '{}', press Ctrl-C to stop", node.name);

            tokio::signal::ctrl_c().await?;
            factory.shutdown().await;
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => match e.downcast_ref::<polar_core::Error>() {
            Some(unsupported @ polar_core::Error::Unsupported { .. }) => {
                eprintln!("{unsupported}");
                ExitCode::from(2)
            }
            _ => {
                eprintln!("Error: {e:#}");
                ExitCode::FAILURE
            }
        },
    }
}
