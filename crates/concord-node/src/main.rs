//! # Concord Node
//!
//! Runs one cluster member over UDP. Joins (or forms) a cluster on startup,
//! keeps membership up to date, and leaves gracefully on Ctrl-C.
//!
//! ## Example
//! ```text
//! concord-node --bind 127.0.0.1:5701 --member 127.0.0.1:5702
//! concord-node --bind 127.0.0.1:5702 --member 127.0.0.1:5701 --lite
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use concord_common::constants::attributes::NODE_NAME;
use concord_node::{Address, ClusterService};
use concord_node::config::{DiscoveryMode, NodeConfig};
use concord_node::transport::UdpTransport;

/// Concord - cluster membership node
#[derive(Parser, Debug)]
#[command(name = "concord-node")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config/concord.toml")]
    config: String,

    /// Bind address (overrides config)
    #[arg(short, long, env = "CONCORD_BIND")]
    bind: Option<String>,

    /// Static seed member, repeatable (overrides config)
    #[arg(short, long = "member")]
    members: Vec<Address>,

    /// Node name published with the local member
    #[arg(short, long, env = "CONCORD_NODE_NAME")]
    name: Option<String>,

    /// Join as a lite member (never master)
    #[arg(long, default_value = "false")]
    lite: bool,

    /// Discover peers by broadcasting to this address
    #[arg(long, env = "CONCORD_BROADCAST")]
    broadcast: Option<std::net::SocketAddr>,

    /// Seconds between membership snapshots in the log
    #[arg(long, default_value = "30")]
    report_interval: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "LOG_LEVEL")]
    log_level: String,

    /// Enable JSON logging output
    #[arg(long, default_value = "false")]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    init_logging(&args.log_level, args.json_logs)?;

    info!(version = env!("CARGO_PKG_VERSION"), "Starting Concord node");

    let config = load_config(&args)?;
    info!(
        path = %args.config,
        bind = %config.bind_addr,
        lite = config.cluster.lite_member,
        "Configuration loaded"
    );

    let bind = config.bind_socket_addr()?;
    let advertise = config.advertise_socket_addr()?;
    let (transport, inbound) = UdpTransport::bind(
        bind,
        advertise,
        config.cluster.discovery.broadcast.target,
    )
    .await
    .context("Failed to bind cluster transport")?;

    let service = ClusterService::new(config.cluster, transport, inbound)
        .context("Invalid cluster configuration")?;

    let state = tokio::select! {
        result = service.start() => result.context("Failed to join cluster")?,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received during startup");
            service.shutdown().await;
            return Ok(());
        }
    };
    info!(?state, address = %service.local_address(), "Node is up");

    let mut report = tokio::time::interval(Duration::from_secs(args.report_interval.max(1)));
    loop {
        tokio::select! {
            _ = report.tick() => {
                let snapshot = service.snapshot();
                info!(
                    state = ?snapshot.state,
                    master = ?snapshot.master.as_ref().map(|m| m.address()),
                    is_master = snapshot.is_master,
                    "{}",
                    snapshot.view
                );
            }
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for Ctrl+C")?;
                info!("Shutdown signal received");
                break;
            }
        }
    }

    service.shutdown().await;
    info!("Concord node shutdown complete");
    Ok(())
}

/// File configuration with command line overrides applied
fn load_config(args: &Args) -> Result<NodeConfig> {
    let mut config = NodeConfig::load(&args.config)?;

    if let Some(bind) = &args.bind {
        config.bind_addr = bind.clone();
    }
    if !args.members.is_empty() {
        config.cluster.discovery.mode = DiscoveryMode::Static;
        config.cluster.discovery.members = args.members.clone();
    }
    if let Some(name) = &args.name {
        config
            .cluster
            .attributes
            .insert(NODE_NAME.to_string(), name.clone());
    }
    if args.lite {
        config.cluster.lite_member = true;
    }
    if let Some(target) = args.broadcast {
        config.cluster.discovery.mode = DiscoveryMode::Broadcast;
        config.cluster.discovery.broadcast.enabled = true;
        config.cluster.discovery.broadcast.target = Some(target);
    }

    Ok(config)
}

/// Initialize structured logging with tracing
fn init_logging(level: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }

    Ok(())
}
