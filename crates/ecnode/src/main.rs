//! Erasure-coded storage node daemon (ecnode).
//!
//! Usage:
//!   ecnode --local-addr HOST:PORT --disk PATH[:CAPACITY] [--disk ...] [OPTIONS]
//!
//! The daemon loads every partition found on its disks, then serves the
//! packet protocol on one TCP listener until interrupted.

mod config;
mod node;
mod ops;
mod partition;
mod replication;
mod request;
mod space;
mod store;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};

use ecnode_core::tcp_transport::TcpTransport;
use ecnode_core::transport::PeerTransport;
use ecnode_proto::defaults::{
    DEFAULT_CLIENT_READ_TIMEOUT_MS, DEFAULT_LISTEN_PORT, DEFAULT_REPLICA_TIMEOUT_MS,
    DEFAULT_SCRUB_INTERVAL_SECS, DEFAULT_TCP_MAX_CONNS_PER_NODE,
};

use crate::config::{DiskConfig, NodeConfig};
use crate::node::EcNode;

/// Erasure-coded storage node
#[derive(Parser, Debug)]
#[command(name = "ecnode", version, about = "Erasure-coded storage node")]
struct Args {
    /// Listen address
    #[arg(short = 'b', long, default_value_t = format!("0.0.0.0:{}", DEFAULT_LISTEN_PORT))]
    listen: String,

    /// This node's HOST:PORT as it appears in partition host lists
    #[arg(short = 'a', long)]
    local_addr: String,

    /// Data disk, PATH[:CAPACITY]; may be given multiple times.
    /// Capacity accepts K/M/G/T suffixes; omitted means the filesystem size.
    #[arg(short = 'd', long = "disk", value_name = "PATH[:CAPACITY]", required = true)]
    disks: Vec<DiskConfig>,

    /// Timeout for one follower round-trip (ms)
    #[arg(long, default_value_t = DEFAULT_REPLICA_TIMEOUT_MS)]
    replica_timeout_ms: u64,

    /// Read deadline on client connections (ms, 0 to disable)
    #[arg(long, default_value_t = DEFAULT_CLIENT_READ_TIMEOUT_MS)]
    read_timeout_ms: u64,

    /// Pooled connections kept per follower
    #[arg(long, default_value_t = DEFAULT_TCP_MAX_CONNS_PER_NODE)]
    max_conns_per_node: usize,

    /// Interval between background checksum scrubs (seconds, 0 to disable)
    #[arg(long, default_value_t = DEFAULT_SCRUB_INTERVAL_SECS)]
    scrub_interval_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logging
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!("ecnode v{} starting", env!("CARGO_PKG_VERSION"));

    let mut config = NodeConfig::new(&args.listen, &args.local_addr, args.disks)
        .with_replica_timeout_ms(args.replica_timeout_ms)
        .with_read_timeout_ms(args.read_timeout_ms);
    config.max_conns_per_node = args.max_conns_per_node;

    for disk in &config.disks {
        info!("disk {}", disk);
    }

    let transport: Arc<dyn PeerTransport> = Arc::new(TcpTransport::new(config.max_conns_per_node));

    let node = match EcNode::start(config, transport).await {
        Ok(node) => node,
        Err(e) => {
            error!("failed to start node: {}", e);
            std::process::exit(1);
        }
    };

    let listener = match ecnode_core::net::create_listen_socket(&node.config.listen_addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("failed to listen on {}: {}", node.config.listen_addr, e);
            std::process::exit(1);
        }
    };

    let accept = tokio::spawn(request::accept_loop(node.clone(), listener));

    if args.scrub_interval_secs > 0 {
        let node = node.clone();
        let interval = Duration::from_secs(args.scrub_interval_secs);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let corrupt = node.scrub().await;
                info!("scrub finished: {} corrupt extents", corrupt);
            }
        });
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("received interrupt"),
        Err(e) => error!("failed to wait for interrupt: {}", e),
    }

    if let Err(e) = node.shutdown().await {
        error!("shutdown error: {}", e);
    }
    match accept.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("accept loop failed: {}", e),
        Err(e) => error!("accept loop panicked: {}", e),
    }

    info!("ecnode stopped");
}
