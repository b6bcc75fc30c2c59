use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info};
use raft_booking::config::{
    RaftConfig, DEFAULT_APPLY_INTERVAL_MS, DEFAULT_ELECTION_TIMEOUT_MAX_MS,
    DEFAULT_ELECTION_TIMEOUT_MIN_MS, DEFAULT_HEARTBEAT_INTERVAL_MS,
};
use raft_booking::state::Peer;
use raft_booking::RaftNode;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Starts a single cluster member. Peers are given as `id:host:port`
/// triples and must list every other member of the cluster, not this one.
#[derive(Parser, Debug)]
#[command(name = "raft-node", about = "A Raft-replicated room booking node")]
struct Args {
    #[arg(long)]
    node_id: u64,

    #[arg(long, default_value = "127.0.0.1")]
    listen_host: String,

    #[arg(long)]
    listen_port: u16,

    /// Other cluster members, each `id:host:port`. May be repeated.
    #[arg(long = "peer")]
    peers: Vec<String>,

    #[arg(long)]
    state_path: PathBuf,

    #[arg(long, default_value_t = DEFAULT_ELECTION_TIMEOUT_MIN_MS)]
    election_timeout_min_ms: u64,

    #[arg(long, default_value_t = DEFAULT_ELECTION_TIMEOUT_MAX_MS)]
    election_timeout_max_ms: u64,

    #[arg(long, default_value_t = DEFAULT_HEARTBEAT_INTERVAL_MS)]
    heartbeat_interval_ms: u64,

    #[arg(long, default_value_t = DEFAULT_APPLY_INTERVAL_MS)]
    apply_interval_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let peers = args
        .peers
        .iter()
        .map(|s| Peer::from_str(s).map_err(|e| anyhow::anyhow!("{e}")))
        .collect::<Result<Vec<_>>>()
        .context("parsing --peer triples")?;

    let config = RaftConfig {
        node_id: args.node_id,
        listen_host: args.listen_host,
        listen_port: args.listen_port,
        peers,
        state_path: args.state_path,
        election_timeout_min_ms: args.election_timeout_min_ms,
        election_timeout_max_ms: args.election_timeout_max_ms,
        heartbeat_interval_ms: args.heartbeat_interval_ms,
        apply_interval_ms: args.apply_interval_ms,
    };

    let node = RaftNode::new(config).await.context("constructing raft node")?;
    node.spawn_background_tasks();

    let addr = node.config().listen_addr();
    let listener = TcpListener::bind(&addr).await.context("binding listener")?;
    info!("[{}] listening on {addr}", node.node_id());

    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                let node = Arc::clone(&node);
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, node).await {
                        error!("connection from {peer_addr} failed: {e}");
                    }
                });
            }
            Err(e) => error!("failed to accept connection: {e}"),
        }
    }
}

async fn handle_connection(mut stream: tokio::net::TcpStream, node: Arc<RaftNode>) -> Result<()> {
    let message = raft_booking::messages::read_message(&mut stream).await?;
    let reply = node.handle_message(message).await;
    raft_booking::messages::write_message(&mut stream, &reply).await?;
    Ok(())
}
