use clap::{Arg, Command};
use tracing::{error, info};

use coordination::Registry;
use courier::config::{validate_node_id, validate_port, Config};
use courier::error::{CourierError, Result};
use courier::node::MessagingNode;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let matches = Command::new("courier")
        .version("0.1.0")
        .about("Fault-tolerant distributed messaging cluster node")
        .arg(
            Arg::new("node-id")
                .help("Node id in the form node-1, node-2, ...")
                .required(true),
        )
        .arg(
            Arg::new("port")
                .help("TCP port to listen on (1024-65535)")
                .required(true),
        )
        .arg(
            Arg::new("cluster")
                .long("cluster")
                .value_name("N")
                .help("Host an embedded coordination service and run the full N-node cluster in this process"),
        )
        .get_matches();

    let node_id = matches
        .get_one::<String>("node-id")
        .ok_or_else(|| CourierError::InvalidConfig("missing node id".to_string()))?;
    let port: u16 = matches
        .get_one::<String>("port")
        .ok_or_else(|| CourierError::InvalidConfig("missing port".to_string()))?
        .parse()
        .map_err(|_| CourierError::InvalidConfig("port must be a number".to_string()))?;

    validate_node_id(node_id)?;
    validate_port(port)?;

    match matches.get_one::<String>("cluster") {
        Some(size) => {
            let size: usize = size
                .parse()
                .map_err(|_| CourierError::InvalidConfig("cluster size must be a number".to_string()))?;
            if size < 1 {
                return Err(CourierError::InvalidConfig(
                    "cluster size must be >= 1".to_string(),
                ));
            }
            run_cluster(size).await
        }
        None => run_standalone(node_id, port).await,
    }
}

/// Single node without coordination: static peers per the three-node
/// port convention.
async fn run_standalone(node_id: &str, port: u16) -> Result<()> {
    info!(%node_id, port, "starting in standalone mode");

    let mut config = Config::new(node_id, port)?;
    config.peers = config.static_peers();
    info!(peers = ?config.peers, "static peers configured");

    let node = MessagingNode::new(config, None)?;
    node.start().await?;

    wait_for_shutdown().await;
    node.stop();
    Ok(())
}

/// All N nodes plus the coordination service in one process, on ports
/// `port_base + 1 ..= port_base + N`.
async fn run_cluster(size: usize) -> Result<()> {
    info!(size, "starting embedded cluster");

    let registry = Registry::new();
    let mut nodes = Vec::with_capacity(size);

    for k in 1..=size {
        let node_id = format!("node-{k}");
        let config = Config::new(&node_id, courier::config::DEFAULT_PORT_BASE + k as u16)?;
        let node = MessagingNode::new(config, Some(registry.clone()))?;
        node.start().await?;
        nodes.push(node);
    }

    if let Some(leader) = nodes.iter().find(|node| node.is_leader()) {
        info!(leader = leader.node_id(), "cluster is up");
    }

    wait_for_shutdown().await;
    for node in &nodes {
        node.stop();
    }
    Ok(())
}

async fn wait_for_shutdown() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
        return;
    }
    info!("received shutdown signal");
}
