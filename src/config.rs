use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CourierError, Result};

/// Default base for the node-id to port convention: `node-<k>` listens on
/// `port_base + k`.
pub const DEFAULT_PORT_BASE: u16 = 7200;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub node_id: String,
    pub port: u16,
    /// Peer transport addresses (`host:port`). Filled from the static
    /// convention in standalone mode, or from the live-node set when
    /// coordinated.
    pub peers: Vec<String>,
    pub total_replicas: usize,
    pub port_base: u16,
    pub check_interval_ms: u64,
}

impl Config {
    pub fn new(node_id: &str, port: u16) -> Result<Self> {
        validate_node_id(node_id)?;
        validate_port(port)?;
        Ok(Self {
            node_id: node_id.to_string(),
            port,
            peers: Vec::new(),
            total_replicas: 3,
            port_base: DEFAULT_PORT_BASE,
            check_interval_ms: 3_000,
        })
    }

    pub fn bind_address(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }

    pub fn node_index(&self) -> Option<u32> {
        parse_node_index(&self.node_id)
    }

    /// Transport port of another node under the port convention.
    pub fn peer_port(&self, node_id: &str) -> Option<u16> {
        let index = parse_node_index(node_id)?;
        u16::try_from(index)
            .ok()
            .and_then(|index| self.port_base.checked_add(index))
    }

    pub fn peer_address(&self, node_id: &str) -> Option<String> {
        self.peer_port(node_id).map(|port| format!("127.0.0.1:{port}"))
    }

    /// Static peer convention for a three-node standalone cluster,
    /// excluding this node.
    pub fn static_peers(&self) -> Vec<String> {
        let own = self.node_index();
        (1..=3)
            .filter(|k| own != Some(*k))
            .map(|k| format!("127.0.0.1:{}", self.port_base + k as u16))
            .collect()
    }
}

impl From<&Config> for detector::Config {
    fn from(config: &Config) -> Self {
        detector::Config {
            check_interval: Duration::from_millis(config.check_interval_ms),
            ..detector::Config::default()
        }
    }
}

/// Node ids follow `node-<k>` with `k >= 1` and no leading zeros.
pub fn parse_node_index(node_id: &str) -> Option<u32> {
    let index = node_id.strip_prefix("node-")?;
    if index.is_empty() || index.starts_with('0') || !index.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    index.parse().ok()
}

pub fn validate_node_id(node_id: &str) -> Result<()> {
    if parse_node_index(node_id).is_none() {
        return Err(CourierError::InvalidConfig(format!(
            "invalid node id {node_id:?}, expected node-1, node-2, ..."
        )));
    }
    Ok(())
}

pub fn validate_port(port: u16) -> Result<()> {
    if port < 1024 {
        return Err(CourierError::InvalidConfig(format!(
            "invalid port {port}, must be between 1024 and 65535"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_well_formed_node_ids() {
        assert_eq!(parse_node_index("node-1"), Some(1));
        assert_eq!(parse_node_index("node-42"), Some(42));
    }

    #[test]
    fn rejects_malformed_node_ids() {
        for bad in ["node-0", "node-01", "node-", "node-x", "peer-1", "node-1a"] {
            assert_eq!(parse_node_index(bad), None, "{bad}");
            assert!(validate_node_id(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn rejects_privileged_ports() {
        assert!(Config::new("node-1", 80).is_err());
        assert!(Config::new("node-1", 7201).is_ok());
    }

    #[test]
    fn maps_node_ids_to_ports() {
        let config = Config::new("node-1", 7201).unwrap();
        assert_eq!(config.peer_port("node-3"), Some(7203));
        assert_eq!(config.peer_address("node-2").as_deref(), Some("127.0.0.1:7202"));
        assert_eq!(config.peer_port("node-zero"), None);
    }

    #[test]
    fn static_peers_exclude_self() {
        let config = Config::new("node-2", 7202).unwrap();
        assert_eq!(
            config.static_peers(),
            vec!["127.0.0.1:7201".to_string(), "127.0.0.1:7203".to_string()]
        );
    }
}
