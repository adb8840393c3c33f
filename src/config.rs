// Configuration — loaded from the environment, validated before a
// `ClusterService` is allowed to start.

use crate::error::{ClusterError, Result};
use crate::raft::TimingConfig;
use crate::transport::PeerMap;
use crate::types::NodeId;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub node_id: NodeId,
    pub peers: Vec<NodeId>,
    pub peer_map: PeerMap,
    pub timing: TimingConfig,
    pub auto_start: bool,
    pub data_dir: PathBuf,
}

impl ClusterConfig {
    pub fn from_env() -> Result<Self> {
        let node_id = NodeId::new(require_env("RAFT_NODE_ID")?);
        let nodes_raw = require_env("RAFT_NODES")?;
        let base_port: u16 = require_env("RAFT_BASE_PORT")?
            .parse()
            .map_err(|_| ClusterError::Configuration("RAFT_BASE_PORT must be a u16".into()))?;

        let mut seen = std::collections::HashSet::new();
        let mut ordered_nodes = Vec::new();
        for raw in nodes_raw.split(',') {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                continue;
            }
            if seen.insert(trimmed.to_string()) {
                ordered_nodes.push(NodeId::new(trimmed));
            }
        }

        let mut endpoints = HashMap::new();
        for (i, node) in ordered_nodes.iter().enumerate() {
            let port = base_port + i as u16;
            endpoints.insert(node.clone(), ("127.0.0.1".to_string(), port));
        }
        let peer_map = PeerMap::new(endpoints);

        let peers: Vec<NodeId> = ordered_nodes
            .iter()
            .filter(|n| *n != &node_id)
            .cloned()
            .collect();

        let timing = TimingConfig {
            election_timeout_min: duration_ms_env("RAFT_ELECTION_TIMEOUT_MIN", 150)?,
            election_timeout_max: duration_ms_env("RAFT_ELECTION_TIMEOUT_MAX", 450)?,
            heartbeat_interval: duration_ms_env("RAFT_HEARTBEAT_INTERVAL", 100)?,
            rpc_timeout: duration_ms_env("RAFT_RPC_TIMEOUT", 100)?,
            commit_timeout: Duration::from_secs(5),
        };

        let auto_start = std::env::var("RAFT_AUTO_START")
            .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(true);

        let data_dir = std::env::var("RAFT_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data"));

        let config = Self {
            node_id,
            peers,
            peer_map,
            timing,
            auto_start,
            data_dir,
        };
        config.validate(&ordered_nodes)?;
        Ok(config)
    }

    fn validate(&self, all_nodes: &[NodeId]) -> Result<()> {
        if !all_nodes.contains(&self.node_id) {
            return Err(ClusterError::Configuration(format!(
                "RAFT_NODE_ID {} is not present in RAFT_NODES",
                self.node_id
            )));
        }
        if self.timing.election_timeout_min >= self.timing.election_timeout_max {
            return Err(ClusterError::Configuration(
                "RAFT_ELECTION_TIMEOUT_MIN must be < RAFT_ELECTION_TIMEOUT_MAX".into(),
            ));
        }
        if self.timing.heartbeat_interval >= self.timing.election_timeout_min {
            return Err(ClusterError::Configuration(
                "RAFT_HEARTBEAT_INTERVAL must be < RAFT_ELECTION_TIMEOUT_MIN".into(),
            ));
        }
        Ok(())
    }
}

fn require_env(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| ClusterError::Configuration(format!("{} is not set", key)))
}

fn duration_ms_env(key: &str, default_ms: u64) -> Result<Duration> {
    match std::env::var(key) {
        Ok(raw) => {
            let ms: u64 = raw
                .parse()
                .map_err(|_| ClusterError::Configuration(format!("{} must be an integer", key)))?;
            Ok(Duration::from_millis(ms))
        }
        Err(_) => Ok(Duration::from_millis(default_ms)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_election_timeout_bounds_reversed() {
        let config = ClusterConfig {
            node_id: NodeId::new("n1"),
            peers: vec![],
            peer_map: PeerMap::new(HashMap::new()),
            timing: TimingConfig {
                election_timeout_min: Duration::from_millis(500),
                election_timeout_max: Duration::from_millis(200),
                heartbeat_interval: Duration::from_millis(50),
                rpc_timeout: Duration::from_millis(100),
                commit_timeout: Duration::from_secs(5),
            },
            auto_start: true,
            data_dir: PathBuf::from("./data"),
        };
        assert!(config.validate(&[NodeId::new("n1")]).is_err());
    }

    #[test]
    fn rejects_missing_self_in_node_list() {
        let config = ClusterConfig {
            node_id: NodeId::new("n1"),
            peers: vec![],
            peer_map: PeerMap::new(HashMap::new()),
            timing: TimingConfig::default(),
            auto_start: true,
            data_dir: PathBuf::from("./data"),
        };
        assert!(config.validate(&[NodeId::new("n2")]).is_err());
    }

    #[test]
    fn rejects_heartbeat_not_below_election_min() {
        let config = ClusterConfig {
            node_id: NodeId::new("n1"),
            peers: vec![],
            peer_map: PeerMap::new(HashMap::new()),
            timing: TimingConfig {
                election_timeout_min: Duration::from_millis(100),
                election_timeout_max: Duration::from_millis(300),
                heartbeat_interval: Duration::from_millis(150),
                rpc_timeout: Duration::from_millis(100),
                commit_timeout: Duration::from_secs(5),
            },
            auto_start: true,
            data_dir: PathBuf::from("./data"),
        };
        assert!(config.validate(&[NodeId::new("n1")]).is_err());
    }
}
