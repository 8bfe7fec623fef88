use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::error::{RaftError, Result};

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_id: u64,
    pub listen_addr: SocketAddr,
    pub peers: Vec<PeerConfig>,
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// Per-call deadline used by the gRPC transport.
    pub rpc_timeout_ms: u64,
    /// Upper bound on entries carried by a single AppendEntries.
    pub max_entries_per_append: usize,
    pub apply_channel_capacity: usize,
    /// Persisted hard-state size at which the application should snapshot.
    /// `None` disables automatic compaction.
    pub max_raft_state_bytes: Option<usize>,
    /// Directory for the file persister. `None` keeps state in memory only.
    pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub node_id: u64,
    pub addr: String, // host:port format, supports both IP and hostnames
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 50051)),
            peers: Vec::new(),
            election_timeout_min_ms: 600,
            election_timeout_max_ms: 850,
            heartbeat_interval_ms: 100,
            rpc_timeout_ms: 500,
            max_entries_per_append: 512,
            apply_channel_capacity: 256,
            max_raft_state_bytes: None,
            data_dir: None,
        }
    }
}

impl NodeConfig {
    pub fn new(node_id: u64, listen_addr: SocketAddr) -> Self {
        Self {
            node_id,
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_peer(mut self, node_id: u64, addr: String) -> Self {
        self.peers.push(PeerConfig { node_id, addr });
        self
    }

    pub fn peer_ids(&self) -> Vec<u64> {
        self.peers.iter().map(|p| p.node_id).collect()
    }

    /// Number of voting members, including this node.
    pub fn cluster_size(&self) -> usize {
        self.peers.len() + 1
    }

    pub fn validate(&self) -> Result<()> {
        // Id 0 means "no candidate" on the wire
        if self.node_id == 0 {
            return Err(RaftError::Config("node id must be non-zero".to_string()));
        }
        if self.election_timeout_min_ms > self.election_timeout_max_ms {
            return Err(RaftError::Config(format!(
                "election timeout min ({}ms) exceeds max ({}ms)",
                self.election_timeout_min_ms, self.election_timeout_max_ms
            )));
        }
        if self.heartbeat_interval_ms == 0
            || self.heartbeat_interval_ms >= self.election_timeout_min_ms
        {
            return Err(RaftError::Config(format!(
                "heartbeat interval ({}ms) must be non-zero and below the election timeout ({}ms)",
                self.heartbeat_interval_ms, self.election_timeout_min_ms
            )));
        }
        if self.max_entries_per_append == 0 || self.apply_channel_capacity == 0 {
            return Err(RaftError::Config(
                "max_entries_per_append and apply_channel_capacity must be non-zero".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for peer in &self.peers {
            if peer.node_id == 0 {
                return Err(RaftError::Config(format!(
                    "peer {} has node id 0",
                    peer.addr
                )));
            }
            if peer.node_id == self.node_id {
                return Err(RaftError::Config(format!(
                    "node {} lists itself as a peer",
                    self.node_id
                )));
            }
            if !seen.insert(peer.node_id) {
                return Err(RaftError::Config(format!(
                    "duplicate peer id {}",
                    peer.node_id
                )));
            }
        }
        Ok(())
    }
}
