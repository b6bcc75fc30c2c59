//! Startup configuration for a node: §6's `node_id`, `self`, `peers`,
//! `state_path`, and the optional timing knobs from §4.1's timing
//! contract.

use std::path::PathBuf;

use crate::state::{NodeId, Peer};

/// `T_min=150ms, T_max=300ms, heartbeat=50ms` are the literal defaults
/// used throughout §8's end-to-end scenarios.
pub const DEFAULT_ELECTION_TIMEOUT_MIN_MS: u64 = 150;
pub const DEFAULT_ELECTION_TIMEOUT_MAX_MS: u64 = 300;
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 50;
pub const DEFAULT_APPLY_INTERVAL_MS: u64 = 20;

#[derive(Debug, Clone)]
pub struct RaftConfig {
    pub node_id: NodeId,
    pub listen_host: String,
    pub listen_port: u16,
    pub peers: Vec<Peer>,
    pub state_path: PathBuf,
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub apply_interval_ms: u64,
}

impl RaftConfig {
    /// Validates the timing contract in §4.1: `T_max >= 2 * T_min` and the
    /// heartbeat interval strictly less than `T_min`.
    pub fn validate(&self) -> Result<(), String> {
        if self.election_timeout_max_ms < 2 * self.election_timeout_min_ms {
            return Err(format!(
                "election_timeout_max_ms ({}) must be >= 2 * election_timeout_min_ms ({})",
                self.election_timeout_max_ms, self.election_timeout_min_ms
            ));
        }
        if self.heartbeat_interval_ms >= self.election_timeout_min_ms {
            return Err(format!(
                "heartbeat_interval_ms ({}) must be strictly less than election_timeout_min_ms ({})",
                self.heartbeat_interval_ms, self.election_timeout_min_ms
            ));
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.listen_host, self.listen_port)
    }

    pub fn majority(&self) -> usize {
        (self.peers.len() + 1) / 2 + 1
    }
}
