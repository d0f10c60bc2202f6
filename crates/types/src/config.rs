//! Network and client configuration.

use crate::{ClientId, NodeId};
use sbor::prelude::*;
use thiserror::Error;

/// Errors raised when validating a network configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("network of {nodes} nodes cannot tolerate f={f} faults (requires 3f+1 <= nodes)")]
    InsufficientNodes { nodes: usize, f: u64 },

    #[error("duplicate node id {0}")]
    DuplicateNode(NodeId),

    #[error("duplicate client id {0}")]
    DuplicateClient(ClientId),

    #[error("number of buckets must be non-zero")]
    NoBuckets,

    #[error("checkpoint interval must be non-zero")]
    NoCheckpointInterval,

    #[error("max epoch length {max_epoch_length} is shorter than the checkpoint interval {checkpoint_interval}")]
    EpochShorterThanInterval {
        max_epoch_length: u64,
        checkpoint_interval: u64,
    },
}

/// Static parameters of the consensus network.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct NetworkConfig {
    /// Ordered list of participating nodes.
    pub nodes: Vec<NodeId>,

    /// Number of Byzantine faults tolerated. Invariant: `3f + 1 <= nodes.len()`.
    pub f: u64,

    /// Number of buckets the sequence space is partitioned into.
    pub num_buckets: u64,

    /// Distance between checkpoint boundaries, in sequence numbers.
    pub checkpoint_interval: u64,

    /// Maximum number of sequences an epoch may span before a planned rotation.
    pub max_epoch_length: u64,
}

impl NetworkConfig {
    /// Validate the structural invariants of the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if (self.nodes.len() as u64) < 3 * self.f + 1 {
            return Err(ConfigError::InsufficientNodes {
                nodes: self.nodes.len(),
                f: self.f,
            });
        }
        let mut seen = std::collections::BTreeSet::new();
        for node in &self.nodes {
            if !seen.insert(*node) {
                return Err(ConfigError::DuplicateNode(*node));
            }
        }
        if self.num_buckets == 0 {
            return Err(ConfigError::NoBuckets);
        }
        if self.checkpoint_interval == 0 {
            return Err(ConfigError::NoCheckpointInterval);
        }
        if self.max_epoch_length < self.checkpoint_interval {
            return Err(ConfigError::EpochShorterThanInterval {
                max_epoch_length: self.max_epoch_length,
                checkpoint_interval: self.checkpoint_interval,
            });
        }
        Ok(())
    }

    /// Strong quorum size: `2f + 1`.
    pub fn quorum(&self) -> usize {
        (2 * self.f + 1) as usize
    }

    /// Weak quorum size: `f + 1`. One member is guaranteed honest.
    pub fn weak_quorum(&self) -> usize {
        (self.f + 1) as usize
    }

    /// Check whether a node is part of this configuration.
    pub fn contains(&self, node: NodeId) -> bool {
        self.nodes.contains(&node)
    }
}

/// Per-client request window configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, BasicSbor)]
pub struct ClientConfig {
    /// Client identifier.
    pub id: ClientId,

    /// Width of the sliding acceptance window for request numbers.
    pub width: u64,

    /// Lowest request number the client may still submit.
    pub low_watermark: u64,
}

/// The complete network state: configuration plus the client set.
///
/// Clients are held sorted by id; ids are unique.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct NetworkState {
    /// Network configuration.
    pub config: NetworkConfig,

    /// Client windows, sorted by client id.
    pub clients: Vec<ClientConfig>,
}

impl NetworkState {
    /// Validate the configuration and the client set.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.config.validate()?;
        let mut seen = std::collections::BTreeSet::new();
        for client in &self.clients {
            if !seen.insert(client.id) {
                return Err(ConfigError::DuplicateClient(client.id));
            }
        }
        Ok(())
    }
}

/// Build the conventional initial network state for a fresh deployment.
///
/// Buckets equal the node count, the checkpoint interval is five times the
/// bucket count, and an epoch rotates after ten checkpoint intervals.
pub fn standard_initial_network_state(node_count: u64, client_count: u64) -> NetworkState {
    let nodes: Vec<NodeId> = (0..node_count).map(NodeId).collect();
    let checkpoint_interval = node_count * 5;

    let clients = (0..client_count)
        .map(|id| ClientConfig {
            id: ClientId(id),
            width: 100,
            low_watermark: 0,
        })
        .collect();

    NetworkState {
        config: NetworkConfig {
            nodes,
            f: (node_count - 1) / 3,
            num_buckets: node_count,
            checkpoint_interval,
            max_epoch_length: checkpoint_interval * 10,
        },
        clients,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_network_state() {
        let state = standard_initial_network_state(4, 2);
        assert_eq!(state.config.nodes.len(), 4);
        assert_eq!(state.config.f, 1);
        assert_eq!(state.config.num_buckets, 4);
        assert_eq!(state.config.checkpoint_interval, 20);
        assert_eq!(state.config.max_epoch_length, 200);
        assert_eq!(state.clients.len(), 2);
        assert!(state.validate().is_ok());
    }

    #[test]
    fn test_quorum_sizes() {
        let state = standard_initial_network_state(4, 0);
        assert_eq!(state.config.quorum(), 3);
        assert_eq!(state.config.weak_quorum(), 2);
    }

    #[test]
    fn test_insufficient_nodes_rejected() {
        let mut state = standard_initial_network_state(4, 0);
        state.config.f = 2;
        assert_eq!(
            state.validate(),
            Err(ConfigError::InsufficientNodes { nodes: 4, f: 2 })
        );
    }

    #[test]
    fn test_duplicate_client_rejected() {
        let mut state = standard_initial_network_state(4, 2);
        state.clients[1].id = ClientId(0);
        assert_eq!(state.validate(), Err(ConfigError::DuplicateClient(ClientId(0))));
    }
}
