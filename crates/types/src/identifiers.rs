//! Identifier newtypes for the consensus protocol.
//!
//! All identifiers are 64-bit and drawn from the current network
//! configuration. Newtypes keep them from being mixed up at call sites.

use sbor::prelude::*;
use std::fmt;

/// Monotonically increasing sequence number identifying a consensus slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, BasicSbor)]
#[sbor(transparent)]
pub struct SeqNo(pub u64);

impl SeqNo {
    /// The genesis slot. Never holds a batch; anchors the initial checkpoint.
    pub const ZERO: Self = SeqNo(0);

    /// Get the next sequence number.
    pub fn next(self) -> Self {
        SeqNo(self.0 + 1)
    }
}

impl fmt::Display for SeqNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a consensus node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, BasicSbor)]
#[sbor(transparent)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node-{}", self.0)
    }
}

/// Identifier of a client submitting requests for ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, BasicSbor)]
#[sbor(transparent)]
pub struct ClientId(pub u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// Identifier of a bucket: a partition of the sequence space.
///
/// In a steady epoch each bucket has exactly one leader, which is what
/// allows throughput to scale with the number of nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, BasicSbor)]
#[sbor(transparent)]
pub struct BucketId(pub u64);

impl fmt::Display for BucketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bucket-{}", self.0)
    }
}

/// Epoch number (monotonically increasing).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, BasicSbor)]
#[sbor(transparent)]
pub struct EpochNo(pub u64);

impl EpochNo {
    /// Genesis epoch.
    pub const GENESIS: Self = EpochNo(0);

    /// Get the next epoch.
    pub fn next(self) -> Self {
        EpochNo(self.0 + 1)
    }
}

impl fmt::Display for EpochNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "epoch-{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seqno_ordering() {
        assert!(SeqNo(1) < SeqNo(2));
        assert_eq!(SeqNo::ZERO.next(), SeqNo(1));
    }

    #[test]
    fn test_epoch_next() {
        assert_eq!(EpochNo::GENESIS.next(), EpochNo(1));
        assert_eq!(EpochNo(7).next(), EpochNo(8));
    }

    #[test]
    fn test_display() {
        assert_eq!(NodeId(3).to_string(), "node-3");
        assert_eq!(BucketId(0).to_string(), "bucket-0");
        assert_eq!(ClientId(9).to_string(), "client-9");
    }
}
