//! Checkpoint window: quorum aggregation of checkpoint attestations.

use conclave_core::{Action, ActionList, Fault};
use conclave_types::{BucketId, Msg, NodeId, SeqNo};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

/// One node's attestation to a checkpoint value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeAttestation {
    /// The attesting node.
    pub node: NodeId,
    /// Opaque attestation bytes.
    pub attestation: Vec<u8>,
}

/// Aggregates checkpoint attestations for one boundary sequence.
///
/// A window is created when its boundary enters the active watermark range,
/// with every bucket of the epoch pending. As buckets finish committing
/// their slots below the boundary they are marked committed; once the last
/// bucket reports, the application is asked for its snapshot. Peer
/// attestations accumulate per value, and the value becomes network-stable
/// once strictly more than `2f + 1` distinct nodes attest to it.
///
/// The window carries immutable copies of the epoch fields it needs rather
/// than a reference to the epoch that owns it.
#[derive(Debug, Clone)]
pub struct CheckpointWindow {
    seq: SeqNo,
    f: u64,
    nodes: Vec<NodeId>,
    pending_commits: BTreeSet<BucketId>,
    values: BTreeMap<Vec<u8>, Vec<NodeAttestation>>,
    committed_value: Option<Vec<u8>>,
}

impl CheckpointWindow {
    /// Construct a window for the boundary `seq`, with every bucket of the
    /// epoch pending.
    pub fn new(
        seq: SeqNo,
        f: u64,
        nodes: Vec<NodeId>,
        buckets: impl IntoIterator<Item = BucketId>,
    ) -> Self {
        CheckpointWindow {
            seq,
            f,
            nodes,
            pending_commits: buckets.into_iter().collect(),
            values: BTreeMap::new(),
            committed_value: None,
        }
    }

    /// The boundary sequence this window certifies.
    pub fn seq(&self) -> SeqNo {
        self.seq
    }

    /// Buckets that have not yet finished committing below the boundary.
    pub fn pending_commits(&self) -> &BTreeSet<BucketId> {
        &self.pending_commits
    }

    /// The network-stable value, once one exists.
    pub fn committed_value(&self) -> Option<&[u8]> {
        self.committed_value.as_deref()
    }

    /// Number of distinct attestations collected for `value`.
    pub fn attestation_count(&self, value: &[u8]) -> usize {
        self.values.get(value).map(|a| a.len()).unwrap_or(0)
    }

    /// Record that `bucket` has committed all of its slots at or below the
    /// boundary. When the last bucket reports, the application is asked to
    /// snapshot at the boundary.
    pub fn committed(&mut self, bucket: BucketId) -> ActionList {
        self.pending_commits.remove(&bucket);
        if !self.pending_commits.is_empty() {
            return ActionList::new();
        }
        debug!(seq = %self.seq, "all buckets committed, requesting checkpoint");
        ActionList::from(vec![Action::Checkpoint { seq: self.seq }])
    }

    /// Apply a peer's checkpoint attestation.
    ///
    /// The value becomes network-stable once strictly more than `2f + 1`
    /// distinct nodes attest to it. Attestations for a different value after
    /// one is committed are evidence of Byzantine behavior; they are logged
    /// and otherwise ignored.
    pub fn apply_checkpoint_msg(
        &mut self,
        source: NodeId,
        value: Vec<u8>,
        attestation: Vec<u8>,
    ) -> ActionList {
        if let Some(committed) = &self.committed_value {
            if *committed != value {
                warn!(
                    seq = %self.seq,
                    %source,
                    "checkpoint attestation conflicts with the committed value"
                );
                return ActionList::new();
            }
        }

        let attestations = self.values.entry(value.clone()).or_default();
        if attestations.iter().any(|a| a.node == source) {
            debug!(seq = %self.seq, %source, "duplicate checkpoint attestation");
            return ActionList::new();
        }
        attestations.push(NodeAttestation {
            node: source,
            attestation,
        });

        if attestations.len() > (2 * self.f + 1) as usize && self.committed_value.is_none() {
            debug!(seq = %self.seq, "checkpoint value is network-stable");
            self.committed_value = Some(value);
        }

        ActionList::new()
    }

    /// Apply this node's own checkpoint result from the application.
    ///
    /// A local result disagreeing with an already-committed network value is
    /// a safety violation: the Byzantine assumptions no longer hold for this
    /// node, and it must stop.
    pub fn apply_checkpoint_result(
        &mut self,
        value: Vec<u8>,
        attestation: Vec<u8>,
    ) -> Result<ActionList, Fault> {
        if let Some(committed) = &self.committed_value {
            if *committed != value {
                return Err(Fault::CheckpointDisagreement {
                    seq: self.seq,
                    local: value,
                    committed: committed.clone(),
                });
            }
        }

        Ok(ActionList::from(vec![Action::Send {
            targets: self.nodes.clone(),
            msg: Msg::Checkpoint {
                seq: self.seq,
                value,
                attestation,
            },
        }]))
    }
}
