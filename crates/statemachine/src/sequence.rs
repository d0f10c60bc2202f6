//! Per-slot three-phase state.

use conclave_types::{BucketId, Digest, NodeId, RequestAck, SeqNo};
use std::collections::{BTreeMap, BTreeSet};

/// The furthest phase a slot has reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SlotPhase {
    /// Created, batch or digest not yet known.
    Pending,
    /// Batch and digest known; this node attested to the batch.
    Preprepared,
    /// A prepare quorum formed for the digest.
    Prepared,
    /// A commit quorum formed; the batch was delivered.
    Committed,
}

/// State of one sequence slot.
///
/// A slot is created either when this node allocates a batch into it (the
/// bucket leader path), when a preprepare arrives for it, or when prepare or
/// commit attestations arrive early. Attestations are tracked per digest so
/// conflicting claims never merge.
#[derive(Debug, Clone)]
pub struct Slot {
    pub seq: SeqNo,
    pub bucket: BucketId,
    pub leader: NodeId,
    /// This node leads the slot's bucket.
    pub is_leader: bool,
    /// The batch content, once known.
    pub batch: Option<Vec<RequestAck>>,
    /// The batch digest, once computed by the hasher.
    pub digest: Option<Digest>,
    /// A hash request for the batch is in flight.
    pub awaiting_digest: bool,
    /// A `FetchBatch` for this slot is in flight.
    pub fetching: bool,
    /// Digest a forwarded batch must re-derive to before adoption.
    pub expected_digest: Option<Digest>,
    /// Prepare attestations per digest. The leader's preprepare counts as
    /// its prepare.
    pub prepares: BTreeMap<Digest, BTreeSet<NodeId>>,
    /// Commit attestations per digest.
    pub commits: BTreeMap<Digest, BTreeSet<NodeId>>,
    /// This node broadcast its commit for the slot.
    pub sent_commit: bool,
    pub phase: SlotPhase,
}

impl Slot {
    /// Create an empty slot shell.
    pub fn new(seq: SeqNo, bucket: BucketId, leader: NodeId, is_leader: bool) -> Self {
        Slot {
            seq,
            bucket,
            leader,
            is_leader,
            batch: None,
            digest: None,
            awaiting_digest: false,
            fetching: false,
            expected_digest: None,
            prepares: BTreeMap::new(),
            commits: BTreeMap::new(),
            sent_commit: false,
            phase: SlotPhase::Pending,
        }
    }

    /// Record a prepare attestation. Returns false for duplicates.
    pub fn add_prepare(&mut self, node: NodeId, digest: Digest) -> bool {
        self.prepares.entry(digest).or_default().insert(node)
    }

    /// Record a commit attestation. Returns false for duplicates.
    pub fn add_commit(&mut self, node: NodeId, digest: Digest) -> bool {
        self.commits.entry(digest).or_default().insert(node)
    }

    /// Distinct prepare attestations for `digest`.
    pub fn prepare_count(&self, digest: &Digest) -> usize {
        self.prepares.get(digest).map(|s| s.len()).unwrap_or(0)
    }

    /// Distinct commit attestations for `digest`.
    pub fn commit_count(&self, digest: &Digest) -> usize {
        self.commits.get(digest).map(|s| s.len()).unwrap_or(0)
    }

    /// The digest with a commit quorum, if any. Used to fetch a batch this
    /// node never preprepared.
    pub fn commit_quorum_digest(&self, quorum: usize) -> Option<Digest> {
        self.commits
            .iter()
            .find(|(_, sources)| sources.len() >= quorum)
            .map(|(digest, _)| *digest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attestations_deduplicate() {
        let mut slot = Slot::new(SeqNo(1), BucketId(1), NodeId(0), false);
        let d = Digest::new([1; 32]);
        assert!(slot.add_prepare(NodeId(0), d));
        assert!(!slot.add_prepare(NodeId(0), d));
        assert_eq!(slot.prepare_count(&d), 1);
    }

    #[test]
    fn test_conflicting_digests_do_not_merge() {
        let mut slot = Slot::new(SeqNo(1), BucketId(1), NodeId(0), false);
        let d1 = Digest::new([1; 32]);
        let d2 = Digest::new([2; 32]);
        slot.add_commit(NodeId(0), d1);
        slot.add_commit(NodeId(1), d2);
        assert_eq!(slot.commit_count(&d1), 1);
        assert_eq!(slot.commit_count(&d2), 1);
        assert_eq!(slot.commit_quorum_digest(2), None);
        slot.add_commit(NodeId(2), d2);
        assert_eq!(slot.commit_quorum_digest(2), Some(d2));
    }

    #[test]
    fn test_phase_ordering() {
        assert!(SlotPhase::Pending < SlotPhase::Preprepared);
        assert!(SlotPhase::Preprepared < SlotPhase::Prepared);
        assert!(SlotPhase::Prepared < SlotPhase::Committed);
    }
}
