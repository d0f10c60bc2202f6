//! Epoch change: suspicion, change votes, and the new-epoch handshake.
//!
//! The flow has three stages:
//!
//! 1. **Suspicion.** Nodes that see no progress broadcast `Suspect` for the
//!    current epoch. A weak quorum of suspicions (one of them honest) starts
//!    the change.
//! 2. **Change votes.** Each changing node broadcasts `EpochChange` with its
//!    stable checkpoint; every node acknowledges every change vote it sees.
//!    A change vote with a strong quorum of acks is certified.
//! 3. **Handshake.** The new primary, once it holds a strong quorum of
//!    certified change votes, announces `NewEpoch`. Nodes echo the
//!    announcement, broadcast ready on a strong quorum of echoes, and adopt
//!    the epoch on a strong quorum of readies.
//!
//! The new primary is a pure function of the epoch number and node list, so
//! every node elects the same one without communication.

use conclave_types::{EpochNo, NodeId, SeqNo};
use std::collections::{BTreeMap, BTreeSet};

/// A node's certified stable state carried in its change vote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeVote {
    pub stable_seq: SeqNo,
    pub stable_value: Vec<u8>,
}

/// Progress of an in-flight epoch change.
#[derive(Debug, Default)]
pub struct EpochChangeState {
    /// Nodes suspecting the current epoch.
    suspicions: BTreeSet<NodeId>,
    /// This node broadcast its own suspicion.
    pub suspected: bool,

    /// The epoch being moved to, once the change has started locally.
    target: Option<EpochNo>,
    /// Change votes received for the target epoch.
    changes: BTreeMap<NodeId, ChangeVote>,
    /// Ack sources per change-vote origin.
    acks: BTreeMap<NodeId, BTreeSet<NodeId>>,
    /// This node (as primary) announced the new epoch.
    pub sent_new_epoch: bool,

    /// Echo sources per announced `(epoch, start_seq)`.
    echoes: BTreeMap<(EpochNo, SeqNo), BTreeSet<NodeId>>,
    /// Ready sources per announced `(epoch, start_seq)`.
    readies: BTreeMap<(EpochNo, SeqNo), BTreeSet<NodeId>>,
    /// This node echoed an announcement.
    pub sent_echo: bool,
    /// This node broadcast ready.
    pub sent_ready: bool,
}

impl EpochChangeState {
    /// Record a suspicion of the current epoch. Returns the number of
    /// distinct suspecting nodes.
    pub fn add_suspicion(&mut self, source: NodeId) -> usize {
        self.suspicions.insert(source);
        self.suspicions.len()
    }

    /// The epoch a change is moving toward, if one is in flight.
    pub fn target(&self) -> Option<EpochNo> {
        self.target
    }

    /// Begin changing to `target`.
    pub fn start(&mut self, target: EpochNo) {
        self.target = Some(target);
    }

    /// Record a change vote from `source`. Returns the number of distinct
    /// change votes held.
    pub fn add_change(&mut self, source: NodeId, vote: ChangeVote) -> usize {
        self.changes.entry(source).or_insert(vote);
        self.changes.len()
    }

    /// Record an ack from `source` for `origin`'s change vote.
    pub fn add_ack(&mut self, source: NodeId, origin: NodeId) {
        self.acks.entry(origin).or_default().insert(source);
    }

    /// Change-vote origins whose votes hold a strong quorum of acks.
    pub fn certified(&self, quorum: usize) -> Vec<NodeId> {
        self.changes
            .keys()
            .filter(|origin| {
                self.acks
                    .get(origin)
                    .map(|sources| sources.len() >= quorum)
                    .unwrap_or(false)
            })
            .copied()
            .collect()
    }

    /// The highest stable checkpoint among the given certified origins.
    /// The new epoch starts above it.
    pub fn start_seq(&self, certified: &[NodeId]) -> (SeqNo, Vec<u8>) {
        certified
            .iter()
            .filter_map(|origin| self.changes.get(origin))
            .max_by_key(|vote| vote.stable_seq)
            .map(|vote| (vote.stable_seq, vote.stable_value.clone()))
            .unwrap_or((SeqNo::ZERO, Vec::new()))
    }

    /// Record an echo. Returns the number of distinct echoes for the
    /// announcement.
    pub fn add_echo(&mut self, source: NodeId, epoch: EpochNo, start_seq: SeqNo) -> usize {
        let sources = self.echoes.entry((epoch, start_seq)).or_default();
        sources.insert(source);
        sources.len()
    }

    /// Record a ready. Returns the number of distinct readies for the
    /// announcement.
    pub fn add_ready(&mut self, source: NodeId, epoch: EpochNo, start_seq: SeqNo) -> usize {
        let sources = self.readies.entry((epoch, start_seq)).or_default();
        sources.insert(source);
        sources.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suspicions_deduplicate() {
        let mut state = EpochChangeState::default();
        assert_eq!(state.add_suspicion(NodeId(0)), 1);
        assert_eq!(state.add_suspicion(NodeId(0)), 1);
        assert_eq!(state.add_suspicion(NodeId(1)), 2);
    }

    #[test]
    fn test_certification_requires_quorum_of_acks() {
        let mut state = EpochChangeState::default();
        state.start(EpochNo(1));
        state.add_change(
            NodeId(0),
            ChangeVote {
                stable_seq: SeqNo(20),
                stable_value: vec![1],
            },
        );
        state.add_ack(NodeId(1), NodeId(0));
        state.add_ack(NodeId(2), NodeId(0));
        assert!(state.certified(3).is_empty());
        state.add_ack(NodeId(3), NodeId(0));
        assert_eq!(state.certified(3), vec![NodeId(0)]);
    }

    #[test]
    fn test_start_seq_takes_highest_certified_stable() {
        let mut state = EpochChangeState::default();
        state.add_change(
            NodeId(0),
            ChangeVote {
                stable_seq: SeqNo(20),
                stable_value: vec![1],
            },
        );
        state.add_change(
            NodeId(1),
            ChangeVote {
                stable_seq: SeqNo(40),
                stable_value: vec![2],
            },
        );
        let (seq, value) = state.start_seq(&[NodeId(0), NodeId(1)]);
        assert_eq!(seq, SeqNo(40));
        assert_eq!(value, vec![2]);
    }

    #[test]
    fn test_echoes_keyed_by_announcement() {
        let mut state = EpochChangeState::default();
        assert_eq!(state.add_echo(NodeId(0), EpochNo(1), SeqNo(0)), 1);
        assert_eq!(state.add_echo(NodeId(1), EpochNo(1), SeqNo(20)), 1);
        assert_eq!(state.add_echo(NodeId(1), EpochNo(1), SeqNo(0)), 2);
    }
}
