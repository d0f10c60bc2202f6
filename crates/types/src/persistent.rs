//! Write-ahead-log record kinds.

use crate::{Digest, EpochNo, NetworkState, RequestAck, SeqNo};
use sbor::prelude::*;

/// A record persisted to the write-ahead log.
///
/// Records are appended in submission order with a monotonic index assigned
/// by the log. Replaying the persisted prefix in index order reconstructs
/// the state machine that wrote it.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub enum Persistent {
    /// A checkpoint: the anchor every replay starts from.
    ///
    /// Carries the network state as of the checkpoint, including advanced
    /// client watermarks.
    CEntry {
        seq: SeqNo,
        value: Vec<u8>,
        epoch: EpochNo,
        network_state: NetworkState,
    },

    /// A preprepared batch: this node attested to the batch at the slot.
    QEntry {
        seq: SeqNo,
        epoch: EpochNo,
        digest: Digest,
        requests: Vec<RequestAck>,
    },

    /// A prepared slot: this node observed a prepare quorum for the digest.
    PEntry {
        seq: SeqNo,
        epoch: EpochNo,
        digest: Digest,
    },

    /// Adoption of a new epoch configuration.
    NewEpoch { epoch: EpochNo, start_seq: SeqNo },

    /// This node's epoch-change vote.
    EpochChange {
        new_epoch: EpochNo,
        stable_seq: SeqNo,
    },

    /// This node's suspicion of the current epoch.
    Suspect { epoch: EpochNo },
}

impl Persistent {
    /// Get the record type name.
    pub fn type_name(&self) -> &'static str {
        match self {
            Persistent::CEntry { .. } => "CEntry",
            Persistent::QEntry { .. } => "QEntry",
            Persistent::PEntry { .. } => "PEntry",
            Persistent::NewEpoch { .. } => "NewEpoch",
            Persistent::EpochChange { .. } => "EpochChange",
            Persistent::Suspect { .. } => "Suspect",
        }
    }

    /// The sequence number governing this record's lifetime in the log.
    ///
    /// Truncation drops records whose governing sequence falls below the
    /// stable checkpoint; records tied to no slot report zero and are
    /// dropped at the first truncation after them.
    pub fn governing_seq(&self) -> SeqNo {
        match self {
            Persistent::CEntry { seq, .. } => *seq,
            Persistent::QEntry { seq, .. } => *seq,
            Persistent::PEntry { seq, .. } => *seq,
            Persistent::NewEpoch { start_seq, .. } => *start_seq,
            Persistent::EpochChange { stable_seq, .. } => *stable_seq,
            Persistent::Suspect { .. } => SeqNo::ZERO,
        }
    }
}
