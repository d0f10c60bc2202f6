//! Protocol messages exchanged between nodes.

use crate::{ClientId, Digest, EpochNo, NodeId, Request, RequestAck, SeqNo};
use sbor::prelude::*;

/// The consensus wire protocol.
///
/// Wire identity of these variants is load-bearing for interoperability;
/// renaming or renumbering a variant is a protocol change.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub enum Msg {
    /// The bucket leader's proposal of a batch at a slot.
    Preprepare {
        seq: SeqNo,
        epoch: EpochNo,
        batch: Vec<RequestAck>,
    },

    /// A replica's attestation to a preprepared batch digest.
    Prepare {
        seq: SeqNo,
        epoch: EpochNo,
        digest: Digest,
    },

    /// A node's attestation that a slot is prepared and may commit.
    Commit {
        seq: SeqNo,
        epoch: EpochNo,
        digest: Digest,
    },

    /// A node's attestation of its application state at a checkpoint boundary.
    Checkpoint {
        seq: SeqNo,
        value: Vec<u8>,
        attestation: Vec<u8>,
    },

    /// A node's declaration that the current epoch's progress is suspect.
    Suspect { epoch: EpochNo },

    /// A node's vote to move to a new epoch, carrying its stable state.
    EpochChange {
        new_epoch: EpochNo,
        stable_seq: SeqNo,
        stable_value: Vec<u8>,
    },

    /// Acknowledgement of another node's epoch-change vote.
    EpochChangeAck {
        new_epoch: EpochNo,
        /// The node whose epoch-change vote is being acknowledged.
        origin: NodeId,
    },

    /// The new primary's epoch configuration announcement.
    NewEpoch { new_epoch: EpochNo, start_seq: SeqNo },

    /// First phase of new-epoch confirmation.
    NewEpochEcho { new_epoch: EpochNo, start_seq: SeqNo },

    /// Second phase of new-epoch confirmation.
    NewEpochReady { new_epoch: EpochNo, start_seq: SeqNo },

    /// Request for the batch preprepared at a slot.
    FetchBatch { seq: SeqNo, digest: Digest },

    /// Response carrying a previously preprepared batch.
    ForwardBatch {
        seq: SeqNo,
        digest: Digest,
        requests: Vec<RequestAck>,
    },

    /// Request for the payload of a client request.
    FetchRequest { client: ClientId, req_no: u64 },

    /// Response carrying a client request's payload.
    ForwardRequest { request: Request, digest: Digest },

    /// A node's acknowledgement that it holds a validated client request.
    RequestAck(RequestAck),
}

impl Msg {
    /// Get the message type name.
    pub fn type_name(&self) -> &'static str {
        match self {
            Msg::Preprepare { .. } => "Preprepare",
            Msg::Prepare { .. } => "Prepare",
            Msg::Commit { .. } => "Commit",
            Msg::Checkpoint { .. } => "Checkpoint",
            Msg::Suspect { .. } => "Suspect",
            Msg::EpochChange { .. } => "EpochChange",
            Msg::EpochChangeAck { .. } => "EpochChangeAck",
            Msg::NewEpoch { .. } => "NewEpoch",
            Msg::NewEpochEcho { .. } => "NewEpochEcho",
            Msg::NewEpochReady { .. } => "NewEpochReady",
            Msg::FetchBatch { .. } => "FetchBatch",
            Msg::ForwardBatch { .. } => "ForwardBatch",
            Msg::FetchRequest { .. } => "FetchRequest",
            Msg::ForwardRequest { .. } => "ForwardRequest",
            Msg::RequestAck(_) => "RequestAck",
        }
    }

    /// All message type names, in wire order. Used by trace tooling.
    pub const ALL_TYPE_NAMES: &'static [&'static str] = &[
        "Preprepare",
        "Prepare",
        "Commit",
        "Checkpoint",
        "Suspect",
        "EpochChange",
        "EpochChangeAck",
        "NewEpoch",
        "NewEpochEcho",
        "NewEpochReady",
        "FetchBatch",
        "ForwardBatch",
        "FetchRequest",
        "ForwardRequest",
        "RequestAck",
    ];
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_names_cover_every_variant() {
        let msgs = [
            Msg::Preprepare {
                seq: SeqNo(1),
                epoch: EpochNo(0),
                batch: vec![],
            },
            Msg::Prepare {
                seq: SeqNo(1),
                epoch: EpochNo(0),
                digest: Digest::ZERO,
            },
            Msg::Commit {
                seq: SeqNo(1),
                epoch: EpochNo(0),
                digest: Digest::ZERO,
            },
            Msg::Checkpoint {
                seq: SeqNo(20),
                value: vec![],
                attestation: vec![],
            },
            Msg::Suspect { epoch: EpochNo(0) },
            Msg::EpochChange {
                new_epoch: EpochNo(1),
                stable_seq: SeqNo(0),
                stable_value: vec![],
            },
            Msg::EpochChangeAck {
                new_epoch: EpochNo(1),
                origin: NodeId(0),
            },
            Msg::NewEpoch {
                new_epoch: EpochNo(1),
                start_seq: SeqNo(0),
            },
            Msg::NewEpochEcho {
                new_epoch: EpochNo(1),
                start_seq: SeqNo(0),
            },
            Msg::NewEpochReady {
                new_epoch: EpochNo(1),
                start_seq: SeqNo(0),
            },
            Msg::FetchBatch {
                seq: SeqNo(1),
                digest: Digest::ZERO,
            },
            Msg::ForwardBatch {
                seq: SeqNo(1),
                digest: Digest::ZERO,
                requests: vec![],
            },
            Msg::FetchRequest {
                client: ClientId(0),
                req_no: 0,
            },
            Msg::ForwardRequest {
                request: Request {
                    client: ClientId(0),
                    req_no: 0,
                    data: vec![],
                },
                digest: Digest::ZERO,
            },
            Msg::RequestAck(RequestAck {
                client: ClientId(0),
                req_no: 0,
                digest: Digest::ZERO,
            }),
        ];
        for msg in &msgs {
            assert!(Msg::ALL_TYPE_NAMES.contains(&msg.type_name()));
        }
        assert_eq!(msgs.len(), Msg::ALL_TYPE_NAMES.len());
    }
}
