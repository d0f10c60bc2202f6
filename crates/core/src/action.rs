//! Action types for the deterministic state machine.

use conclave_types::{Batch, ClientId, Msg, NodeId, Persistent, RequestAck, SeqNo};
use sbor::prelude::*;

/// Identifies the request that caused a hash computation, so the resulting
/// digest can be routed back to the right slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, BasicSbor)]
pub enum HashOrigin {
    /// Digest of the batch being ordered at a slot.
    Batch { seq: SeqNo },

    /// Re-derivation of a forwarded batch's digest before adoption.
    VerifyBatch { seq: SeqNo },
}

/// Actions the state machine wants performed.
///
/// Actions are **commands**: they describe something to do. The processor
/// routes each action to one of five worker streams and feeds results back
/// as events.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub enum Action {
    // ═══════════════════════════════════════════════════════════════════════
    // Network
    // ═══════════════════════════════════════════════════════════════════════
    /// Send a protocol message to a set of nodes.
    ///
    /// Most message types may only be emitted onto the network after the
    /// decision that produced them has been persisted; the dispatcher
    /// enforces that ordering, not the transport.
    Send { targets: Vec<NodeId>, msg: Msg },

    // ═══════════════════════════════════════════════════════════════════════
    // Hashing (delegated, returns a result event)
    // ═══════════════════════════════════════════════════════════════════════
    /// Compute a digest over the given chunks.
    ///
    /// Returns via `Event::AddResults` carrying a `HashResult` for `origin`.
    Hash {
        data: Vec<Vec<u8>>,
        origin: HashOrigin,
    },

    // ═══════════════════════════════════════════════════════════════════════
    // Write-ahead log
    // ═══════════════════════════════════════════════════════════════════════
    /// Append a record to the write-ahead log.
    AppendWriteAhead { entry: Persistent },

    /// Drop log records below the stable checkpoint at `to_seq`.
    TruncateWriteAhead { to_seq: SeqNo },

    // ═══════════════════════════════════════════════════════════════════════
    // Application
    // ═══════════════════════════════════════════════════════════════════════
    /// Deliver a committed batch to the application, in sequence order.
    Commit { batch: Batch },

    /// Ask the application to snapshot its state at a checkpoint boundary.
    ///
    /// Returns via `Event::AddResults` carrying a `CheckpointResult`.
    Checkpoint { seq: SeqNo },

    /// Ask the application to adopt remote state at `(seq, value)`.
    ///
    /// Returns via `Event::Transfer` once the application has caught up.
    StateTransfer { seq: SeqNo, value: Vec<u8> },

    // ═══════════════════════════════════════════════════════════════════════
    // Request store
    // ═══════════════════════════════════════════════════════════════════════
    /// A client request number was allocated in its window; the request
    /// store should validate the stored payload and reply with an ack.
    ///
    /// Returns via `Event::RequestPersisted`.
    AllocatedRequest { client: ClientId, req_no: u64 },

    /// A weak quorum attests to this request digest; the request store may
    /// treat payloads matching it as authoritative.
    CorrectRequest { ack: RequestAck },

    /// The application has durably applied state up to `seq`; request
    /// payloads ordered at or below it may be garbage-collected.
    StateApplied { seq: SeqNo },

    /// Forward a stored request payload to the node that asked for it.
    ///
    /// Rides the WAL stream like the `Msg::ForwardRequest` send it becomes;
    /// the network worker resolves the payload from the request store once
    /// the covering persists have landed.
    ForwardRequest { target: NodeId, ack: RequestAck },
}

impl Action {
    /// Get the action type name.
    pub fn type_name(&self) -> &'static str {
        match self {
            Action::Send { .. } => "Send",
            Action::Hash { .. } => "Hash",
            Action::AppendWriteAhead { .. } => "AppendWriteAhead",
            Action::TruncateWriteAhead { .. } => "TruncateWriteAhead",
            Action::Commit { .. } => "Commit",
            Action::Checkpoint { .. } => "Checkpoint",
            Action::StateTransfer { .. } => "StateTransfer",
            Action::AllocatedRequest { .. } => "AllocatedRequest",
            Action::CorrectRequest { .. } => "CorrectRequest",
            Action::StateApplied { .. } => "StateApplied",
            Action::ForwardRequest { .. } => "ForwardRequest",
        }
    }
}
