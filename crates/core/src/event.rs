//! Event types for the deterministic state machine.

use crate::HashOrigin;
use conclave_types::{Digest, Msg, NetworkState, NodeId, Persistent, Request, RequestAck, SeqNo};
use sbor::prelude::*;

/// The digest computed for a prior `Action::Hash`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, BasicSbor)]
pub struct HashResult {
    /// The hash request this digest answers.
    pub origin: HashOrigin,

    /// The computed digest.
    pub digest: Digest,
}

/// The application's snapshot for a prior `Action::Checkpoint`.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct CheckpointResult {
    /// The checkpoint boundary that was snapshotted.
    pub seq: SeqNo,

    /// The application's state value at the boundary.
    pub value: Vec<u8>,

    /// This node's attestation over the value.
    pub attestation: Vec<u8>,
}

/// Completions of previously delegated work, fed back in one event.
#[derive(Debug, Clone, PartialEq, Eq, Default, BasicSbor)]
pub struct ActionResults {
    /// Completed hash computations.
    pub digests: Vec<HashResult>,

    /// Completed application snapshots.
    pub checkpoints: Vec<CheckpointResult>,
}

/// All possible inputs to the state machine.
///
/// Events are **passive data**: they describe something that happened. The
/// state machine applies them one at a time and returns actions.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub enum Event {
    // ═══════════════════════════════════════════════════════════════════════
    // Lifecycle
    // ═══════════════════════════════════════════════════════════════════════
    /// Install the initial network state. Must be the first event applied to
    /// a fresh machine.
    Initialize { network_state: NetworkState },

    /// Replay one persisted log record. Only valid between `Initialize` and
    /// `CompleteInitialization`.
    LoadEntry { index: u64, entry: Persistent },

    /// Recovery is complete; re-derive pending work from replayed state.
    CompleteInitialization,

    // ═══════════════════════════════════════════════════════════════════════
    // External inputs
    // ═══════════════════════════════════════════════════════════════════════
    /// Logical clock tick. Drives batch cutting, retransmission, and leader
    /// suspicion; the machine never reads a wall clock.
    Tick,

    /// A protocol message received from another node.
    Step { source: NodeId, msg: Msg },

    /// A client request submitted locally for ordering.
    Propose { request: Request },

    // ═══════════════════════════════════════════════════════════════════════
    // Worker completions
    // ═══════════════════════════════════════════════════════════════════════
    /// Results of delegated hash and checkpoint work.
    AddResults { results: ActionResults },

    /// The request store validated and durably stored a request payload.
    RequestPersisted { ack: RequestAck },

    /// The dispatcher took a batch of emitted actions.
    ActionsReceived,

    /// The application finished adopting transferred state at `(seq, value)`.
    Transfer { seq: SeqNo, value: Vec<u8> },
}

impl Event {
    /// Get the event type name.
    pub fn type_name(&self) -> &'static str {
        match self {
            Event::Initialize { .. } => "Initialize",
            Event::LoadEntry { .. } => "LoadEntry",
            Event::CompleteInitialization => "CompleteInitialization",
            Event::Tick => "Tick",
            Event::Step { .. } => "Step",
            Event::Propose { .. } => "Propose",
            Event::AddResults { .. } => "AddResults",
            Event::RequestPersisted { .. } => "RequestPersisted",
            Event::ActionsReceived => "ActionsReceived",
            Event::Transfer { .. } => "Transfer",
        }
    }

    /// All event type names. Used by trace tooling.
    pub const ALL_TYPE_NAMES: &'static [&'static str] = &[
        "Initialize",
        "LoadEntry",
        "CompleteInitialization",
        "Tick",
        "Step",
        "Propose",
        "AddResults",
        "RequestPersisted",
        "ActionsReceived",
        "Transfer",
    ];
}
