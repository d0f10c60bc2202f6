//! Comparable state snapshots.
//!
//! The status exposes the *persisted projection* of the machine: exactly
//! the facts reconstructible by replaying the write-ahead log. Volatile
//! quorum counters are deliberately absent, which is what makes a freshly
//! replayed machine compare equal to the one that wrote the log.

use conclave_types::{ClientConfig, Digest, EpochNo, NodeId, SeqNo};

/// Lifecycle phase of the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachinePhase {
    /// No `Initialize` applied yet.
    Uninitialized,
    /// Between `Initialize` and `CompleteInitialization`.
    Recovering,
    /// Processing external events.
    Active,
}

/// Persisted view of one slot: the batch digest this node attested to, and
/// whether a prepare certificate was persisted for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotStatus {
    pub seq: SeqNo,
    pub digest: Digest,
    pub prepared: bool,
}

/// A snapshot of the state machine's persisted state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateMachineStatus {
    pub node_id: NodeId,
    pub phase: MachinePhase,
    pub epoch: EpochNo,
    /// Stable floor: no state is retained at or below it.
    pub floor: SeqNo,
    /// Newest network-stable checkpoint.
    pub latest_stable: SeqNo,
    /// Value of the newest network-stable checkpoint.
    pub stable_value: Vec<u8>,
    /// Slots this node has attested to, in sequence order.
    pub slots: Vec<SlotStatus>,
    /// Client windows as of the last stable checkpoint.
    pub clients: Vec<ClientConfig>,
    /// Open checkpoint window boundaries.
    pub checkpoint_boundaries: Vec<SeqNo>,
}
