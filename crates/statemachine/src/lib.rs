//! Deterministic state machine for the Conclave consensus protocol.
//!
//! This crate implements the protocol logic as a synchronous, event-driven
//! state machine:
//!
//! ```text
//! Event → StateMachine::apply() → Result<ActionList, Fault>
//! ```
//!
//! The machine is a pure function of its event trace: no clock, no
//! randomness, no iteration over unordered containers anywhere a decision
//! is observable. Two machines fed the same events produce byte-identical
//! action lists, which is what makes record/replay debugging and crash
//! recovery work.
//!
//! # Structure
//!
//! - [`StateMachine`]: the driver, one `apply` call per event
//! - [`CheckpointWindow`]: quorum aggregation of checkpoint attestations
//! - [`EpochConfig`] / [`ActiveEpoch`]: leader assignment and the
//!   three-phase slot protocol
//! - [`ClientWindows`]: sliding per-client request windows
//! - [`replay_events`]: reconstruction from a persisted log prefix
//!
//! # Ordering model
//!
//! Sequence numbers are partitioned into buckets (`seq mod num_buckets`);
//! each bucket has exactly one leader per epoch, so every leader batches and
//! preprepares independently. Checkpoints every `checkpoint_interval` slots
//! bound the active window and garbage-collect history two checkpoints
//! behind the committed head.

mod checkpoint;
mod clients;
mod epoch;
mod epoch_change;
mod machine;
mod replay;
mod sequence;
mod status;

pub use checkpoint::{CheckpointWindow, NodeAttestation};
pub use clients::{ClientWindows, ProposeOutcome};
pub use epoch::{ActiveEpoch, EpochConfig, StepOutcome};
pub use machine::{MachineConfig, StateMachine};
pub use replay::replay_events;
pub use sequence::{Slot, SlotPhase};
pub use status::{MachinePhase, SlotStatus, StateMachineStatus};
