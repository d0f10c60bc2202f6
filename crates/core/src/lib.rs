//! Event and action alphabets for the Conclave consensus core.
//!
//! The consensus core is built on a simple event-driven model:
//!
//! ```text
//! Events → StateMachine::apply() → Actions
//! ```
//!
//! The state machine is:
//! - **Synchronous**: no async, no suspension mid-event
//! - **Deterministic**: same state + event trace = byte-identical actions
//! - **Pure-ish**: mutates itself, but performs no I/O
//!
//! All I/O is handled by the processor, which:
//! 1. Delivers events to the state machine
//! 2. Routes the returned actions to worker streams
//! 3. Converts worker completions back into events
//!
//! This crate defines:
//!
//! - [`Event`]: all possible inputs to the state machine
//! - [`Action`]: all possible outputs from the state machine
//! - [`EventList`] / [`ActionList`]: move-only ordered batches
//! - [`Fault`]: fatal protocol invariant violations
//! - Collaborator contracts: [`WalStorage`], [`NetworkTransport`],
//!   [`Hasher`], [`Application`], [`RequestStore`]

mod action;
mod event;
mod fault;
mod list;
mod traits;

pub use action::{Action, HashOrigin};
pub use event::{ActionResults, CheckpointResult, Event, HashResult};
pub use fault::Fault;
pub use list::{ActionList, EventList};
pub use traits::{
    Application, EventInterceptor, Hasher, NetworkTransport, RequestStore, WalStorage,
};
