//! Processor: the asynchronous shell around the deterministic state
//! machine.
//!
//! # Architecture
//!
//! A single serializer task owns the state machine and is the only task
//! that mutates it. Workers run in parallel, one per stream:
//!
//! ```text
//! submissions ──┐
//!               ▼
//!        ┌───────────────┐  actions   ┌───────────────────────────┐
//!        │  Serializer   │───────────▶│ WAL / Net / Hash / Client │
//!        │ (state machine│            │ / App workers             │
//!        │  + WorkItems) │◀───────────│ completions → events      │
//!        └───────────────┘            └───────────────────────────┘
//! ```
//!
//! Work moves as owned batches over bounded channels; there is no shared
//! mutable state between the serializer and the workers apart from the
//! request store, which the submission path also writes payloads into.
//!
//! # Ordering
//!
//! Within each stream, actions keep their emission order. Across streams no
//! order is promised, with one causal exception: persist-dependent sends
//! ride the WAL stream and reach the network stream only after the WAL
//! worker acknowledges the covering persist. See [`work_items`].

mod processor;
pub mod work_items;
mod workers;

#[cfg(any(test, feature = "test-utils"))]
pub mod testutil;

pub use processor::{Processor, ProcessorBuilder, ProcessorError};
pub(crate) use processor::WorkerResult;
pub use work_items::{stream_of, Stream, WorkItems};
pub use workers::SharedRequestStore;
