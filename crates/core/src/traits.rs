//! Contracts for the collaborators surrounding the state machine.
//!
//! The core performs no I/O, cryptography, or transport itself; it describes
//! what must happen via actions. These traits are the seams where concrete
//! write-ahead logs, transports, hashers, applications, and request stores
//! plug in. In-memory implementations for tests live in the processor crate.

use crate::{CheckpointResult, Event, HashOrigin};
use conclave_types::{Batch, ClientId, Digest, Msg, NodeId, Persistent, Request, RequestAck, SeqNo};
use std::io;

/// Observes every event in the order the state machine applies it.
///
/// Because the machine is a pure function of its event trace, recording the
/// trace is enough to reproduce every decision offline.
pub trait EventInterceptor: Send {
    fn intercept(&mut self, event: &Event) -> io::Result<()>;
}

/// Durable storage for the write-ahead log.
pub trait WalStorage: Send {
    /// Invoke `visit` with each persisted record in index order, stopping at
    /// the first error.
    fn load_all(&self, visit: &mut dyn FnMut(u64, &Persistent)) -> io::Result<()>;

    /// Append a record, returning its assigned index. Indices are monotonic
    /// across the life of the log, surviving truncation.
    fn append(&mut self, entry: &Persistent) -> io::Result<u64>;

    /// Drop records whose governing sequence falls below `to_seq`, keeping
    /// the newest checkpoint record at or below it.
    fn truncate(&mut self, to_seq: SeqNo) -> io::Result<()>;

    /// Make all prior appends durable.
    fn sync(&mut self) -> io::Result<()>;
}

/// Fire-and-forget message transport.
///
/// Failures surface as later absence of messages, never as errors into the
/// state machine; the tick-driven retransmit path covers losses.
pub trait NetworkTransport: Send {
    fn send(&mut self, targets: &[NodeId], msg: &Msg);
}

/// Deterministic content hashing.
pub trait Hasher: Send {
    /// Digest the given chunks. Must be a pure function of `data`; `origin`
    /// is provided for domain separation only.
    fn hash(&self, origin: &HashOrigin, data: &[Vec<u8>]) -> Digest;
}

/// The replicated application the core orders batches for.
pub trait Application: Send {
    /// Apply a committed batch. Batches arrive in sequence order.
    fn commit(&mut self, batch: &Batch) -> io::Result<()>;

    /// Snapshot application state at a checkpoint boundary.
    fn snapshot(&mut self, seq: SeqNo) -> io::Result<CheckpointResult>;

    /// Adopt remote state at `(seq, value)`, discarding local state above it.
    fn transfer_to(&mut self, seq: SeqNo, value: &[u8]) -> io::Result<()>;
}

/// Storage and validation for client request payloads.
///
/// Request data never enters the state machine; the store holds it and the
/// machine tracks only acknowledgements.
pub trait RequestStore: Send {
    /// Store a raw request payload ahead of validation.
    fn store(&mut self, request: Request);

    /// Validate the stored payload for `(client, req_no)` and produce an
    /// acknowledgement, or `None` to reject.
    fn validate(&mut self, client: ClientId, req_no: u64) -> Option<RequestAck>;

    /// Retrieve the stored payload for `(client, req_no)`, if it is still
    /// held. Backs payload forwarding to nodes that fetch a request they
    /// only know through acks.
    fn fetch(&self, client: ClientId, req_no: u64) -> Option<Request>;

    /// Record that a weak quorum attests to this digest; forwarded payloads
    /// matching it may be accepted as authoritative.
    fn mark_correct(&mut self, ack: &RequestAck);

    /// Payloads ordered at or below `seq` are durably applied and may be
    /// garbage-collected.
    fn applied(&mut self, seq: SeqNo);
}
