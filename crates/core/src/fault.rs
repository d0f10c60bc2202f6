//! Fatal protocol invariant violations.

use crate::HashOrigin;
use conclave_types::{ClientId, ConfigError, SeqNo};
use thiserror::Error;

/// A fatal fault in the state machine.
///
/// Every variant is either a caller bug or evidence that the Byzantine
/// assumptions were violated. There is no recovery: the processor records
/// the fault as its terminal cause and shuts down.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Fault {
    #[error("state machine already initialized")]
    AlreadyInitialized,

    #[error("{event} applied before Initialize")]
    NotInitialized { event: &'static str },

    #[error("{event} applied during recovery, before CompleteInitialization")]
    StillRecovering { event: &'static str },

    #[error("LoadEntry applied after initialization completed")]
    LoadAfterComplete,

    #[error("log replay out of order: index {index} after {previous}")]
    ReplayOutOfOrder { index: u64, previous: u64 },

    #[error("invalid network state: {0}")]
    InvalidNetworkState(#[from] ConfigError),

    #[error("propose for unknown client {client}")]
    UnknownClient { client: ClientId },

    #[error("hash result for origin {origin:?} matches no in-flight hash request")]
    UnexpectedHashResult { origin: HashOrigin },

    #[error("checkpoint result for seq {seq} matches no open checkpoint window")]
    UnexpectedCheckpointResult { seq: SeqNo },

    #[error(
        "local checkpoint at seq {seq} disagrees with the committed network value \
         (safety violation: local={local:02x?} committed={committed:02x?})"
    )]
    CheckpointDisagreement {
        seq: SeqNo,
        local: Vec<u8>,
        committed: Vec<u8>,
    },
}
