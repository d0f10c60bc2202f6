//! Core types for the Conclave consensus protocol.
//!
//! This crate provides the foundational types used throughout the consensus
//! implementation:
//!
//! - **Identifiers**: [`SeqNo`], [`NodeId`], [`ClientId`], [`BucketId`]
//! - **Digests**: [`Digest`], the opaque 32-byte content hash
//! - **Configuration**: [`NetworkConfig`], [`ClientConfig`], [`NetworkState`]
//! - **Requests**: [`Request`], [`RequestAck`], [`Batch`]
//! - **Protocol messages**: the [`Msg`] wire enum
//! - **Persistence**: the [`Persistent`] write-ahead-log record enum
//!
//! # Design Philosophy
//!
//! This crate is self-contained and does not depend on any other workspace
//! crates, making it the foundation layer. All types are plain data: no
//! methods here perform I/O, hashing, or protocol logic.

mod config;
mod digest;
mod identifiers;
mod message;
mod persistent;
mod request;

pub use config::{standard_initial_network_state, ClientConfig, ConfigError, NetworkConfig, NetworkState};
pub use digest::Digest;
pub use identifiers::{BucketId, ClientId, EpochNo, NodeId, SeqNo};
pub use message::Msg;
pub use persistent::Persistent;
pub use request::{batch_hash_chunks, Batch, Request, RequestAck};
