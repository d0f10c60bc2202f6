//! Client requests, acknowledgements, and ordered batches.

use crate::{ClientId, Digest, SeqNo};
use sbor::prelude::*;

/// A client request submitted for ordering.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct Request {
    /// Submitting client.
    pub client: ClientId,

    /// Request number within the client's sliding window.
    pub req_no: u64,

    /// Opaque request payload.
    pub data: Vec<u8>,
}

/// A node's acknowledgement that it holds and has validated a request.
///
/// The digest covers the request payload; request data itself never travels
/// through the consensus state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, BasicSbor)]
pub struct RequestAck {
    /// Submitting client.
    pub client: ClientId,

    /// Request number within the client's window.
    pub req_no: u64,

    /// Digest of the request payload.
    pub digest: Digest,
}

/// A batch of request acknowledgements ordered at a sequence slot.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct Batch {
    /// The slot this batch was ordered at.
    pub seq: SeqNo,

    /// Digest over the batch contents (see [`batch_hash_chunks`]).
    pub digest: Digest,

    /// The ordered request acknowledgements. May be empty for filler slots.
    pub requests: Vec<RequestAck>,
}

/// Byte chunks fed to the hasher to derive a batch digest.
///
/// Every node must derive the identical digest for the same acks, so the
/// encoding is fixed: per ack, the client id, the request number, and the
/// request digest, all little-endian, in batch order.
pub fn batch_hash_chunks(requests: &[RequestAck]) -> Vec<Vec<u8>> {
    let mut chunks = Vec::with_capacity(requests.len() * 3);
    for ack in requests {
        chunks.push(ack.client.0.to_le_bytes().to_vec());
        chunks.push(ack.req_no.to_le_bytes().to_vec());
        chunks.push(ack.digest.as_bytes().to_vec());
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_chunks_are_order_sensitive() {
        let a = RequestAck {
            client: ClientId(0),
            req_no: 0,
            digest: Digest::new([1; 32]),
        };
        let b = RequestAck {
            client: ClientId(1),
            req_no: 4,
            digest: Digest::new([2; 32]),
        };
        assert_ne!(batch_hash_chunks(&[a, b]), batch_hash_chunks(&[b, a]));
        assert_eq!(batch_hash_chunks(&[]).len(), 0);
        assert_eq!(batch_hash_chunks(&[a, b]).len(), 6);
    }
}
