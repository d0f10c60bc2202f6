//! In-memory collaborator implementations.
//!
//! These back the test suites and the trace tooling; production deployments
//! provide their own write-ahead log, transport, and application.

use conclave_core::{
    Application, CheckpointResult, Hasher, HashOrigin, NetworkTransport, RequestStore, WalStorage,
};
use conclave_types::{
    Batch, ClientId, Digest, Msg, NodeId, Persistent, Request, RequestAck, SeqNo,
};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;

/// Write-ahead log held in memory, with the same truncation semantics the
/// protocol expects from a durable implementation: truncation keeps the
/// newest checkpoint anchor at or below the target plus every record
/// governed by a later sequence.
#[derive(Debug)]
pub struct MemoryWal {
    entries: Vec<(u64, Persistent)>,
    next_index: u64,
}

impl Default for MemoryWal {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryWal {
    pub fn new() -> Self {
        MemoryWal {
            entries: Vec::new(),
            next_index: 1,
        }
    }

    /// Current log contents, for assertions.
    pub fn entries(&self) -> &[(u64, Persistent)] {
        &self.entries
    }
}

impl WalStorage for MemoryWal {
    fn load_all(&self, visit: &mut dyn FnMut(u64, &Persistent)) -> io::Result<()> {
        for (index, entry) in &self.entries {
            visit(*index, entry);
        }
        Ok(())
    }

    fn append(&mut self, entry: &Persistent) -> io::Result<u64> {
        let index = self.next_index;
        self.next_index += 1;
        self.entries.push((index, entry.clone()));
        Ok(index)
    }

    fn truncate(&mut self, to_seq: SeqNo) -> io::Result<()> {
        let anchor = self
            .entries
            .iter()
            .rposition(|(_, e)| matches!(e, Persistent::CEntry { seq, .. } if *seq <= to_seq));
        let kept: Vec<(u64, Persistent)> = self
            .entries
            .drain(..)
            .enumerate()
            .filter(|(pos, (_, e))| Some(*pos) == anchor || e.governing_seq() >= to_seq)
            .map(|(_, e)| e)
            .collect();
        self.entries = kept;
        Ok(())
    }

    fn sync(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A `MemoryWal` shared between a processor's WAL worker and the test that
/// wants to inspect or reuse its contents.
#[derive(Debug, Clone, Default)]
pub struct SharedWal(pub Arc<Mutex<MemoryWal>>);

impl SharedWal {
    pub fn new() -> Self {
        SharedWal(Arc::new(Mutex::new(MemoryWal::new())))
    }
}

impl WalStorage for SharedWal {
    fn load_all(&self, visit: &mut dyn FnMut(u64, &Persistent)) -> io::Result<()> {
        self.0.lock().load_all(visit)
    }

    fn append(&mut self, entry: &Persistent) -> io::Result<u64> {
        self.0.lock().append(entry)
    }

    fn truncate(&mut self, to_seq: SeqNo) -> io::Result<()> {
        self.0.lock().truncate(to_seq)
    }

    fn sync(&mut self) -> io::Result<()> {
        self.0.lock().sync()
    }
}

/// Transport that records every send, for single-node tests.
#[derive(Debug, Clone, Default)]
pub struct RecordingTransport {
    pub sent: Arc<Mutex<Vec<(Vec<NodeId>, Msg)>>>,
}

impl NetworkTransport for RecordingTransport {
    fn send(&mut self, targets: &[NodeId], msg: &Msg) {
        self.sent.lock().push((targets.to_vec(), msg.clone()));
    }
}

/// Transport that emits `(from, to, msg)` triples into a hub channel, for
/// multi-node tests wiring several processors together.
#[derive(Clone)]
pub struct RouterTransport {
    source: NodeId,
    outbox: tokio::sync::mpsc::UnboundedSender<(NodeId, NodeId, Msg)>,
}

/// Factory for [`RouterTransport`] endpoints sharing one delivery channel.
#[derive(Clone)]
pub struct RouterHub {
    tx: tokio::sync::mpsc::UnboundedSender<(NodeId, NodeId, Msg)>,
}

impl RouterHub {
    /// Create a hub; drain the receiver to deliver messages to peers.
    pub fn new() -> (
        RouterHub,
        tokio::sync::mpsc::UnboundedReceiver<(NodeId, NodeId, Msg)>,
    ) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        (RouterHub { tx }, rx)
    }

    /// An endpoint sending as `source`.
    pub fn endpoint(&self, source: NodeId) -> RouterTransport {
        RouterTransport {
            source,
            outbox: self.tx.clone(),
        }
    }
}

impl NetworkTransport for RouterTransport {
    fn send(&mut self, targets: &[NodeId], msg: &Msg) {
        for target in targets {
            let _ = self.outbox.send((self.source, *target, msg.clone()));
        }
    }
}

/// The reference hasher.
#[derive(Debug, Clone, Copy, Default)]
pub struct Blake3Hasher;

impl Hasher for Blake3Hasher {
    fn hash(&self, _origin: &HashOrigin, data: &[Vec<u8>]) -> Digest {
        let mut hasher = blake3::Hasher::new();
        for chunk in data {
            hasher.update(chunk);
        }
        Digest::new(*hasher.finalize().as_bytes())
    }
}

/// Application that records commits and snapshots a digest over them, so
/// every correct node derives the same checkpoint value.
#[derive(Debug, Clone, Default)]
pub struct DigestApplication {
    pub commits: Arc<Mutex<Vec<Batch>>>,
}

impl Application for DigestApplication {
    fn commit(&mut self, batch: &Batch) -> io::Result<()> {
        self.commits.lock().push(batch.clone());
        Ok(())
    }

    fn snapshot(&mut self, seq: SeqNo) -> io::Result<CheckpointResult> {
        let commits = self.commits.lock();
        let mut below: Vec<&Batch> = commits.iter().filter(|b| b.seq <= seq).collect();
        below.sort_by_key(|b| b.seq);
        let mut hasher = blake3::Hasher::new();
        hasher.update(&seq.0.to_le_bytes());
        for batch in below {
            hasher.update(batch.digest.as_bytes());
        }
        Ok(CheckpointResult {
            seq,
            value: hasher.finalize().as_bytes().to_vec(),
            attestation: Vec::new(),
        })
    }

    fn transfer_to(&mut self, _seq: SeqNo, _value: &[u8]) -> io::Result<()> {
        Ok(())
    }
}

/// Request store keeping payloads in memory and digesting them with blake3.
#[derive(Debug, Default)]
pub struct MemoryRequestStore {
    payloads: BTreeMap<(ClientId, u64), Vec<u8>>,
    correct: BTreeMap<(ClientId, u64), Digest>,
    applied_below: SeqNo,
}

impl RequestStore for MemoryRequestStore {
    fn store(&mut self, request: Request) {
        self.payloads
            .insert((request.client, request.req_no), request.data);
    }

    fn validate(&mut self, client: ClientId, req_no: u64) -> Option<RequestAck> {
        let data = self.payloads.get(&(client, req_no))?;
        let digest = Digest::new(*blake3::hash(data).as_bytes());
        Some(RequestAck {
            client,
            req_no,
            digest,
        })
    }

    fn fetch(&self, client: ClientId, req_no: u64) -> Option<Request> {
        self.payloads.get(&(client, req_no)).map(|data| Request {
            client,
            req_no,
            data: data.clone(),
        })
    }

    fn mark_correct(&mut self, ack: &RequestAck) {
        self.correct.insert((ack.client, ack.req_no), ack.digest);
    }

    fn applied(&mut self, seq: SeqNo) {
        self.applied_below = seq;
    }
}

/// A `MemoryRequestStore` shared between a processor and the test that
/// wants to observe payload arrival.
#[derive(Debug, Clone, Default)]
pub struct SharedMemoryRequestStore(pub Arc<Mutex<MemoryRequestStore>>);

impl RequestStore for SharedMemoryRequestStore {
    fn store(&mut self, request: Request) {
        self.0.lock().store(request);
    }

    fn validate(&mut self, client: ClientId, req_no: u64) -> Option<RequestAck> {
        self.0.lock().validate(client, req_no)
    }

    fn fetch(&self, client: ClientId, req_no: u64) -> Option<Request> {
        self.0.lock().fetch(client, req_no)
    }

    fn mark_correct(&mut self, ack: &RequestAck) {
        self.0.lock().mark_correct(ack);
    }

    fn applied(&mut self, seq: SeqNo) {
        self.0.lock().applied(seq);
    }
}

impl MemoryRequestStore {
    /// Highest sequence the application has reported durably applied.
    pub fn applied_floor(&self) -> SeqNo {
        self.applied_below
    }
}
