//! Per-client request windows.
//!
//! Each client has a sliding window of request numbers it may submit. The
//! window tracks which numbers this node has validated (its own ack), which
//! have gathered a weak quorum of acks across the network (correct), and
//! which have been committed. The low watermark advances past the committed
//! prefix at checkpoint time, which is what makes the advance deterministic
//! across nodes.

use conclave_types::{ClientConfig, ClientId, Digest, NodeId, RequestAck};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Outcome of checking a proposal against the client's window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProposeOutcome {
    /// The request number is fresh and inside the window.
    Allocate,
    /// Below the low watermark; the request was already retired.
    BelowWatermark,
    /// At or beyond the high end of the window.
    BeyondWindow,
    /// Already allocated or acked.
    Duplicate,
}

#[derive(Debug, Clone, Default)]
struct RequestState {
    /// An `AllocatedRequest` was emitted; validation is in flight.
    allocated: bool,
    /// Digest from our own validation, if the payload is stored locally.
    own_digest: Option<Digest>,
    /// Digest certified by a weak quorum of acks.
    correct: Option<Digest>,
    /// The request was committed in an ordered batch.
    committed: bool,
    /// Ack sources per digest.
    acks: BTreeMap<Digest, BTreeSet<NodeId>>,
}

#[derive(Debug, Clone)]
struct ClientWindow {
    width: u64,
    low_watermark: u64,
    requests: BTreeMap<u64, RequestState>,
}

impl ClientWindow {
    fn in_window(&self, req_no: u64) -> bool {
        req_no >= self.low_watermark && req_no < self.low_watermark + self.width
    }
}

/// All client windows, keyed by client id.
#[derive(Debug, Clone, Default)]
pub struct ClientWindows {
    clients: BTreeMap<ClientId, ClientWindow>,
}

impl ClientWindows {
    /// Build windows from client configurations.
    pub fn from_configs(configs: &[ClientConfig]) -> Self {
        let clients = configs
            .iter()
            .map(|c| {
                (
                    c.id,
                    ClientWindow {
                        width: c.width,
                        low_watermark: c.low_watermark,
                        requests: BTreeMap::new(),
                    },
                )
            })
            .collect();
        ClientWindows { clients }
    }

    /// Replace all windows from configurations, discarding volatile state.
    /// Used when replaying a checkpoint record.
    pub fn install_configs(&mut self, configs: &[ClientConfig]) {
        *self = Self::from_configs(configs);
    }

    /// Check whether a client is known.
    pub fn contains(&self, client: ClientId) -> bool {
        self.clients.contains_key(&client)
    }

    /// Classify a local proposal for `(client, req_no)`.
    pub fn propose_outcome(&self, client: ClientId, req_no: u64) -> ProposeOutcome {
        let Some(window) = self.clients.get(&client) else {
            return ProposeOutcome::BeyondWindow;
        };
        if req_no < window.low_watermark {
            return ProposeOutcome::BelowWatermark;
        }
        if !window.in_window(req_no) {
            return ProposeOutcome::BeyondWindow;
        }
        match window.requests.get(&req_no) {
            Some(state) if state.allocated || state.own_digest.is_some() => {
                ProposeOutcome::Duplicate
            }
            _ => ProposeOutcome::Allocate,
        }
    }

    /// Mark `(client, req_no)` as allocated, with validation in flight.
    pub fn mark_allocated(&mut self, client: ClientId, req_no: u64) {
        if let Some(window) = self.clients.get_mut(&client) {
            window.requests.entry(req_no).or_default().allocated = true;
        }
    }

    /// Record this node's own validation ack. Returns false if the request
    /// has left the window in the meantime.
    pub fn record_own_ack(&mut self, ack: &RequestAck) -> bool {
        let Some(window) = self.clients.get_mut(&ack.client) else {
            return false;
        };
        if !window.in_window(ack.req_no) {
            return false;
        }
        let state = window.requests.entry(ack.req_no).or_default();
        state.own_digest = Some(ack.digest);
        true
    }

    /// Record an ack observed from `source`. Returns true when this ack
    /// completes a weak quorum and the request newly becomes correct.
    pub fn add_ack(&mut self, source: NodeId, ack: &RequestAck, weak_quorum: usize) -> bool {
        let Some(window) = self.clients.get_mut(&ack.client) else {
            return false;
        };
        if !window.in_window(ack.req_no) {
            debug!(client = %ack.client, req_no = ack.req_no, "ack outside window, ignored");
            return false;
        }
        let state = window.requests.entry(ack.req_no).or_default();
        let sources = state.acks.entry(ack.digest).or_default();
        if !sources.insert(source) {
            return false;
        }
        if state.correct.is_none() && sources.len() >= weak_quorum {
            state.correct = Some(ack.digest);
            return true;
        }
        false
    }

    /// The weak-quorum digest for a request, once one exists.
    pub fn correct_digest(&self, client: ClientId, req_no: u64) -> Option<Digest> {
        self.clients
            .get(&client)
            .and_then(|w| w.requests.get(&req_no))
            .and_then(|s| s.correct)
    }

    /// This node's own validation digest for a request, if any.
    pub fn own_digest(&self, client: ClientId, req_no: u64) -> Option<Digest> {
        self.clients
            .get(&client)
            .and_then(|w| w.requests.get(&req_no))
            .and_then(|s| s.own_digest)
    }

    /// Whether the request was already committed in an ordered batch.
    pub fn is_committed(&self, client: ClientId, req_no: u64) -> bool {
        self.clients
            .get(&client)
            .and_then(|w| w.requests.get(&req_no))
            .map(|s| s.committed)
            .unwrap_or(false)
    }

    /// Mark a request committed. Requests below the watermark are already
    /// retired and ignored.
    pub fn mark_committed(&mut self, ack: &RequestAck) {
        if let Some(window) = self.clients.get_mut(&ack.client) {
            if ack.req_no >= window.low_watermark {
                window.requests.entry(ack.req_no).or_default().committed = true;
            }
        }
    }

    /// Advance every client's low watermark past its contiguous committed
    /// prefix, retiring the state of the requests passed over.
    pub fn advance_watermarks(&mut self) {
        for window in self.clients.values_mut() {
            while window
                .requests
                .get(&window.low_watermark)
                .map(|s| s.committed)
                .unwrap_or(false)
            {
                window.requests.remove(&window.low_watermark);
                window.low_watermark += 1;
            }
        }
    }

    /// Own acks for requests that have not yet committed, for tick-driven
    /// retransmission.
    pub fn retransmit_acks(&self) -> Vec<RequestAck> {
        let mut acks = Vec::new();
        for (client, window) in &self.clients {
            for (req_no, state) in &window.requests {
                if state.committed {
                    continue;
                }
                if let Some(digest) = state.own_digest {
                    acks.push(RequestAck {
                        client: *client,
                        req_no: *req_no,
                        digest,
                    });
                }
            }
        }
        acks
    }

    /// Acked or correct requests that have not committed. Used to re-enqueue
    /// work when an epoch changes.
    pub fn uncommitted_acks(&self) -> Vec<RequestAck> {
        let mut acks = Vec::new();
        for (client, window) in &self.clients {
            for (req_no, state) in &window.requests {
                if state.committed {
                    continue;
                }
                if let Some(digest) = state.own_digest.or(state.correct) {
                    acks.push(RequestAck {
                        client: *client,
                        req_no: *req_no,
                        digest,
                    });
                }
            }
        }
        acks
    }

    /// Whether any request is still in flight (allocated, acked, or correct
    /// but not committed).
    pub fn has_outstanding(&self) -> bool {
        self.clients.values().any(|w| {
            w.requests.values().any(|s| {
                !s.committed && (s.allocated || s.own_digest.is_some() || s.correct.is_some())
            })
        })
    }

    /// Snapshot current windows as client configurations, for embedding in
    /// a checkpoint record.
    pub fn to_configs(&self) -> Vec<ClientConfig> {
        self.clients
            .iter()
            .map(|(id, w)| ClientConfig {
                id: *id,
                width: w.width,
                low_watermark: w.low_watermark,
            })
            .collect()
    }
}
