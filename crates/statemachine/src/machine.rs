//! The event-driven state machine driver.
//!
//! `StateMachine::apply` is the single entry point: one event in, a list of
//! actions out. The call is synchronous, runs to completion, and is a pure
//! function of the machine's state and the event. Faults are never
//! recovered; they surface as `Err` and the caller must stop the machine.

use crate::checkpoint::CheckpointWindow;
use crate::clients::{ClientWindows, ProposeOutcome};
use crate::epoch::{ActiveEpoch, EpochConfig, StepOutcome};
use crate::epoch_change::{ChangeVote, EpochChangeState};
use crate::sequence::SlotPhase;
use crate::status::{MachinePhase, SlotStatus, StateMachineStatus};
use conclave_core::{
    Action, ActionList, ActionResults, Event, Fault, HashOrigin,
};
use conclave_types::{
    Batch, BucketId, EpochNo, Msg, NetworkState, NodeId, Persistent, Request, RequestAck, SeqNo,
};
use std::collections::BTreeMap;
use tracing::{debug, info, trace, warn};

/// Tuning knobs for the tick-driven timers.
///
/// All timers are measured in ticks; the machine never reads a clock.
#[derive(Debug, Clone)]
pub struct MachineConfig {
    /// Ticks without progress before this node suspects the epoch.
    pub suspect_ticks: u64,
    /// Retransmit own uncommitted request acks every this many ticks.
    pub retransmit_ticks: u64,
}

impl Default for MachineConfig {
    fn default() -> Self {
        MachineConfig {
            suspect_ticks: 8,
            retransmit_ticks: 5,
        }
    }
}

/// The deterministic consensus state machine.
pub struct StateMachine {
    node_id: NodeId,
    config: MachineConfig,
    phase: MachinePhase,
    last_load_index: Option<u64>,
    state: Option<NodeState>,
}

impl std::fmt::Debug for StateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateMachine")
            .field("node_id", &self.node_id)
            .field("phase", &self.phase)
            .field(
                "epoch",
                &self.state.as_ref().map(|s| s.epoch.config().number()),
            )
            .finish()
    }
}

impl StateMachine {
    /// Create an uninitialized machine for `node_id`.
    pub fn new(node_id: NodeId, config: MachineConfig) -> Self {
        StateMachine {
            node_id,
            config,
            phase: MachinePhase::Uninitialized,
            last_load_index: None,
            state: None,
        }
    }

    /// Apply one event, returning the actions it produced.
    ///
    /// Deterministic, synchronous, non-blocking. An `Err` is a fatal
    /// protocol invariant violation or caller bug; the machine must not be
    /// used afterwards.
    pub fn apply(&mut self, event: Event) -> Result<ActionList, Fault> {
        trace!(node = %self.node_id, event = event.type_name(), "applying event");
        match event {
            Event::Initialize { network_state } => self.on_initialize(network_state),
            Event::LoadEntry { index, entry } => self.on_load_entry(index, entry),
            Event::CompleteInitialization => self.on_complete_initialization(),
            Event::ActionsReceived => {
                if self.phase == MachinePhase::Uninitialized {
                    return Err(Fault::NotInitialized {
                        event: "ActionsReceived",
                    });
                }
                Ok(ActionList::new())
            }
            other => {
                match self.phase {
                    MachinePhase::Uninitialized => {
                        return Err(Fault::NotInitialized {
                            event: other.type_name(),
                        })
                    }
                    MachinePhase::Recovering => {
                        return Err(Fault::StillRecovering {
                            event: other.type_name(),
                        })
                    }
                    MachinePhase::Active => {}
                }
                let state = self.state.as_mut().expect("active machine has state");
                match other {
                    Event::Tick => Ok(state.on_tick()),
                    Event::Step { source, msg } => state.on_step(source, msg),
                    Event::Propose { request } => state.on_propose(request),
                    Event::AddResults { results } => state.on_results(results),
                    Event::RequestPersisted { ack } => Ok(state.on_request_persisted(ack)),
                    Event::Transfer { seq, value } => Ok(state.on_transfer(seq, value)),
                    Event::Initialize { .. }
                    | Event::LoadEntry { .. }
                    | Event::CompleteInitialization
                    | Event::ActionsReceived => unreachable!("handled above"),
                }
            }
        }
    }

    /// Snapshot the persisted projection of the machine's state.
    pub fn status(&self) -> StateMachineStatus {
        match &self.state {
            Some(state) => state.status(self.phase),
            None => StateMachineStatus {
                node_id: self.node_id,
                phase: self.phase,
                epoch: EpochNo::GENESIS,
                floor: SeqNo::ZERO,
                latest_stable: SeqNo::ZERO,
                stable_value: Vec::new(),
                slots: Vec::new(),
                clients: Vec::new(),
                checkpoint_boundaries: Vec::new(),
            },
        }
    }

    /// The node this machine runs as.
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> MachinePhase {
        self.phase
    }

    /// Highest committed slot. Volatile introspection for tests and tools.
    pub fn committed_head(&self) -> SeqNo {
        self.state
            .as_ref()
            .map(|s| s.epoch.committed_head())
            .unwrap_or(SeqNo::ZERO)
    }

    /// Whether the slot at `seq` has committed locally.
    pub fn is_committed(&self, seq: SeqNo) -> bool {
        self.state
            .as_ref()
            .map(|s| s.epoch.is_committed(seq))
            .unwrap_or(false)
    }

    /// The current epoch number.
    pub fn epoch(&self) -> EpochNo {
        self.state
            .as_ref()
            .map(|s| s.epoch.config().number())
            .unwrap_or(EpochNo::GENESIS)
    }

    fn on_initialize(&mut self, network_state: NetworkState) -> Result<ActionList, Fault> {
        if self.phase != MachinePhase::Uninitialized {
            return Err(Fault::AlreadyInitialized);
        }
        network_state.validate()?;
        info!(node = %self.node_id, nodes = network_state.config.nodes.len(), "initializing");

        let mut state = NodeState::new(self.node_id, self.config.clone(), network_state.clone());
        let mut actions = ActionList::from(vec![Action::AppendWriteAhead {
            entry: Persistent::CEntry {
                seq: SeqNo::ZERO,
                value: Vec::new(),
                epoch: EpochNo::GENESIS,
                network_state,
            },
        }]);
        actions.push_list(state.ensure_windows());
        self.state = Some(state);
        self.phase = MachinePhase::Recovering;
        Ok(actions)
    }

    fn on_load_entry(&mut self, index: u64, entry: Persistent) -> Result<ActionList, Fault> {
        match self.phase {
            MachinePhase::Uninitialized => {
                return Err(Fault::NotInitialized { event: "LoadEntry" })
            }
            MachinePhase::Active => return Err(Fault::LoadAfterComplete),
            MachinePhase::Recovering => {}
        }
        if let Some(previous) = self.last_load_index {
            if index <= previous {
                return Err(Fault::ReplayOutOfOrder { index, previous });
            }
        }
        self.last_load_index = Some(index);

        let node_id = self.node_id;
        let config = self.config.clone();
        let state = self.state.as_mut().expect("recovering machine has state");
        match entry {
            Persistent::CEntry {
                seq,
                value,
                epoch,
                network_state,
            } => {
                network_state.validate()?;
                // Slots above the new floor stay in flight across the
                // checkpoint anchor; log order may interleave them.
                let floor = SeqNo(seq.0.saturating_sub(network_state.config.checkpoint_interval));
                let carried: Vec<(SeqNo, conclave_types::Digest, Vec<RequestAck>, bool)> =
                    if state.epoch.config().number() == epoch {
                        state
                            .epoch
                            .slots()
                            .filter(|s| s.seq > floor)
                            .filter_map(|s| {
                                s.digest.map(|digest| {
                                    (
                                        s.seq,
                                        digest,
                                        s.batch.clone().unwrap_or_default(),
                                        s.sent_commit,
                                    )
                                })
                            })
                            .collect()
                    } else {
                        Vec::new()
                    };
                *state = NodeState::restored(node_id, config, network_state, epoch, seq, value);
                for (slot_seq, digest, requests, prepared) in carried {
                    for ack in &requests {
                        state.clients.mark_allocated(ack.client, ack.req_no);
                    }
                    state.epoch.restore_qentry(slot_seq, digest, requests);
                    if prepared {
                        state.epoch.restore_pentry(slot_seq, digest);
                    }
                }
                state.ensure_windows();
            }
            Persistent::QEntry {
                seq,
                epoch,
                digest,
                requests,
            } => {
                if epoch != state.epoch.config().number() {
                    warn!(%seq, "QEntry from another epoch in replay, skipped");
                } else {
                    for ack in &requests {
                        state.clients.mark_allocated(ack.client, ack.req_no);
                    }
                    state.epoch.restore_qentry(seq, digest, requests);
                }
            }
            Persistent::PEntry { seq, epoch, digest } => {
                if epoch != state.epoch.config().number() {
                    warn!(%seq, "PEntry from another epoch in replay, skipped");
                } else {
                    state.epoch.restore_pentry(seq, digest);
                }
            }
            Persistent::NewEpoch { epoch, start_seq } => {
                state.restore_new_epoch(epoch, start_seq);
            }
            Persistent::EpochChange { new_epoch, .. } => {
                state.change.start(new_epoch);
            }
            Persistent::Suspect { epoch } => {
                if epoch == state.epoch.config().number() {
                    state.change.suspected = true;
                }
            }
        }
        Ok(ActionList::new())
    }

    fn on_complete_initialization(&mut self) -> Result<ActionList, Fault> {
        match self.phase {
            MachinePhase::Uninitialized => {
                return Err(Fault::NotInitialized {
                    event: "CompleteInitialization",
                })
            }
            MachinePhase::Active => return Err(Fault::AlreadyInitialized),
            MachinePhase::Recovering => {}
        }
        self.phase = MachinePhase::Active;
        let state = self.state.as_mut().expect("recovering machine has state");
        Ok(state.epoch.resend_in_flight())
    }
}

/// Protocol state of an initialized node.
struct NodeState {
    node_id: NodeId,
    config: MachineConfig,
    network: NetworkState,
    clients: ClientWindows,
    epoch: ActiveEpoch,
    change: EpochChangeState,
    checkpoints: BTreeMap<SeqNo, CheckpointWindow>,
    /// Per window boundary, uncommitted slot counts per bucket.
    remaining: BTreeMap<SeqNo, BTreeMap<BucketId, u64>>,
    /// Stable floor: state at or below it has been garbage-collected.
    floor: SeqNo,
    /// Newest network-stable checkpoint and its value.
    latest_stable: SeqNo,
    stable_value: Vec<u8>,
    /// First slot of the current epoch, for planned rotation.
    epoch_start: SeqNo,
    ticks_without_progress: u64,
    tick_count: u64,
}

impl NodeState {
    fn new(node_id: NodeId, config: MachineConfig, network: NetworkState) -> Self {
        let epoch_config =
            EpochConfig::new(EpochNo::GENESIS, SeqNo::ZERO, network.config.clone());
        NodeState {
            node_id,
            config,
            clients: ClientWindows::from_configs(&network.clients),
            epoch: ActiveEpoch::new(epoch_config, node_id, SeqNo::ZERO),
            change: EpochChangeState::default(),
            checkpoints: BTreeMap::new(),
            remaining: BTreeMap::new(),
            floor: SeqNo::ZERO,
            latest_stable: SeqNo::ZERO,
            stable_value: Vec::new(),
            epoch_start: SeqNo::ZERO,
            ticks_without_progress: 0,
            tick_count: 0,
            network,
        }
    }

    /// Rebuild state anchored at a replayed checkpoint record.
    fn restored(
        node_id: NodeId,
        config: MachineConfig,
        network: NetworkState,
        epoch: EpochNo,
        seq: SeqNo,
        value: Vec<u8>,
    ) -> Self {
        let interval = network.config.checkpoint_interval;
        let floor = SeqNo(seq.0.saturating_sub(interval));
        let epoch_config = EpochConfig::new(epoch, seq, network.config.clone());
        NodeState {
            node_id,
            config,
            clients: ClientWindows::from_configs(&network.clients),
            epoch: ActiveEpoch::new(epoch_config, node_id, floor),
            change: EpochChangeState::default(),
            checkpoints: BTreeMap::new(),
            remaining: BTreeMap::new(),
            floor,
            latest_stable: seq,
            stable_value: value,
            epoch_start: seq,
            ticks_without_progress: 0,
            tick_count: 0,
            network,
        }
    }

    fn interval(&self) -> u64 {
        self.network.config.checkpoint_interval
    }

    /// Upper bound of the active watermark window.
    fn ceiling(&self) -> SeqNo {
        SeqNo(self.floor.0 + 2 * self.interval())
    }

    /// The checkpoint boundary covering `seq`.
    fn boundary_of(&self, seq: SeqNo) -> SeqNo {
        let interval = self.interval();
        SeqNo(seq.0.div_ceil(interval) * interval)
    }

    fn broadcast_targets(&self) -> Vec<NodeId> {
        self.network.config.nodes.clone()
    }

    /// Create checkpoint windows for every boundary in the active range
    /// that does not have one yet. Slots already committed under a new
    /// boundary are accounted for immediately.
    fn ensure_windows(&mut self) -> ActionList {
        let mut actions = ActionList::new();
        let interval = self.interval();
        let f = self.network.config.f;
        let nodes = self.network.config.nodes.clone();
        let num_buckets = self.network.config.num_buckets;

        let mut boundary = self.boundary_of(SeqNo(self.latest_stable.0 + 1));
        while boundary <= self.ceiling() {
            if !self.checkpoints.contains_key(&boundary) {
                let window = CheckpointWindow::new(
                    boundary,
                    f,
                    nodes.clone(),
                    (0..num_buckets).map(BucketId),
                );
                let mut counts: BTreeMap<BucketId, u64> = BTreeMap::new();
                for seq in (boundary.0 - interval + 1)..=boundary.0 {
                    if !self.epoch.is_committed(SeqNo(seq)) {
                        *counts.entry(BucketId(seq % num_buckets)).or_insert(0) += 1;
                    }
                }
                self.checkpoints.insert(boundary, window);
                // Buckets with nothing left to commit report immediately.
                let complete: Vec<BucketId> = (0..num_buckets)
                    .map(BucketId)
                    .filter(|b| !counts.contains_key(b))
                    .collect();
                self.remaining.insert(boundary, counts);
                for bucket in complete {
                    let window = self.checkpoints.get_mut(&boundary).expect("just inserted");
                    actions.push_list(window.committed(bucket));
                }
            }
            boundary = SeqNo(boundary.0 + interval);
        }
        actions
    }

    fn status(&self, phase: MachinePhase) -> StateMachineStatus {
        let mut slots = Vec::new();
        for slot in self.epoch.slots() {
            if let Some(digest) = slot.digest {
                if slot.phase >= SlotPhase::Preprepared {
                    slots.push(SlotStatus {
                        seq: slot.seq,
                        digest,
                        prepared: slot.sent_commit,
                    });
                }
            }
        }
        StateMachineStatus {
            node_id: self.node_id,
            phase,
            epoch: self.epoch.config().number(),
            floor: self.floor,
            latest_stable: self.latest_stable,
            stable_value: self.stable_value.clone(),
            slots,
            clients: self.clients.to_configs(),
            checkpoint_boundaries: self.checkpoints.keys().copied().collect(),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Tick
    // ═══════════════════════════════════════════════════════════════════════

    fn on_tick(&mut self) -> ActionList {
        self.tick_count += 1;
        let mut actions = self.epoch.cut_batches(self.ceiling());

        if self.config.retransmit_ticks > 0 && self.tick_count % self.config.retransmit_ticks == 0
        {
            let targets = self.broadcast_targets();
            for ack in self.clients.retransmit_acks() {
                actions.push(Action::Send {
                    targets: targets.clone(),
                    msg: Msg::RequestAck(ack),
                });
            }
        }

        if self.epoch.has_outstanding() || self.clients.has_outstanding() {
            self.ticks_without_progress += 1;
            if self.ticks_without_progress >= self.config.suspect_ticks
                && !self.change.suspected
                && self.change.target().is_none()
            {
                let epoch = self.epoch.config().number();
                warn!(node = %self.node_id, %epoch, "no progress, suspecting epoch");
                self.change.suspected = true;
                actions.push(Action::AppendWriteAhead {
                    entry: Persistent::Suspect { epoch },
                });
                actions.push(Action::Send {
                    targets: self.broadcast_targets(),
                    msg: Msg::Suspect { epoch },
                });
            }
        } else {
            self.ticks_without_progress = 0;
        }

        actions
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Client requests
    // ═══════════════════════════════════════════════════════════════════════

    fn on_propose(&mut self, request: Request) -> Result<ActionList, Fault> {
        if !self.clients.contains(request.client) {
            return Err(Fault::UnknownClient {
                client: request.client,
            });
        }
        match self.clients.propose_outcome(request.client, request.req_no) {
            ProposeOutcome::Allocate => {
                self.clients.mark_allocated(request.client, request.req_no);
                Ok(ActionList::from(vec![Action::AllocatedRequest {
                    client: request.client,
                    req_no: request.req_no,
                }]))
            }
            outcome => {
                debug!(client = %request.client, req_no = request.req_no, ?outcome, "proposal not allocated");
                Ok(ActionList::new())
            }
        }
    }

    fn on_request_persisted(&mut self, ack: RequestAck) -> ActionList {
        // A payload obtained by forwarding must re-derive the digest the
        // weak quorum certified; anything else is a corrupt forward.
        if let Some(correct) = self.clients.correct_digest(ack.client, ack.req_no) {
            if correct != ack.digest {
                warn!(client = %ack.client, req_no = ack.req_no,
                    "validated payload disagrees with the certified digest, discarded");
                return ActionList::new();
            }
        }
        if !self.clients.record_own_ack(&ack) {
            debug!(client = %ack.client, req_no = ack.req_no, "validated request left the window");
            return ActionList::new();
        }
        let mut actions = ActionList::from(vec![Action::Send {
            targets: self.broadcast_targets(),
            msg: Msg::RequestAck(ack),
        }]);
        let weak = self.network.config.weak_quorum();
        if self.clients.add_ack(self.node_id, &ack, weak) {
            actions.push(Action::CorrectRequest { ack });
        }
        self.epoch.enqueue_request(ack);
        actions
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Protocol steps
    // ═══════════════════════════════════════════════════════════════════════

    fn on_step(&mut self, source: NodeId, msg: Msg) -> Result<ActionList, Fault> {
        if !self.network.config.contains(source) {
            warn!(%source, msg = msg.type_name(), "step from node outside the configuration");
            return Ok(ActionList::new());
        }
        let floor = self.floor;
        let ceiling = self.ceiling();
        let mut actions = ActionList::new();
        match msg {
            Msg::Preprepare { seq, epoch, batch } => {
                if self.batch_acceptable(&batch) {
                    actions.push_list(
                        self.epoch
                            .on_preprepare(source, seq, epoch, batch, floor, ceiling),
                    );
                } else {
                    warn!(%source, %seq, "preprepare with stale or unknown requests, ignored");
                }
            }
            Msg::Prepare { seq, epoch, digest } => {
                let outcome = self
                    .epoch
                    .on_prepare(source, seq, epoch, digest, floor, ceiling);
                self.process_outcome(outcome, &mut actions);
            }
            Msg::Commit { seq, epoch, digest } => {
                let outcome = self
                    .epoch
                    .on_commit(source, seq, epoch, digest, floor, ceiling);
                self.process_outcome(outcome, &mut actions);
            }
            Msg::Checkpoint {
                seq,
                value,
                attestation,
            } => {
                self.on_checkpoint_msg(source, seq, value, attestation, &mut actions);
            }
            Msg::RequestAck(ack) => {
                let weak = self.network.config.weak_quorum();
                if self.clients.add_ack(source, &ack, weak) {
                    actions.push(Action::CorrectRequest { ack });
                    if self.clients.own_digest(ack.client, ack.req_no).is_none() {
                        actions.push(Action::Send {
                            targets: vec![source],
                            msg: Msg::FetchRequest {
                                client: ack.client,
                                req_no: ack.req_no,
                            },
                        });
                    }
                }
            }
            Msg::FetchRequest { client, req_no } => {
                if let Some(digest) = self.clients.own_digest(client, req_no) {
                    actions.push(Action::ForwardRequest {
                        target: source,
                        ack: RequestAck {
                            client,
                            req_no,
                            digest,
                        },
                    });
                }
            }
            Msg::ForwardRequest { request, digest } => {
                let correct = self.clients.correct_digest(request.client, request.req_no);
                if correct == Some(digest)
                    && self.clients.own_digest(request.client, request.req_no).is_none()
                {
                    self.clients.mark_allocated(request.client, request.req_no);
                    actions.push(Action::AllocatedRequest {
                        client: request.client,
                        req_no: request.req_no,
                    });
                } else {
                    trace!(%source, client = %request.client, req_no = request.req_no,
                        "forwarded request without matching correctness quorum, ignored");
                }
            }
            Msg::FetchBatch { seq, digest } => {
                actions.push_list(self.epoch.on_fetch_batch(source, seq, digest));
            }
            Msg::ForwardBatch {
                seq,
                digest,
                requests,
            } => {
                actions.push_list(self.epoch.on_forward_batch(source, seq, digest, requests));
            }
            Msg::Suspect { epoch } => self.on_suspect(source, epoch, &mut actions),
            Msg::EpochChange {
                new_epoch,
                stable_seq,
                stable_value,
            } => self.on_epoch_change(source, new_epoch, stable_seq, stable_value, &mut actions),
            Msg::EpochChangeAck { new_epoch, origin } => {
                self.on_epoch_change_ack(source, new_epoch, origin, &mut actions);
            }
            Msg::NewEpoch {
                new_epoch,
                start_seq,
            } => self.on_new_epoch(source, new_epoch, start_seq, &mut actions),
            Msg::NewEpochEcho {
                new_epoch,
                start_seq,
            } => self.on_new_epoch_echo(source, new_epoch, start_seq, &mut actions),
            Msg::NewEpochReady {
                new_epoch,
                start_seq,
            } => self.on_new_epoch_ready(source, new_epoch, start_seq, &mut actions),
        }
        Ok(actions)
    }

    /// Every ack in a preprepared batch must reference a known client and a
    /// request number the client's window has not retired.
    fn batch_acceptable(&self, batch: &[RequestAck]) -> bool {
        batch.iter().all(|ack| {
            self.clients.contains(ack.client)
                && self
                    .clients
                    .propose_outcome(ack.client, ack.req_no)
                    != ProposeOutcome::BelowWatermark
        })
    }

    /// Fold a slot-protocol outcome into the action list, handling any
    /// batches that committed.
    fn process_outcome(&mut self, outcome: StepOutcome, actions: &mut ActionList) {
        actions.push_list(outcome.actions);
        for batch in outcome.committed {
            self.on_batch_committed(batch, actions);
        }
    }

    fn on_batch_committed(&mut self, batch: Batch, actions: &mut ActionList) {
        self.ticks_without_progress = 0;
        for ack in &batch.requests {
            self.clients.mark_committed(ack);
        }

        // Checkpoint window accounting.
        let boundary = self.boundary_of(batch.seq);
        let bucket = self.epoch.config().bucket_of(batch.seq);
        if let Some(counts) = self.remaining.get_mut(&boundary) {
            if let Some(count) = counts.get_mut(&bucket) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    counts.remove(&bucket);
                    if let Some(window) = self.checkpoints.get_mut(&boundary) {
                        actions.push_list(window.committed(bucket));
                    }
                }
            }
        }

        // Planned rotation once the epoch has run its course.
        let max_len = self.network.config.max_epoch_length;
        if batch.seq.0 >= self.epoch_start.0 + max_len && self.change.target().is_none() {
            let next = self.epoch.config().number().next();
            info!(node = %self.node_id, %next, "epoch reached its maximum length, rotating");
            self.start_change(next, actions);
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Checkpoints
    // ═══════════════════════════════════════════════════════════════════════

    fn on_checkpoint_msg(
        &mut self,
        source: NodeId,
        seq: SeqNo,
        value: Vec<u8>,
        attestation: Vec<u8>,
        actions: &mut ActionList,
    ) {
        if seq <= self.latest_stable {
            trace!(%source, %seq, "checkpoint attestation for a stable boundary, ignored");
            return;
        }
        let Some(window) = self.checkpoints.get_mut(&seq) else {
            debug!(%source, %seq, "checkpoint attestation outside the active boundaries, ignored");
            return;
        };
        actions.push_list(window.apply_checkpoint_msg(source, value, attestation));
        if window.committed_value().is_some() {
            self.on_checkpoint_stable(seq, actions);
        }
    }

    /// A checkpoint gained a network quorum: advance the stable state,
    /// garbage-collect below the new floor, and persist the anchor.
    fn on_checkpoint_stable(&mut self, seq: SeqNo, actions: &mut ActionList) {
        let window = self.checkpoints.remove(&seq).expect("stabilizing window exists");
        self.remaining.remove(&seq);
        let value = window
            .committed_value()
            .expect("stable window has a value")
            .to_vec();
        let interval = self.interval();
        let new_floor = SeqNo(seq.0.saturating_sub(interval));
        info!(node = %self.node_id, %seq, floor = %new_floor, "checkpoint is network-stable");

        // Slots the network has moved past that this node never committed
        // mean this node is too far behind to catch up slot by slot.
        let behind = self
            .epoch
            .slots()
            .any(|s| s.seq <= new_floor && s.phase != SlotPhase::Committed);

        self.latest_stable = seq;
        self.stable_value = value.clone();
        self.floor = new_floor;
        self.epoch.gc(new_floor);
        self.checkpoints.retain(|boundary, _| *boundary > new_floor);
        self.remaining.retain(|boundary, _| *boundary > new_floor);
        self.clients.advance_watermarks();
        self.network.clients = self.clients.to_configs();

        if behind {
            warn!(node = %self.node_id, %seq, "fell behind the network checkpoint, transferring");
            actions.push(Action::StateTransfer { seq, value });
        } else {
            actions.push(Action::AppendWriteAhead {
                entry: Persistent::CEntry {
                    seq,
                    value,
                    epoch: self.epoch.config().number(),
                    network_state: self.network.clone(),
                },
            });
            actions.push(Action::TruncateWriteAhead { to_seq: new_floor });
            // Request payloads ordered at or below the stable checkpoint
            // are durably applied and may be retired by the request store.
            actions.push(Action::StateApplied { seq });
        }
        actions.push_list(self.ensure_windows());
    }

    fn on_results(&mut self, results: ActionResults) -> Result<ActionList, Fault> {
        let mut actions = ActionList::new();
        for hash in results.digests {
            match hash.origin {
                HashOrigin::Batch { seq } => {
                    let outcome = self
                        .epoch
                        .on_digest(seq, hash.digest)
                        .ok_or(Fault::UnexpectedHashResult { origin: hash.origin })?;
                    self.process_outcome(outcome, &mut actions);
                }
                HashOrigin::VerifyBatch { seq } => {
                    let outcome = self
                        .epoch
                        .on_verify_digest(seq, hash.digest)
                        .ok_or(Fault::UnexpectedHashResult { origin: hash.origin })?;
                    self.process_outcome(outcome, &mut actions);
                }
            }
        }
        for checkpoint in results.checkpoints {
            if let Some(window) = self.checkpoints.get_mut(&checkpoint.seq) {
                actions
                    .push_list(window.apply_checkpoint_result(checkpoint.value, checkpoint.attestation)?);
            } else if checkpoint.seq == self.latest_stable {
                // The network stabilized this boundary before the local
                // snapshot arrived; the values must still agree.
                if checkpoint.value != self.stable_value {
                    return Err(Fault::CheckpointDisagreement {
                        seq: checkpoint.seq,
                        local: checkpoint.value,
                        committed: self.stable_value.clone(),
                    });
                }
                actions.push(Action::Send {
                    targets: self.broadcast_targets(),
                    msg: Msg::Checkpoint {
                        seq: checkpoint.seq,
                        value: checkpoint.value,
                        attestation: checkpoint.attestation,
                    },
                });
            } else if checkpoint.seq <= self.floor {
                trace!(seq = %checkpoint.seq, "checkpoint result below the floor, dropped");
            } else {
                return Err(Fault::UnexpectedCheckpointResult {
                    seq: checkpoint.seq,
                });
            }
        }
        Ok(actions)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // State transfer
    // ═══════════════════════════════════════════════════════════════════════

    fn on_transfer(&mut self, seq: SeqNo, value: Vec<u8>) -> ActionList {
        if seq <= self.latest_stable {
            debug!(%seq, "transfer at or below the stable checkpoint, ignored");
            return ActionList::new();
        }
        info!(node = %self.node_id, %seq, "adopting transferred state");
        let interval = self.interval();
        self.latest_stable = seq;
        self.stable_value = value.clone();
        self.floor = SeqNo(seq.0.saturating_sub(interval));
        self.epoch.gc(seq);
        self.checkpoints.retain(|boundary, _| *boundary > seq);
        self.remaining.retain(|boundary, _| *boundary > seq);
        self.ticks_without_progress = 0;

        let mut actions = ActionList::from(vec![
            Action::AppendWriteAhead {
                entry: Persistent::CEntry {
                    seq,
                    value,
                    epoch: self.epoch.config().number(),
                    network_state: self.network.clone(),
                },
            },
            Action::TruncateWriteAhead { to_seq: seq },
        ]);
        // Requests still in flight must survive the jump.
        let targets = self.broadcast_targets();
        for ack in self.clients.retransmit_acks() {
            actions.push(Action::Send {
                targets: targets.clone(),
                msg: Msg::RequestAck(ack),
            });
        }
        actions.push_list(self.ensure_windows());
        actions
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Epoch change
    // ═══════════════════════════════════════════════════════════════════════

    fn on_suspect(&mut self, source: NodeId, epoch: EpochNo, actions: &mut ActionList) {
        if epoch != self.epoch.config().number() || self.change.target().is_some() {
            trace!(%source, %epoch, "suspicion outside the current epoch, ignored");
            return;
        }
        let count = self.change.add_suspicion(source);
        if count >= self.network.config.weak_quorum() {
            let next = self.epoch.config().number().next();
            info!(node = %self.node_id, %next, suspicions = count, "suspicion quorum, changing epoch");
            self.start_change(next, actions);
        }
    }

    fn start_change(&mut self, target: EpochNo, actions: &mut ActionList) {
        self.change.start(target);
        actions.push(Action::AppendWriteAhead {
            entry: Persistent::EpochChange {
                new_epoch: target,
                stable_seq: self.latest_stable,
            },
        });
        actions.push(Action::Send {
            targets: self.broadcast_targets(),
            msg: Msg::EpochChange {
                new_epoch: target,
                stable_seq: self.latest_stable,
                stable_value: self.stable_value.clone(),
            },
        });
    }

    fn on_epoch_change(
        &mut self,
        source: NodeId,
        new_epoch: EpochNo,
        stable_seq: SeqNo,
        stable_value: Vec<u8>,
        actions: &mut ActionList,
    ) {
        if new_epoch != self.epoch.config().number().next() {
            trace!(%source, %new_epoch, "change vote for a non-adjacent epoch, ignored");
            return;
        }
        let count = self.change.add_change(
            source,
            ChangeVote {
                stable_seq,
                stable_value,
            },
        );
        actions.push(Action::Send {
            targets: self.broadcast_targets(),
            msg: Msg::EpochChangeAck {
                new_epoch,
                origin: source,
            },
        });
        // Enough change votes prove at least one honest node gave up on the
        // epoch; join the change without waiting for our own timeout.
        if self.change.target().is_none() && count >= self.network.config.weak_quorum() {
            info!(node = %self.node_id, %new_epoch, "joining epoch change");
            self.start_change(new_epoch, actions);
        }
        self.maybe_announce_new_epoch(actions);
    }

    fn on_epoch_change_ack(
        &mut self,
        source: NodeId,
        new_epoch: EpochNo,
        origin: NodeId,
        actions: &mut ActionList,
    ) {
        if new_epoch != self.epoch.config().number().next() {
            return;
        }
        self.change.add_ack(source, origin);
        self.maybe_announce_new_epoch(actions);
    }

    /// The new primary announces the epoch once a strong quorum of change
    /// votes is certified.
    fn maybe_announce_new_epoch(&mut self, actions: &mut ActionList) {
        let Some(target) = self.change.target() else {
            return;
        };
        if self.primary_of(target) != self.node_id || self.change.sent_new_epoch {
            return;
        }
        let quorum = self.network.config.quorum();
        let certified = self.change.certified(quorum);
        if certified.len() < quorum {
            return;
        }
        let (start_seq, _) = self.change.start_seq(&certified);
        info!(node = %self.node_id, %target, %start_seq, "announcing new epoch");
        self.change.sent_new_epoch = true;
        actions.push(Action::Send {
            targets: self.broadcast_targets(),
            msg: Msg::NewEpoch {
                new_epoch: target,
                start_seq,
            },
        });
    }

    fn primary_of(&self, epoch: EpochNo) -> NodeId {
        let nodes = &self.network.config.nodes;
        nodes[(epoch.0 % nodes.len() as u64) as usize]
    }

    fn on_new_epoch(
        &mut self,
        source: NodeId,
        new_epoch: EpochNo,
        start_seq: SeqNo,
        actions: &mut ActionList,
    ) {
        if new_epoch != self.epoch.config().number().next() {
            trace!(%source, %new_epoch, "new-epoch for a non-adjacent epoch, ignored");
            return;
        }
        if source != self.primary_of(new_epoch) {
            warn!(%source, %new_epoch, "new-epoch from a node that is not the primary, ignored");
            return;
        }
        if self.change.sent_echo {
            return;
        }
        self.change.sent_echo = true;
        actions.push(Action::Send {
            targets: self.broadcast_targets(),
            msg: Msg::NewEpochEcho {
                new_epoch,
                start_seq,
            },
        });
    }

    fn on_new_epoch_echo(
        &mut self,
        source: NodeId,
        new_epoch: EpochNo,
        start_seq: SeqNo,
        actions: &mut ActionList,
    ) {
        if new_epoch != self.epoch.config().number().next() {
            return;
        }
        let count = self.change.add_echo(source, new_epoch, start_seq);
        if count >= self.network.config.quorum() && !self.change.sent_ready {
            self.change.sent_ready = true;
            actions.push(Action::Send {
                targets: self.broadcast_targets(),
                msg: Msg::NewEpochReady {
                    new_epoch,
                    start_seq,
                },
            });
        }
    }

    fn on_new_epoch_ready(
        &mut self,
        source: NodeId,
        new_epoch: EpochNo,
        start_seq: SeqNo,
        actions: &mut ActionList,
    ) {
        if new_epoch != self.epoch.config().number().next() {
            return;
        }
        let count = self.change.add_ready(source, new_epoch, start_seq);
        // A weak quorum of readies proves an honest node saw enough echoes;
        // amplify so the handshake completes everywhere.
        if count >= self.network.config.weak_quorum() && !self.change.sent_ready {
            self.change.sent_ready = true;
            actions.push(Action::Send {
                targets: self.broadcast_targets(),
                msg: Msg::NewEpochReady {
                    new_epoch,
                    start_seq,
                },
            });
        }
        if count >= self.network.config.quorum() {
            self.adopt_epoch(new_epoch, start_seq, actions);
        }
    }

    fn adopt_epoch(&mut self, new_epoch: EpochNo, start_seq: SeqNo, actions: &mut ActionList) {
        info!(node = %self.node_id, %new_epoch, %start_seq, "adopting new epoch");
        actions.push(Action::AppendWriteAhead {
            entry: Persistent::NewEpoch {
                epoch: new_epoch,
                start_seq,
            },
        });

        // Carry committed slots above the new base across; everything else
        // is re-proposed under the new leader assignment.
        let base = std::cmp::max(self.floor, start_seq);
        let committed: Vec<(SeqNo, conclave_types::Digest)> = self
            .epoch
            .slots()
            .filter(|s| s.phase == SlotPhase::Committed && s.seq > base)
            .filter_map(|s| s.digest.map(|d| (s.seq, d)))
            .collect();

        // The network's stable state may be ahead of ours.
        let needs_transfer = start_seq > self.latest_stable;
        let transfer_value = if needs_transfer {
            let (seq, value) = self
                .change
                .start_seq(&self.change.certified(self.network.config.quorum()));
            if seq == start_seq {
                value
            } else {
                Vec::new()
            }
        } else {
            Vec::new()
        };

        let config = EpochConfig::new(new_epoch, start_seq, self.network.config.clone());
        self.epoch = ActiveEpoch::new(config, self.node_id, base);
        self.epoch.restore_committed(committed);
        self.change = EpochChangeState::default();
        self.epoch_start = start_seq;
        self.ticks_without_progress = 0;

        if needs_transfer {
            actions.push(Action::StateTransfer {
                seq: start_seq,
                value: transfer_value,
            });
        }

        // Uncommitted requests are re-queued under the new leaders.
        let acks = self.clients.uncommitted_acks();
        self.epoch.re_enqueue(acks);
    }

    fn restore_new_epoch(&mut self, epoch: EpochNo, start_seq: SeqNo) {
        let base = std::cmp::max(self.floor, start_seq);
        let config = EpochConfig::new(epoch, start_seq, self.network.config.clone());
        self.epoch = ActiveEpoch::new(config, self.node_id, base);
        self.change = EpochChangeState::default();
        self.epoch_start = start_seq;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conclave_types::standard_initial_network_state;

    fn machine() -> StateMachine {
        StateMachine::new(NodeId(0), MachineConfig::default())
    }

    fn initialized() -> StateMachine {
        let mut m = machine();
        m.apply(Event::Initialize {
            network_state: standard_initial_network_state(4, 1),
        })
        .unwrap();
        m.apply(Event::CompleteInitialization).unwrap();
        m
    }

    #[test]
    fn test_initialize_persists_genesis_checkpoint() {
        let mut m = machine();
        let actions: Vec<_> = m
            .apply(Event::Initialize {
                network_state: standard_initial_network_state(4, 1),
            })
            .unwrap()
            .into_iter()
            .collect();
        match &actions[..] {
            [Action::AppendWriteAhead {
                entry: Persistent::CEntry { seq, value, .. },
            }] => {
                assert_eq!(*seq, SeqNo::ZERO);
                assert!(value.is_empty());
            }
            other => panic!("expected a single genesis CEntry, got {:?}", other),
        }
        assert_eq!(m.phase(), MachinePhase::Recovering);
    }

    #[test]
    fn test_duplicate_initialize_is_fatal() {
        let mut m = machine();
        m.apply(Event::Initialize {
            network_state: standard_initial_network_state(4, 1),
        })
        .unwrap();
        let fault = m
            .apply(Event::Initialize {
                network_state: standard_initial_network_state(4, 1),
            })
            .unwrap_err();
        assert_eq!(fault, Fault::AlreadyInitialized);
    }

    #[test]
    fn test_events_before_initialize_are_fatal() {
        let mut m = machine();
        assert_eq!(
            m.apply(Event::Tick).unwrap_err(),
            Fault::NotInitialized { event: "Tick" }
        );
    }

    #[test]
    fn test_external_events_during_recovery_are_fatal() {
        let mut m = machine();
        m.apply(Event::Initialize {
            network_state: standard_initial_network_state(4, 1),
        })
        .unwrap();
        assert_eq!(
            m.apply(Event::Tick).unwrap_err(),
            Fault::StillRecovering { event: "Tick" }
        );
    }

    #[test]
    fn test_load_entry_after_completion_is_fatal() {
        let mut m = initialized();
        let fault = m
            .apply(Event::LoadEntry {
                index: 0,
                entry: Persistent::Suspect {
                    epoch: EpochNo::GENESIS,
                },
            })
            .unwrap_err();
        assert_eq!(fault, Fault::LoadAfterComplete);
    }

    #[test]
    fn test_idle_ticks_emit_nothing() {
        let mut m = initialized();
        for _ in 0..25 {
            let actions = m.apply(Event::Tick).unwrap();
            assert!(actions.is_empty(), "idle tick produced {:?}", actions);
        }
    }

    #[test]
    fn test_propose_for_unknown_client_is_fatal() {
        let mut m = initialized();
        let fault = m
            .apply(Event::Propose {
                request: Request {
                    client: conclave_types::ClientId(42),
                    req_no: 0,
                    data: vec![0xaa],
                },
            })
            .unwrap_err();
        assert_eq!(
            fault,
            Fault::UnknownClient {
                client: conclave_types::ClientId(42)
            }
        );
    }

    #[test]
    fn test_propose_allocates_in_window_request() {
        let mut m = initialized();
        let actions: Vec<_> = m
            .apply(Event::Propose {
                request: Request {
                    client: conclave_types::ClientId(0),
                    req_no: 0,
                    data: vec![0xaa],
                },
            })
            .unwrap()
            .into_iter()
            .collect();
        assert_eq!(
            actions,
            vec![Action::AllocatedRequest {
                client: conclave_types::ClientId(0),
                req_no: 0
            }]
        );

        // A duplicate proposal is dropped, not re-allocated.
        let actions = m
            .apply(Event::Propose {
                request: Request {
                    client: conclave_types::ClientId(0),
                    req_no: 0,
                    data: vec![0xaa],
                },
            })
            .unwrap();
        assert!(actions.is_empty());
    }

    #[test]
    fn test_step_from_unknown_node_is_ignored() {
        let mut m = initialized();
        let actions = m
            .apply(Event::Step {
                source: NodeId(99),
                msg: Msg::Suspect {
                    epoch: EpochNo::GENESIS,
                },
            })
            .unwrap();
        assert!(actions.is_empty());
    }
}
