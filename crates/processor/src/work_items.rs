//! The work-item dispatcher: classifies actions into five ordered worker
//! streams and collects worker completions into two event streams.
//!
//! Classification is the safety-critical piece. Most protocol messages may
//! only reach the network after the decision they carry is persisted, so
//! their sends ride the WAL stream; the WAL worker re-emits them once the
//! covering persist completes, and they re-enter here through
//! [`WorkItems::add_wal_results`]. Only idempotent or retry-safe messages
//! go straight to the network stream.

use conclave_core::{Action, ActionList, EventList};
use conclave_types::Msg;

/// Destination stream for an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    /// Write-ahead log: appends, truncations, and persist-dependent sends.
    Wal,
    /// Network: sends with no persistence dependency.
    Net,
    /// Hashing.
    Hash,
    /// Request store.
    Client,
    /// Application: commits, checkpoints, state transfer.
    App,
}

/// Classify an action. Total over the action alphabet: adding a variant is
/// a compile-time obligation to pick its stream.
pub fn stream_of(action: &Action) -> Stream {
    match action {
        Action::Send { msg, .. } => match msg {
            // Retry-safe messages that depend on no persisted decision.
            Msg::RequestAck(_)
            | Msg::Checkpoint { .. }
            | Msg::FetchBatch { .. }
            | Msg::ForwardBatch { .. } => Stream::Net,
            // Everything else must trail its causal persist.
            Msg::Preprepare { .. }
            | Msg::Prepare { .. }
            | Msg::Commit { .. }
            | Msg::Suspect { .. }
            | Msg::EpochChange { .. }
            | Msg::EpochChangeAck { .. }
            | Msg::NewEpoch { .. }
            | Msg::NewEpochEcho { .. }
            | Msg::NewEpochReady { .. }
            | Msg::FetchRequest { .. }
            | Msg::ForwardRequest { .. } => Stream::Wal,
        },
        Action::AppendWriteAhead { .. } | Action::TruncateWriteAhead { .. } => Stream::Wal,
        Action::Hash { .. } => Stream::Hash,
        Action::Commit { .. } | Action::Checkpoint { .. } | Action::StateTransfer { .. } => {
            Stream::App
        }
        Action::AllocatedRequest { .. }
        | Action::CorrectRequest { .. }
        | Action::StateApplied { .. } => Stream::Client,
        // Becomes a Msg::ForwardRequest send once the payload is resolved,
        // so it trails the WAL stream exactly like that send would.
        Action::ForwardRequest { .. } => Stream::Wal,
    }
}

/// Pending work, split per worker stream. Each stream is an ordered FIFO;
/// batches are taken whole and moved to workers.
#[derive(Debug, Default)]
pub struct WorkItems {
    wal_actions: ActionList,
    net_actions: ActionList,
    hash_actions: ActionList,
    client_actions: ActionList,
    app_actions: ActionList,
    req_store_events: EventList,
    result_events: EventList,
}

impl WorkItems {
    /// Create empty work items.
    pub fn new() -> Self {
        Self::default()
    }

    /// Route a batch of state machine output into the streams.
    pub fn add_state_machine_results(&mut self, actions: ActionList) {
        for action in actions {
            match stream_of(&action) {
                Stream::Wal => self.wal_actions.push(action),
                Stream::Net => self.net_actions.push(action),
                Stream::Hash => self.hash_actions.push(action),
                Stream::Client => self.client_actions.push(action),
                Stream::App => self.app_actions.push(action),
            }
        }
    }

    /// WAL completions: the sends whose covering persist finished are now
    /// eligible for the network.
    pub fn add_wal_results(&mut self, actions: ActionList) {
        self.net_actions.push_list(actions);
    }

    /// Network worker completions (loopback steps).
    pub fn add_net_results(&mut self, events: EventList) {
        self.result_events.push_list(events);
    }

    /// Hash worker completions.
    pub fn add_hash_results(&mut self, events: EventList) {
        self.result_events.push_list(events);
    }

    /// Application worker completions.
    pub fn add_app_results(&mut self, events: EventList) {
        self.result_events.push_list(events);
    }

    /// Request-store worker completions.
    pub fn add_client_results(&mut self, events: EventList) {
        self.req_store_events.push_list(events);
    }

    /// Take a whole stream for handoff to its worker.
    pub fn take_wal_actions(&mut self) -> ActionList {
        self.wal_actions.take()
    }

    pub fn take_net_actions(&mut self) -> ActionList {
        self.net_actions.take()
    }

    pub fn take_hash_actions(&mut self) -> ActionList {
        self.hash_actions.take()
    }

    pub fn take_client_actions(&mut self) -> ActionList {
        self.client_actions.take()
    }

    pub fn take_app_actions(&mut self) -> ActionList {
        self.app_actions.take()
    }

    pub fn wal_actions(&self) -> &ActionList {
        &self.wal_actions
    }

    pub fn net_actions(&self) -> &ActionList {
        &self.net_actions
    }

    pub fn hash_actions(&self) -> &ActionList {
        &self.hash_actions
    }

    pub fn client_actions(&self) -> &ActionList {
        &self.client_actions
    }

    pub fn app_actions(&self) -> &ActionList {
        &self.app_actions
    }

    /// Pop the next pending event, request-store events first.
    pub fn pop_event(&mut self) -> Option<conclave_core::Event> {
        self.req_store_events.pop().or_else(|| self.result_events.pop())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conclave_core::HashOrigin;
    use conclave_types::{
        Batch, ClientId, Digest, EpochNo, NodeId, Persistent, Request, RequestAck, SeqNo,
    };

    fn ack() -> RequestAck {
        RequestAck {
            client: ClientId(0),
            req_no: 0,
            digest: Digest::ZERO,
        }
    }

    fn send(msg: Msg) -> Action {
        Action::Send {
            targets: vec![NodeId(0)],
            msg,
        }
    }

    #[test]
    fn test_request_ack_send_never_touches_the_wal() {
        let mut wi = WorkItems::new();
        wi.add_state_machine_results(ActionList::from(vec![send(Msg::RequestAck(ack()))]));
        assert_eq!(wi.wal_actions().len(), 0);
        assert_eq!(wi.net_actions().len(), 1);
    }

    #[test]
    fn test_wal_independent_sends() {
        for msg in [
            Msg::RequestAck(ack()),
            Msg::Checkpoint {
                seq: SeqNo(20),
                value: vec![],
                attestation: vec![],
            },
            Msg::FetchBatch {
                seq: SeqNo(1),
                digest: Digest::ZERO,
            },
            Msg::ForwardBatch {
                seq: SeqNo(1),
                digest: Digest::ZERO,
                requests: vec![],
            },
        ] {
            assert_eq!(stream_of(&send(msg)), Stream::Net);
        }
    }

    #[test]
    fn test_protocol_sends_are_wal_dependent() {
        for msg in [
            Msg::Preprepare {
                seq: SeqNo(1),
                epoch: EpochNo(0),
                batch: vec![],
            },
            Msg::Prepare {
                seq: SeqNo(1),
                epoch: EpochNo(0),
                digest: Digest::ZERO,
            },
            Msg::Commit {
                seq: SeqNo(1),
                epoch: EpochNo(0),
                digest: Digest::ZERO,
            },
            Msg::Suspect {
                epoch: EpochNo(0),
            },
            Msg::EpochChange {
                new_epoch: EpochNo(1),
                stable_seq: SeqNo(0),
                stable_value: vec![],
            },
            Msg::EpochChangeAck {
                new_epoch: EpochNo(1),
                origin: NodeId(0),
            },
            Msg::NewEpoch {
                new_epoch: EpochNo(1),
                start_seq: SeqNo(0),
            },
            Msg::NewEpochEcho {
                new_epoch: EpochNo(1),
                start_seq: SeqNo(0),
            },
            Msg::NewEpochReady {
                new_epoch: EpochNo(1),
                start_seq: SeqNo(0),
            },
            Msg::FetchRequest {
                client: ClientId(0),
                req_no: 0,
            },
            Msg::ForwardRequest {
                request: Request {
                    client: ClientId(0),
                    req_no: 0,
                    data: vec![],
                },
                digest: Digest::ZERO,
            },
        ] {
            assert_eq!(stream_of(&send(msg)), Stream::Wal);
        }
    }

    #[test]
    fn test_every_non_send_action_has_a_stream() {
        let actions = vec![
            (
                Action::Hash {
                    data: vec![],
                    origin: HashOrigin::Batch { seq: SeqNo(1) },
                },
                Stream::Hash,
            ),
            (
                Action::AppendWriteAhead {
                    entry: Persistent::Suspect {
                        epoch: EpochNo(0),
                    },
                },
                Stream::Wal,
            ),
            (
                Action::TruncateWriteAhead { to_seq: SeqNo(0) },
                Stream::Wal,
            ),
            (
                Action::Commit {
                    batch: Batch {
                        seq: SeqNo(1),
                        digest: Digest::ZERO,
                        requests: vec![],
                    },
                },
                Stream::App,
            ),
            (Action::Checkpoint { seq: SeqNo(20) }, Stream::App),
            (
                Action::StateTransfer {
                    seq: SeqNo(20),
                    value: vec![],
                },
                Stream::App,
            ),
            (
                Action::AllocatedRequest {
                    client: ClientId(0),
                    req_no: 0,
                },
                Stream::Client,
            ),
            (Action::CorrectRequest { ack: ack() }, Stream::Client),
            (Action::StateApplied { seq: SeqNo(20) }, Stream::Client),
            (
                Action::ForwardRequest {
                    target: NodeId(1),
                    ack: ack(),
                },
                Stream::Wal,
            ),
        ];
        for (action, expected) in actions {
            assert_eq!(stream_of(&action), expected, "{:?}", action);
        }
    }

    #[test]
    fn test_forward_request_rides_the_wal_stream_to_the_net_worker() {
        let mut wi = WorkItems::new();
        let forward = Action::ForwardRequest {
            target: NodeId(1),
            ack: ack(),
        };
        wi.add_state_machine_results(ActionList::from(vec![forward.clone()]));
        assert_eq!(wi.net_actions().len(), 0);
        assert_eq!(wi.wal_actions().len(), 1);

        // The WAL worker defers it with the persist-dependent sends; once
        // the batch syncs it becomes eligible for the network worker.
        let deferred = wi.take_wal_actions();
        wi.add_wal_results(deferred);
        let net: Vec<_> = wi.take_net_actions().into_iter().collect();
        assert_eq!(net, vec![forward]);
    }

    #[test]
    fn test_wal_results_feed_the_net_stream_in_order() {
        let mut wi = WorkItems::new();
        wi.add_state_machine_results(ActionList::from(vec![send(Msg::RequestAck(ack()))]));
        wi.add_wal_results(ActionList::from(vec![send(Msg::Prepare {
            seq: SeqNo(1),
            epoch: EpochNo(0),
            digest: Digest::ZERO,
        })]));
        let net: Vec<_> = wi.take_net_actions().into_iter().collect();
        assert_eq!(net.len(), 2);
        assert!(matches!(&net[0], Action::Send { msg: Msg::RequestAck(_), .. }));
        assert!(matches!(&net[1], Action::Send { msg: Msg::Prepare { .. }, .. }));
    }

    #[test]
    fn test_req_store_events_drain_before_result_events() {
        use conclave_core::{Event, EventList};
        let mut wi = WorkItems::new();
        wi.add_net_results(EventList::from(vec![Event::ActionsReceived]));
        wi.add_client_results(EventList::from(vec![Event::RequestPersisted { ack: ack() }]));
        assert!(matches!(
            wi.pop_event(),
            Some(Event::RequestPersisted { .. })
        ));
        assert!(matches!(wi.pop_event(), Some(Event::ActionsReceived)));
        assert!(wi.pop_event().is_none());
    }
}
