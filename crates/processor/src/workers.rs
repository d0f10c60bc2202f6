//! Worker tasks: one per stream, each wrapping a collaborator.
//!
//! Workers receive owned action batches over a capacity-one channel (the
//! handoff doubles as the idle signal) and report every batch completion
//! back to the serializer, even when the completion carries no events: the
//! completion message is also what re-arms stream offering.

use crate::WorkerResult;
use conclave_core::{
    Action, ActionList, ActionResults, Application, Event, EventList, Hasher, NetworkTransport,
    RequestStore, WalStorage,
};
use conclave_types::{Msg, NodeId};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Shared handle to the request store.
///
/// The store is the one collaborator touched from two sides: the submission
/// path writes payloads before the machine sees the event, and the client
/// worker validates them afterwards.
pub type SharedRequestStore = Arc<Mutex<Box<dyn RequestStore>>>;

pub(crate) async fn run_wal_worker(
    mut rx: mpsc::Receiver<ActionList>,
    tx: mpsc::Sender<WorkerResult>,
    mut wal: Box<dyn WalStorage>,
) {
    while let Some(batch) = rx.recv().await {
        let mut deferred = ActionList::new();
        for action in batch {
            let result = match action {
                Action::AppendWriteAhead { entry } => wal.append(&entry).map(|_| ()),
                Action::TruncateWriteAhead { to_seq } => wal.truncate(to_seq),
                Action::Send { .. } | Action::ForwardRequest { .. } => {
                    // Persist-dependent send: emitted onto the network only
                    // after every append ahead of it has landed.
                    deferred.push(action);
                    Ok(())
                }
                other => {
                    warn!(action = other.type_name(), "misrouted action on the WAL stream");
                    Ok(())
                }
            };
            if let Err(error) = result {
                let _ = tx.send(WorkerResult::failed("wal", error)).await;
                return;
            }
        }
        if let Err(error) = wal.sync() {
            let _ = tx.send(WorkerResult::failed("wal", error)).await;
            return;
        }
        if tx.send(WorkerResult::Wal(deferred)).await.is_err() {
            return;
        }
    }
}

pub(crate) async fn run_net_worker(
    mut rx: mpsc::Receiver<ActionList>,
    tx: mpsc::Sender<WorkerResult>,
    mut transport: Box<dyn NetworkTransport>,
    local: NodeId,
    store: SharedRequestStore,
) {
    while let Some(batch) = rx.recv().await {
        let mut events = EventList::new();
        for action in batch {
            match action {
                Action::Send { targets, msg } => {
                    let remote: Vec<NodeId> =
                        targets.iter().copied().filter(|t| *t != local).collect();
                    if !remote.is_empty() {
                        transport.send(&remote, &msg);
                    }
                    // Self-addressed messages loop back as steps; the
                    // machine treats its own traffic like anyone else's.
                    if targets.contains(&local) {
                        events.push(Event::Step { source: local, msg });
                    }
                }
                Action::ForwardRequest { target, ack } => {
                    // Resolve the payload the machine only knows by ack.
                    let request = store.lock().fetch(ack.client, ack.req_no);
                    match request {
                        Some(request) => {
                            let msg = Msg::ForwardRequest {
                                request,
                                digest: ack.digest,
                            };
                            if target == local {
                                events.push(Event::Step { source: local, msg });
                            } else {
                                transport.send(&[target], &msg);
                            }
                        }
                        None => debug!(
                            client = %ack.client,
                            req_no = ack.req_no,
                            "payload to forward is no longer stored"
                        ),
                    }
                }
                other => warn!(action = other.type_name(), "misrouted action on the net stream"),
            }
        }
        if tx.send(WorkerResult::Net(events)).await.is_err() {
            return;
        }
    }
}

pub(crate) async fn run_hash_worker(
    mut rx: mpsc::Receiver<ActionList>,
    tx: mpsc::Sender<WorkerResult>,
    hasher: Box<dyn Hasher>,
) {
    while let Some(batch) = rx.recv().await {
        let mut results = ActionResults::default();
        for action in batch {
            match action {
                Action::Hash { data, origin } => {
                    let digest = hasher.hash(&origin, &data);
                    results
                        .digests
                        .push(conclave_core::HashResult { origin, digest });
                }
                other => warn!(action = other.type_name(), "misrouted action on the hash stream"),
            }
        }
        let mut events = EventList::new();
        if !results.digests.is_empty() {
            events.push(Event::AddResults { results });
        }
        if tx.send(WorkerResult::Hash(events)).await.is_err() {
            return;
        }
    }
}

pub(crate) async fn run_client_worker(
    mut rx: mpsc::Receiver<ActionList>,
    tx: mpsc::Sender<WorkerResult>,
    store: SharedRequestStore,
) {
    while let Some(batch) = rx.recv().await {
        let mut events = EventList::new();
        {
            let mut store = store.lock();
            for action in batch {
                match action {
                    Action::AllocatedRequest { client, req_no } => {
                        match store.validate(client, req_no) {
                            Some(ack) => events.push(Event::RequestPersisted { ack }),
                            None => {
                                debug!(%client, req_no, "request store rejected the payload")
                            }
                        }
                    }
                    Action::CorrectRequest { ack } => store.mark_correct(&ack),
                    Action::StateApplied { seq } => store.applied(seq),
                    other => {
                        warn!(action = other.type_name(), "misrouted action on the client stream")
                    }
                }
            }
        }
        if tx.send(WorkerResult::Client(events)).await.is_err() {
            return;
        }
    }
}

pub(crate) async fn run_app_worker(
    mut rx: mpsc::Receiver<ActionList>,
    tx: mpsc::Sender<WorkerResult>,
    mut app: Box<dyn Application>,
) {
    while let Some(batch) = rx.recv().await {
        let mut events = EventList::new();
        for action in batch {
            let result = match action {
                Action::Commit { batch } => app.commit(&batch),
                Action::Checkpoint { seq } => match app.snapshot(seq) {
                    Ok(checkpoint) => {
                        events.push(Event::AddResults {
                            results: ActionResults {
                                digests: vec![],
                                checkpoints: vec![checkpoint],
                            },
                        });
                        Ok(())
                    }
                    Err(error) => Err(error),
                },
                Action::StateTransfer { seq, value } => {
                    match app.transfer_to(seq, &value) {
                        Ok(()) => {
                            events.push(Event::Transfer { seq, value });
                            Ok(())
                        }
                        Err(error) => Err(error),
                    }
                }
                other => {
                    warn!(action = other.type_name(), "misrouted action on the app stream");
                    Ok(())
                }
            };
            if let Err(error) = result {
                let _ = tx.send(WorkerResult::failed("application", error)).await;
                return;
            }
        }
        if tx.send(WorkerResult::App(events)).await.is_err() {
            return;
        }
    }
}
