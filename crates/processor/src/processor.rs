//! The processor: a single serializer task owning the state machine, plus
//! one worker task per stream.
//!
//! The serializer is the only task that touches the machine or the work
//! items. It accepts external submissions and worker completions, applies
//! events one at a time, routes the produced actions into streams, and
//! offers non-empty streams to idle workers. Every handoff is acknowledged
//! to the machine with an `ActionsReceived` event.

use crate::work_items::WorkItems;
use crate::workers::{
    run_app_worker, run_client_worker, run_hash_worker, run_net_worker, run_wal_worker,
    SharedRequestStore,
};
use conclave_core::{
    Application, Event, EventInterceptor, EventList, Fault, Hasher, NetworkTransport,
    RequestStore, WalStorage,
};
use conclave_core::ActionList;
use conclave_statemachine::{replay_events, MachineConfig, StateMachine, StateMachineStatus};
use conclave_types::{Msg, NetworkState, NodeId, Request};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Terminal causes of a processor exit.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProcessorError {
    /// The distinguished clean-shutdown cause.
    #[error("stopped at caller request")]
    Stopped,

    #[error("state machine fault: {0}")]
    Fault(#[from] Fault),

    #[error("{worker} worker failed: {message}")]
    WorkerFailed {
        worker: &'static str,
        message: String,
    },

    #[error("processor is not running")]
    NotRunning,

    #[error("builder is missing the {0} collaborator")]
    MissingCollaborator(&'static str),
}

/// Completion message from a worker back to the serializer.
#[derive(Debug)]
pub(crate) enum WorkerResult {
    /// Deferred sends whose covering persist completed.
    Wal(ActionList),
    Net(EventList),
    Hash(EventList),
    Client(EventList),
    App(EventList),
    Failed {
        worker: &'static str,
        message: String,
    },
}

impl WorkerResult {
    pub(crate) fn failed(worker: &'static str, error: std::io::Error) -> Self {
        WorkerResult::Failed {
            worker,
            message: error.to_string(),
        }
    }
}

enum Submission {
    Event(Event),
    Status(oneshot::Sender<StateMachineStatus>),
}

/// Builder for a [`Processor`].
pub struct ProcessorBuilder {
    node_id: NodeId,
    network_state: NetworkState,
    machine_config: MachineConfig,
    submission_capacity: usize,
    tick_interval: Option<Duration>,
    wal: Option<Box<dyn WalStorage>>,
    transport: Option<Box<dyn NetworkTransport>>,
    hasher: Option<Box<dyn Hasher>>,
    application: Option<Box<dyn Application>>,
    request_store: Option<Box<dyn RequestStore>>,
    interceptor: Option<Box<dyn EventInterceptor>>,
}

impl ProcessorBuilder {
    /// Start building a processor for `node_id` with the given initial
    /// network state.
    pub fn new(node_id: NodeId, network_state: NetworkState) -> Self {
        ProcessorBuilder {
            node_id,
            network_state,
            machine_config: MachineConfig::default(),
            submission_capacity: 1024,
            tick_interval: None,
            wal: None,
            transport: None,
            hasher: None,
            application: None,
            request_store: None,
            interceptor: None,
        }
    }

    /// Override the state machine's tick-derived timer configuration.
    pub fn machine_config(mut self, config: MachineConfig) -> Self {
        self.machine_config = config;
        self
    }

    /// Capacity of the external submission queue (default 1024).
    pub fn submission_capacity(mut self, capacity: usize) -> Self {
        self.submission_capacity = capacity;
        self
    }

    /// Drive `Tick` events automatically at this interval. Without it the
    /// caller supplies ticks via [`Processor::tick`].
    pub fn tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = Some(interval);
        self
    }

    /// Set the write-ahead log storage.
    pub fn wal(mut self, wal: Box<dyn WalStorage>) -> Self {
        self.wal = Some(wal);
        self
    }

    /// Set the network transport.
    pub fn transport(mut self, transport: Box<dyn NetworkTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Set the hasher.
    pub fn hasher(mut self, hasher: Box<dyn Hasher>) -> Self {
        self.hasher = Some(hasher);
        self
    }

    /// Set the application.
    pub fn application(mut self, application: Box<dyn Application>) -> Self {
        self.application = Some(application);
        self
    }

    /// Set the request store.
    pub fn request_store(mut self, store: Box<dyn RequestStore>) -> Self {
        self.request_store = Some(store);
        self
    }

    /// Record every applied event, in order, for offline replay (optional).
    pub fn interceptor(mut self, interceptor: Box<dyn EventInterceptor>) -> Self {
        self.interceptor = Some(interceptor);
        self
    }

    /// Recover the machine from the write-ahead log and start the
    /// serializer and worker tasks. Must be called within a tokio runtime.
    pub fn start(self) -> Result<Processor, ProcessorError> {
        let wal = self
            .wal
            .ok_or(ProcessorError::MissingCollaborator("wal storage"))?;
        let transport = self
            .transport
            .ok_or(ProcessorError::MissingCollaborator("network transport"))?;
        let hasher = self
            .hasher
            .ok_or(ProcessorError::MissingCollaborator("hasher"))?;
        let application = self
            .application
            .ok_or(ProcessorError::MissingCollaborator("application"))?;
        let request_store: SharedRequestStore = Arc::new(Mutex::new(
            self.request_store
                .ok_or(ProcessorError::MissingCollaborator("request store"))?,
        ));

        let mut machine = StateMachine::new(self.node_id, self.machine_config);
        let mut work_items = WorkItems::new();
        let mut interceptor = self.interceptor;

        // Recovery: replay the persisted prefix. On a restart the genesis
        // actions produced by Initialize are already in the log and are
        // discarded; on a fresh log they are this node's first persists.
        let replay = replay_events(wal.as_ref())
            .map_err(|e| ProcessorError::WorkerFailed {
                worker: "wal",
                message: e.to_string(),
            })?;
        let restarting = replay.len() > 1;
        let init_event = Event::Initialize {
            network_state: self.network_state,
        };
        intercept(&mut interceptor, &init_event)?;
        let init_actions = machine.apply(init_event)?;
        if !restarting {
            work_items.add_state_machine_results(init_actions);
        }
        for event in replay {
            intercept(&mut interceptor, &event)?;
            let actions = machine.apply(event)?;
            work_items.add_state_machine_results(actions);
        }
        info!(node = %self.node_id, restarting, "processor recovered, starting workers");

        let (submit_tx, submit_rx) = mpsc::channel(self.submission_capacity);
        let (result_tx, result_rx) = mpsc::channel(64);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let (wal_tx, wal_rx) = mpsc::channel(1);
        let (net_tx, net_rx) = mpsc::channel(1);
        let (hash_tx, hash_rx) = mpsc::channel(1);
        let (client_tx, client_rx) = mpsc::channel(1);
        let (app_tx, app_rx) = mpsc::channel(1);

        tokio::spawn(run_wal_worker(wal_rx, result_tx.clone(), wal));
        tokio::spawn(run_net_worker(
            net_rx,
            result_tx.clone(),
            transport,
            self.node_id,
            request_store.clone(),
        ));
        tokio::spawn(run_hash_worker(hash_rx, result_tx.clone(), hasher));
        tokio::spawn(run_client_worker(
            client_rx,
            result_tx.clone(),
            request_store.clone(),
        ));
        tokio::spawn(run_app_worker(app_rx, result_tx.clone(), application));

        let ticker = self.tick_interval.map(|interval| {
            let submit = submit_tx.clone();
            tokio::spawn(async move {
                let mut timer = tokio::time::interval(interval);
                timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    timer.tick().await;
                    if submit.send(Submission::Event(Event::Tick)).await.is_err() {
                        return;
                    }
                }
            })
        });

        let terminal: Arc<Mutex<Option<Terminal>>> = Arc::new(Mutex::new(None));
        let serializer = Serializer {
            machine,
            work_items,
            submit_rx,
            result_rx,
            shutdown_rx,
            streams: StreamSenders {
                wal: wal_tx,
                net: net_tx,
                hash: hash_tx,
                client: client_tx,
                app: app_tx,
            },
            interceptor,
            terminal: terminal.clone(),
        };
        let handle = tokio::spawn(serializer.run());

        Ok(Processor {
            node_id: self.node_id,
            submit_tx,
            shutdown_tx,
            request_store,
            terminal,
            handle: Some(handle),
            ticker,
        })
    }
}

/// Final state captured when the serializer exits.
struct Terminal {
    cause: ProcessorError,
    status: StateMachineStatus,
}

struct StreamSenders {
    wal: mpsc::Sender<ActionList>,
    net: mpsc::Sender<ActionList>,
    hash: mpsc::Sender<ActionList>,
    client: mpsc::Sender<ActionList>,
    app: mpsc::Sender<ActionList>,
}

struct Serializer {
    machine: StateMachine,
    work_items: WorkItems,
    submit_rx: mpsc::Receiver<Submission>,
    result_rx: mpsc::Receiver<WorkerResult>,
    shutdown_rx: watch::Receiver<bool>,
    streams: StreamSenders,
    interceptor: Option<Box<dyn EventInterceptor>>,
    terminal: Arc<Mutex<Option<Terminal>>>,
}

/// Run the interceptor, surfacing its failure as a worker failure: a trace
/// that silently stops recording is worse than a stopped node.
fn intercept(
    interceptor: &mut Option<Box<dyn EventInterceptor>>,
    event: &Event,
) -> Result<(), ProcessorError> {
    if let Some(interceptor) = interceptor {
        interceptor
            .intercept(event)
            .map_err(|e| ProcessorError::WorkerFailed {
                worker: "recorder",
                message: e.to_string(),
            })?;
    }
    Ok(())
}

impl Serializer {
    async fn run(mut self) {
        // Hand the recovery-produced work to workers before the first wait.
        let cause = match self.offer_all() {
            Err(cause) => cause,
            Ok(()) => loop {
                match self.turn().await {
                    Ok(true) => continue,
                    Ok(false) => break ProcessorError::Stopped,
                    Err(cause) => break cause,
                }
            },
        };
        match &cause {
            ProcessorError::Stopped => {
                info!(node = %self.machine.node_id(), "processor stopped at caller request")
            }
            other => warn!(node = %self.machine.node_id(), cause = %other, "processor exiting"),
        }
        *self.terminal.lock() = Some(Terminal {
            cause,
            status: self.machine.status(),
        });
    }

    /// One serializer turn: wait for input, apply pending events, offer
    /// streams. Returns `Ok(false)` on a clean shutdown request.
    async fn turn(&mut self) -> Result<bool, ProcessorError> {
        tokio::select! {
            biased;

            changed = self.shutdown_rx.changed() => {
                if changed.is_err() || *self.shutdown_rx.borrow() {
                    return Ok(false);
                }
            }
            Some(result) = self.result_rx.recv() => {
                self.intake(result)?;
            }
            submission = self.submit_rx.recv() => {
                match submission {
                    Some(Submission::Event(event)) => self.apply(event)?,
                    Some(Submission::Status(reply)) => {
                        let _ = reply.send(self.machine.status());
                    }
                    None => return Ok(false),
                }
            }
        }

        // Feed events produced by workers back to the machine, in order.
        while let Some(event) = self.work_items.pop_event() {
            self.apply(event)?;
        }

        // Offer non-empty streams to idle workers. A successful handoff is
        // acknowledged to the machine.
        self.offer_all()?;
        Ok(true)
    }

    fn intake(&mut self, result: WorkerResult) -> Result<(), ProcessorError> {
        match result {
            WorkerResult::Wal(actions) => self.work_items.add_wal_results(actions),
            WorkerResult::Net(events) => self.work_items.add_net_results(events),
            WorkerResult::Hash(events) => self.work_items.add_hash_results(events),
            WorkerResult::Client(events) => self.work_items.add_client_results(events),
            WorkerResult::App(events) => self.work_items.add_app_results(events),
            WorkerResult::Failed { worker, message } => {
                return Err(ProcessorError::WorkerFailed { worker, message })
            }
        }
        Ok(())
    }

    fn apply(&mut self, event: Event) -> Result<(), ProcessorError> {
        intercept(&mut self.interceptor, &event)?;
        let actions = self.machine.apply(event)?;
        self.work_items.add_state_machine_results(actions);
        Ok(())
    }

    fn offer_all(&mut self) -> Result<(), ProcessorError> {
        let mut handoffs = 0u32;
        if !self.work_items.wal_actions().is_empty() {
            if let Ok(permit) = self.streams.wal.try_reserve() {
                permit.send(self.work_items.take_wal_actions());
                handoffs += 1;
            }
        }
        if !self.work_items.net_actions().is_empty() {
            if let Ok(permit) = self.streams.net.try_reserve() {
                permit.send(self.work_items.take_net_actions());
                handoffs += 1;
            }
        }
        if !self.work_items.hash_actions().is_empty() {
            if let Ok(permit) = self.streams.hash.try_reserve() {
                permit.send(self.work_items.take_hash_actions());
                handoffs += 1;
            }
        }
        if !self.work_items.client_actions().is_empty() {
            if let Ok(permit) = self.streams.client.try_reserve() {
                permit.send(self.work_items.take_client_actions());
                handoffs += 1;
            }
        }
        if !self.work_items.app_actions().is_empty() {
            if let Ok(permit) = self.streams.app.try_reserve() {
                permit.send(self.work_items.take_app_actions());
                handoffs += 1;
            }
        }
        for _ in 0..handoffs {
            self.apply(Event::ActionsReceived)?;
        }
        Ok(())
    }
}

/// Handle to a running processor.
///
/// All methods are safe to call from any task. Dropping the handle signals
/// shutdown.
pub struct Processor {
    node_id: NodeId,
    submit_tx: mpsc::Sender<Submission>,
    shutdown_tx: watch::Sender<bool>,
    request_store: SharedRequestStore,
    terminal: Arc<Mutex<Option<Terminal>>>,
    handle: Option<JoinHandle<()>>,
    ticker: Option<JoinHandle<()>>,
}

impl Processor {
    /// The node this processor runs as.
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Submit a client request for ordering. The payload goes to the
    /// request store before the machine sees the proposal.
    pub async fn propose(&self, request: Request) -> Result<(), ProcessorError> {
        self.request_store.lock().store(request.clone());
        self.submit(Submission::Event(Event::Propose { request })).await
    }

    /// Deliver a protocol message received from `source`.
    pub async fn step(&self, source: NodeId, msg: Msg) -> Result<(), ProcessorError> {
        // Forwarded payloads are stored ahead of the machine's validation
        // decision, mirroring the local proposal path.
        if let Msg::ForwardRequest { request, .. } = &msg {
            self.request_store.lock().store(request.clone());
        }
        self.submit(Submission::Event(Event::Step { source, msg })).await
    }

    /// Advance the machine's logical clock by one tick.
    pub async fn tick(&self) -> Result<(), ProcessorError> {
        self.submit(Submission::Event(Event::Tick)).await
    }

    /// Snapshot the machine's status, serialized with event processing.
    ///
    /// After the processor has exited this returns the final status captured
    /// at exit, so a caller diagnosing a fault still sees the end state.
    pub async fn status(&self) -> Result<StateMachineStatus, ProcessorError> {
        let (tx, rx) = oneshot::channel();
        if self.submit_tx.send(Submission::Status(tx)).await.is_ok() {
            if let Ok(status) = rx.await {
                return Ok(status);
            }
        }
        // The serializer is exiting; its final snapshot lands in `terminal`
        // just before the task returns.
        for _ in 0..100 {
            if let Some(terminal) = self.terminal.lock().as_ref() {
                return Ok(terminal.status.clone());
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        Err(ProcessorError::NotRunning)
    }

    /// The terminal cause, once the processor has exited.
    pub fn exit_cause(&self) -> Option<ProcessorError> {
        self.terminal.lock().as_ref().map(|t| t.cause.clone())
    }

    /// Request a clean shutdown.
    pub fn stop(&self) {
        debug!(node = %self.node_id, "shutdown requested");
        let _ = self.shutdown_tx.send(true);
    }

    /// Wait for the processor to exit (after [`Processor::stop`] or a
    /// fault) and return its terminal cause.
    pub async fn wait(mut self) -> ProcessorError {
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
        self.terminal
            .lock()
            .as_ref()
            .map(|t| t.cause.clone())
            .unwrap_or(ProcessorError::NotRunning)
    }

    async fn submit(&self, submission: Submission) -> Result<(), ProcessorError> {
        self.submit_tx
            .send(submission)
            .await
            .map_err(|_| self.exit_cause().unwrap_or(ProcessorError::NotRunning))
    }
}

impl Drop for Processor {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(ticker) = &self.ticker {
            ticker.abort();
        }
    }
}
