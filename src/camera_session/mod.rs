//! CameraSession - Per-Camera Recording Lifecycle
//!
//! ## Responsibilities
//!
//! - Own the local view of one camera (connection, recording, order code)
//! - Apply stream events, acks and snapshots in arrival order
//! - Hold stream events while a snapshot is outstanding, resync on stream gaps
//! - Keep the watchdog registration in step with Auto recordings
//! - Publish a read-only `SessionView` to consumers
//!
//! Each session is a task; its state is touched by nothing else. Commands
//! enter through `CommandGateway`, snapshots through `ReconciliationService`.
//! Closing a session never sends stop or disconnect to the backend.

mod machine;
mod registry;
pub mod types;

pub use machine::{manual_order_code, toggle_command, SessionMachine};
pub use registry::SessionRegistry;
pub use types::{Command, Effect, PendingCommand, Recording, SessionView, UNTRACKED_ORDER_CODE};

use crate::camera_api::CommandAck;
use crate::channel_router::{CameraSubscription, ChannelRouter, Routed};
use crate::command_gateway::CommandGateway;
use crate::error::{Error, Result};
use crate::models::{CameraId, SessionSnapshot};
use crate::presence_watchdog::{PresenceReading, PresenceWatchdog, WatchdogSignal};
use crate::reconciliation_service::ReconciliationService;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use types::{rejected, Step};
use uuid::Uuid;

type AckReceiver = oneshot::Receiver<Result<CommandAck>>;

/// Inputs processed by the session task
pub(crate) enum SessionInput {
    Begin {
        command: Command,
        reply: oneshot::Sender<Result<(PendingCommand, AckReceiver)>>,
    },
    Settle {
        id: u64,
        outcome: Result<CommandAck>,
    },
    /// Fetched snapshot, or the user-facing reason it failed
    Snapshot(std::result::Result<SessionSnapshot, String>),
    TransportLost,
    Shutdown,
}

/// Shared components every session is wired to
#[derive(Clone)]
pub struct SessionDeps {
    pub router: Arc<ChannelRouter>,
    pub watchdog: Arc<PresenceWatchdog>,
    pub reconciler: Arc<ReconciliationService>,
    pub gateway: Arc<CommandGateway>,
    /// Minimum spacing of closure probes while the countdown sits at zero
    pub closure_reprobe: Duration,
}

/// Delivery slot for a snapshot; does not keep the session alive
#[derive(Clone)]
pub struct SnapshotSink {
    camera_id: CameraId,
    session_id: Uuid,
    input: mpsc::WeakUnboundedSender<SessionInput>,
}

impl SnapshotSink {
    pub fn camera_id(&self) -> CameraId {
        self.camera_id
    }

    /// Distinguishes a reopened session from its predecessor
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Returns false when the session is gone
    pub fn deliver(&self, snapshot: &Result<SessionSnapshot>) -> bool {
        let snapshot = match snapshot {
            Ok(snapshot) => Ok(snapshot.clone()),
            Err(e) => Err(e.user_message()),
        };
        match self.input.upgrade() {
            Some(tx) => tx.send(SessionInput::Snapshot(snapshot)).is_ok(),
            None => false,
        }
    }
}

/// Cloneable handle to a running session
#[derive(Clone)]
pub struct SessionHandle {
    camera_id: CameraId,
    session_id: Uuid,
    input: mpsc::UnboundedSender<SessionInput>,
    view_rx: watch::Receiver<SessionView>,
    watchdog: Arc<PresenceWatchdog>,
    gateway: Arc<CommandGateway>,
}

impl SessionHandle {
    pub fn camera_id(&self) -> CameraId {
        self.camera_id
    }

    /// Current view
    pub fn view(&self) -> SessionView {
        self.view_rx.borrow().clone()
    }

    /// Observe view changes
    pub fn subscribe(&self) -> watch::Receiver<SessionView> {
        self.view_rx.clone()
    }

    /// Idle countdown; inactive unless recording in Auto
    pub async fn presence(&self) -> PresenceReading {
        self.watchdog.reading(self.camera_id).await
    }

    pub async fn start(&self) -> Result<CommandAck> {
        self.gateway.issue(self, Command::StartRecording).await
    }

    pub async fn stop(&self, note: Option<String>) -> Result<CommandAck> {
        self.gateway
            .issue(self, Command::StopRecording { note })
            .await
    }

    /// Start when idle, stop a manual recording
    pub async fn toggle(&self) -> Result<CommandAck> {
        let command = toggle_command(self.camera_id, self.view().recording)?;
        self.gateway.issue(self, command).await
    }

    pub async fn connect(&self) -> Result<CommandAck> {
        self.gateway.issue(self, Command::Connect).await
    }

    pub async fn disconnect(&self) -> Result<CommandAck> {
        self.gateway.issue(self, Command::Disconnect).await
    }

    pub fn is_closed(&self) -> bool {
        self.input.is_closed()
    }

    pub fn snapshot_sink(&self) -> SnapshotSink {
        SnapshotSink {
            camera_id: self.camera_id,
            session_id: self.session_id,
            input: self.input.downgrade(),
        }
    }

    /// Mark a command pending; the receiver resolves when it settles
    pub(crate) async fn begin(&self, command: Command) -> Result<(PendingCommand, AckReceiver)> {
        let (reply, rx) = oneshot::channel();
        self.input
            .send(SessionInput::Begin { command, reply })
            .map_err(|_| Error::SessionClosed(self.camera_id))?;
        rx.await.map_err(|_| Error::SessionClosed(self.camera_id))?
    }

    pub(crate) fn settle(&self, id: u64, outcome: Result<CommandAck>) {
        if self.input.send(SessionInput::Settle { id, outcome }).is_err() {
            tracing::debug!(camera_id = %self.camera_id, command_id = id, "Session closed before settlement");
        }
    }

    pub(crate) fn transport_lost(&self) {
        let _ = self.input.send(SessionInput::TransportLost);
    }

    pub(crate) fn shutdown(&self) {
        let _ = self.input.send(SessionInput::Shutdown);
    }
}

/// Open a session: subscribe, spawn its task and request the initial snapshot
pub async fn spawn_session(camera_id: CameraId, deps: &SessionDeps) -> SessionHandle {
    // Subscribe before anything can be published for this camera
    let subscription = deps.router.for_camera(camera_id);

    let session_id = Uuid::new_v4();
    let machine = SessionMachine::new(camera_id, deps.closure_reprobe);
    let (input_tx, input_rx) = mpsc::unbounded_channel();
    let (view_tx, view_rx) = watch::channel(machine.view());
    let (signal_tx, signal_rx) = mpsc::unbounded_channel();

    let task = SessionTask {
        camera_id,
        machine,
        view_tx,
        waiter: None,
        signal_tx,
        sink: SnapshotSink {
            camera_id,
            session_id,
            input: input_tx.downgrade(),
        },
        watchdog: deps.watchdog.clone(),
        reconciler: deps.reconciler.clone(),
    };
    tokio::spawn(task.run(subscription, input_rx, signal_rx));

    let handle = SessionHandle {
        camera_id,
        session_id,
        input: input_tx,
        view_rx,
        watchdog: deps.watchdog.clone(),
        gateway: deps.gateway.clone(),
    };

    deps.reconciler.request(handle.snapshot_sink()).await;
    handle
}

struct SessionTask {
    camera_id: CameraId,
    machine: SessionMachine,
    view_tx: watch::Sender<SessionView>,
    /// Caller waiting on the pending command
    waiter: Option<(u64, oneshot::Sender<Result<CommandAck>>)>,
    signal_tx: mpsc::UnboundedSender<WatchdogSignal>,
    sink: SnapshotSink,
    watchdog: Arc<PresenceWatchdog>,
    reconciler: Arc<ReconciliationService>,
}

impl SessionTask {
    async fn run(
        mut self,
        mut subscription: CameraSubscription,
        mut input_rx: mpsc::UnboundedReceiver<SessionInput>,
        mut signal_rx: mpsc::UnboundedReceiver<WatchdogSignal>,
    ) {
        tracing::info!(camera_id = %self.camera_id, "Camera session opened");

        loop {
            tokio::select! {
                biased;

                input = input_rx.recv() => match input {
                    Some(SessionInput::Shutdown) | None => break,
                    Some(input) => self.handle_input(input).await,
                },

                routed = subscription.recv() => match routed {
                    Some(Routed::Message(message)) => {
                        let step = self.machine.on_message(&message, Instant::now());
                        self.apply(step).await;
                    }
                    Some(Routed::Gap { skipped }) => {
                        let step = self.machine.stream_gap(skipped);
                        self.apply(step).await;
                    }
                    None => {
                        tracing::warn!(camera_id = %self.camera_id, "Camera channel closed");
                        break;
                    }
                },

                Some(signal) = signal_rx.recv() => match signal {
                    WatchdogSignal::Expired { ticks } => {
                        let step = self.machine.on_presence_expired(ticks, Instant::now());
                        self.apply(step).await;
                    }
                },
            }

            self.publish();
        }

        // Local teardown only; the remote recording keeps running
        self.watchdog.release(self.camera_id).await;
        if let Some((_, waiter)) = self.waiter.take() {
            let _ = waiter.send(Err(Error::SessionClosed(self.camera_id)));
        }
        tracing::info!(camera_id = %self.camera_id, "Camera session closed");
    }

    async fn handle_input(&mut self, input: SessionInput) {
        let now = Instant::now();
        match input {
            SessionInput::Begin { command, reply } => match self.machine.begin(command, now) {
                Ok((pending, superseded)) => {
                    if let Some(old) = superseded {
                        self.cancel_waiter(&old);
                    }
                    let (tx, rx) = oneshot::channel();
                    self.waiter = Some((pending.id, tx));
                    let _ = reply.send(Ok((pending, rx)));
                }
                Err(e) => {
                    tracing::debug!(camera_id = %self.camera_id, error = %e, "Command rejected");
                    let _ = reply.send(Err(e));
                }
            },
            SessionInput::Settle { id, outcome } => {
                let step = self.machine.settle(id, outcome, now);
                self.apply(step).await;
            }
            SessionInput::Snapshot(Ok(snapshot)) => {
                let step = self.machine.apply_snapshot(snapshot, now);
                self.apply(step).await;
            }
            SessionInput::Snapshot(Err(message)) => {
                let step = self.machine.snapshot_failed(message, now);
                self.apply(step).await;
            }
            SessionInput::TransportLost => self.machine.transport_lost(),
            SessionInput::Shutdown => {}
        }
    }

    fn cancel_waiter(&mut self, superseded: &PendingCommand) {
        match self.waiter.take() {
            Some((id, waiter)) if id == superseded.id => {
                let _ = waiter.send(Err(rejected(
                    self.camera_id,
                    &superseded.command,
                    "superseded by stop",
                )));
            }
            other => self.waiter = other,
        }
    }

    async fn apply(&mut self, step: Step) {
        for effect in step.effects {
            match effect {
                Effect::WatchPresence(at) => {
                    self.watchdog
                        .watch(self.camera_id, at, self.signal_tx.clone())
                        .await
                }
                Effect::TouchPresence(at) => self.watchdog.touch(self.camera_id, at).await,
                Effect::ReleasePresence => self.watchdog.release(self.camera_id).await,
                Effect::RequestSnapshot => self.reconciler.request(self.sink.clone()).await,
            }
        }

        if let Some(settled) = step.settled {
            match self.waiter.take() {
                Some((id, waiter)) if id == settled.command.id => {
                    let _ = waiter.send(settled.outcome);
                }
                other => self.waiter = other,
            }
        }
    }

    fn publish(&self) {
        let view = self.machine.view();
        self.view_tx.send_if_modified(|current| {
            if *current == view {
                false
            } else {
                *current = view;
                true
            }
        });
    }
}
