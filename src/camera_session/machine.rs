//! Recording lifecycle state machine
//!
//! Pure transition logic: every input returns the side effects the owning
//! task must perform. Only authoritative inputs (stream events, acks,
//! snapshots) change recording state; a local timeout never does.
//!
//! While a snapshot is outstanding, stream events and acks are held in
//! arrival order and replayed on top of the merged snapshot, so a snapshot
//! taken before an event can never undo it.

use super::types::{
    rejected, Command, Effect, PendingCommand, Recording, SessionView, Settled, Step,
    UNTRACKED_ORDER_CODE,
};
use crate::camera_api::CommandAck;
use crate::error::{Error, Result};
use crate::models::{CameraId, ConnectionState, RecordingState, SessionSnapshot};
use crate::stream_message::{CommandKind, InboundMessage, MessagePayload, StreamAck, StreamEvent};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Client-assigned code for a manual recording the backend did not name
pub fn manual_order_code() -> String {
    format!("DH-{}", chrono::Utc::now().timestamp_millis())
}

/// Idle starts, Manual stops, Auto belongs to the detector
pub fn toggle_command(camera_id: CameraId, recording: RecordingState) -> Result<Command> {
    match recording {
        RecordingState::Idle => Ok(Command::StartRecording),
        RecordingState::Manual => Ok(Command::StopRecording { note: None }),
        RecordingState::Auto => Err(Error::CommandRejected {
            camera_id,
            command: "toggle".to_string(),
            reason: "recording is controlled by the detector".to_string(),
        }),
    }
}

pub struct SessionMachine {
    camera_id: CameraId,
    closure_reprobe: Duration,
    connection: ConnectionState,
    recording: Recording,
    pending: Option<PendingCommand>,
    buffered_snapshot: Option<SessionSnapshot>,
    synced: bool,
    awaiting_snapshot: bool,
    held: VecDeque<InboundMessage>,
    /// Order most recently closed; a start ack naming it is a replay
    last_closed_order: Option<String>,
    last_scanned_code: Option<String>,
    last_error: Option<String>,
    frames_received: u64,
    last_probe_at: Option<Instant>,
    next_command_id: u64,
}

impl SessionMachine {
    /// Starts unsynced in `Connecting`, holding events until the first snapshot
    pub fn new(camera_id: CameraId, closure_reprobe: Duration) -> Self {
        Self {
            camera_id,
            closure_reprobe,
            connection: ConnectionState::Connecting,
            recording: Recording::Idle,
            pending: None,
            buffered_snapshot: None,
            synced: false,
            awaiting_snapshot: true,
            held: VecDeque::new(),
            last_closed_order: None,
            last_scanned_code: None,
            last_error: None,
            frames_received: 0,
            last_probe_at: None,
            next_command_id: 1,
        }
    }

    pub fn recording(&self) -> &Recording {
        &self.recording
    }

    pub fn pending(&self) -> Option<&PendingCommand> {
        self.pending.as_ref()
    }

    /// Stream messages waiting for the outstanding snapshot
    pub fn held(&self) -> usize {
        self.held.len()
    }

    pub fn view(&self) -> SessionView {
        SessionView {
            camera_id: self.camera_id,
            connection: self.connection,
            recording: self.recording.state(),
            active_order_code: self.recording.order_code().map(str::to_string),
            last_presence_at: self.recording.last_presence_at(),
            pending_command: self.pending.clone(),
            synced: self.synced,
            last_scanned_code: self.last_scanned_code.clone(),
            last_error: self.last_error.clone(),
            frames_received: self.frames_received,
        }
    }

    // ========================================
    // Commands
    // ========================================

    /// Mark a command as pending. Returns the new pending command and the
    /// start it cancelled, if any.
    pub fn begin(
        &mut self,
        command: Command,
        now: Instant,
    ) -> Result<(PendingCommand, Option<PendingCommand>)> {
        match &self.pending {
            Some(pending) => {
                let cancels_start = matches!(command, Command::StopRecording { .. })
                    && pending.kind() == CommandKind::Start;
                if !cancels_start {
                    return Err(rejected(
                        self.camera_id,
                        &command,
                        format!("{} command pending", pending.kind()),
                    ));
                }
            }
            None => self.validate(&command)?,
        }

        let superseded = self.pending.take();
        let id = self.next_command_id;
        self.next_command_id += 1;

        let order_code = match command {
            Command::StopRecording { .. } => self.recording.order_code().map(str::to_string),
            _ => None,
        };

        let pending = PendingCommand {
            id,
            command,
            order_code,
            issued_at: now,
            supersedes: superseded.as_ref().map(|p| p.id),
        };

        tracing::info!(
            camera_id = %self.camera_id,
            command = %pending.command,
            command_id = id,
            supersedes = ?pending.supersedes,
            "Command pending"
        );

        self.pending = Some(pending.clone());
        self.last_error = None;
        Ok((pending, superseded))
    }

    fn validate(&self, command: &Command) -> Result<()> {
        let reason = match command {
            Command::StartRecording if self.recording != Recording::Idle => "already recording",
            Command::StopRecording { .. } if self.recording == Recording::Idle => "not recording",
            Command::Connect if self.connection == ConnectionState::Live => "already connected",
            Command::Disconnect if self.connection == ConnectionState::Off => {
                "already disconnected"
            }
            _ => return Ok(()),
        };
        Err(rejected(self.camera_id, command, reason))
    }

    /// Resolve the pending command. Stale ids are ignored.
    pub fn settle(&mut self, id: u64, outcome: Result<CommandAck>, now: Instant) -> Step {
        let pending = match self.pending.take() {
            Some(pending) if pending.id == id => pending,
            other => {
                self.pending = other;
                tracing::debug!(
                    camera_id = %self.camera_id,
                    command_id = id,
                    "Ignoring settlement of a command that is no longer pending"
                );
                return Step::default();
            }
        };

        let mut step = Step::default();
        let mut resync = false;
        match &outcome {
            Ok(ack) => self.apply_ack(&pending, ack, &mut step.effects),
            Err(e) => {
                tracing::warn!(
                    camera_id = %self.camera_id,
                    command = %pending.command,
                    error = %e,
                    "Command failed, state unchanged"
                );
                self.last_error = Some(e.user_message());
                // A cancelled start may or may not have taken effect
                resync = pending.supersedes.is_some();
            }
        }

        step.settled = Some(Settled {
            command: pending,
            outcome,
        });

        if let Some(snapshot) = self.buffered_snapshot.take() {
            tracing::debug!(camera_id = %self.camera_id, "Applying buffered snapshot");
            self.merge_snapshot(snapshot, now, &mut step.effects);
            self.replay_held(now, &mut step);
        }
        if resync {
            step.effects.push(self.request_snapshot());
        }
        step
    }

    fn apply_ack(&mut self, pending: &PendingCommand, ack: &CommandAck, effects: &mut Vec<Effect>) {
        match pending.command {
            Command::StartRecording => {
                if self.recording != Recording::Idle {
                    tracing::debug!(camera_id = %self.camera_id, "Start acknowledged but already recording");
                    return;
                }
                let order_code = ack
                    .order_code
                    .clone()
                    .filter(|c| !c.trim().is_empty())
                    .unwrap_or_else(manual_order_code);
                tracing::info!(
                    camera_id = %self.camera_id,
                    order_code = %order_code,
                    "Recording started (MANUAL)"
                );
                self.recording = Recording::Manual { order_code };
            }
            Command::StopRecording { .. } => {
                let Some(active) = self.recording.order_code() else {
                    tracing::debug!(camera_id = %self.camera_id, "Stop acknowledged, already idle");
                    return;
                };
                match pending.order_code.as_deref() {
                    Some(stopped) if stopped != active => {
                        tracing::info!(
                            camera_id = %self.camera_id,
                            stopped_order = %stopped,
                            active_order = %active,
                            "Stop acknowledged for a previous order, keeping current recording"
                        );
                    }
                    _ => {
                        tracing::info!(camera_id = %self.camera_id, order_code = %active, "Recording stopped by operator");
                        self.enter_idle(effects);
                    }
                }
            }
            Command::Connect => {
                if self.connection == ConnectionState::Off {
                    self.connection = ConnectionState::Connecting;
                }
                tracing::info!(camera_id = %self.camera_id, "Camera connect acknowledged");
            }
            Command::Disconnect => {
                self.connection = ConnectionState::Off;
                tracing::info!(camera_id = %self.camera_id, "Camera disconnected");
            }
        }
    }

    // ========================================
    // Stream input
    // ========================================

    pub fn on_message(&mut self, message: &InboundMessage, now: Instant) -> Step {
        let is_frame = matches!(message.payload, MessagePayload::Frame { .. });
        if self.awaiting_snapshot && !is_frame {
            tracing::debug!(
                camera_id = %self.camera_id,
                kind = ?message.kind(),
                held = self.held.len() + 1,
                "Holding message until snapshot"
            );
            self.held.push_back(message.clone());
            return Step::default();
        }
        self.dispatch(message, now)
    }

    fn dispatch(&mut self, message: &InboundMessage, now: Instant) -> Step {
        match &message.payload {
            MessagePayload::Frame { .. } => {
                if self.connection != ConnectionState::Live {
                    tracing::info!(camera_id = %self.camera_id, "Camera live");
                    self.connection = ConnectionState::Live;
                }
                self.frames_received += 1;
                Step::default()
            }
            MessagePayload::Event(event) => self.on_event(event, now),
            MessagePayload::Ack(ack) => self.on_stream_ack(ack, now),
            MessagePayload::Error { message } => {
                tracing::warn!(camera_id = %self.camera_id, error = %message, "Backend reported camera error");
                self.last_error = Some(message.clone());
                Step::default()
            }
        }
    }

    fn on_event(&mut self, event: &StreamEvent, now: Instant) -> Step {
        match event {
            StreamEvent::OrderCreated { order_code } => match &self.recording {
                Recording::Manual { .. } => {
                    tracing::debug!(
                        camera_id = %self.camera_id,
                        order_code = %order_code,
                        "Ignoring order-created during manual recording"
                    );
                    Step::default()
                }
                Recording::Auto {
                    order_code: active, ..
                } if active == order_code => {
                    tracing::debug!(camera_id = %self.camera_id, order_code = %order_code, "Duplicate order-created");
                    Step::default()
                }
                Recording::Auto {
                    order_code: active, ..
                } => {
                    tracing::info!(
                        camera_id = %self.camera_id,
                        previous = %active,
                        order_code = %order_code,
                        "Detector moved to next order"
                    );
                    self.enter_auto(order_code.clone(), now)
                }
                Recording::Idle => {
                    if self.pending.as_ref().map(PendingCommand::kind) == Some(CommandKind::Start) {
                        tracing::debug!(
                            camera_id = %self.camera_id,
                            order_code = %order_code,
                            "Ignoring order-created while manual start is pending"
                        );
                        return Step::default();
                    }
                    tracing::info!(camera_id = %self.camera_id, order_code = %order_code, "Recording started (AUTO)");
                    self.enter_auto(order_code.clone(), now)
                }
            },
            StreamEvent::OrderStopped { order_code } => {
                let Some(active) = self.recording.order_code() else {
                    tracing::debug!(camera_id = %self.camera_id, "Duplicate order-stopped");
                    return Step::default();
                };
                if let Some(code) = order_code {
                    if code != active {
                        tracing::debug!(
                            camera_id = %self.camera_id,
                            stopped = %code,
                            active = %active,
                            "Ignoring order-stopped for another order"
                        );
                        return Step::default();
                    }
                }
                tracing::info!(camera_id = %self.camera_id, order_code = %active, "Order stopped by server");
                let mut step = Step::default();
                self.enter_idle(&mut step.effects);
                step
            }
            StreamEvent::CodeScanned { code } => {
                self.last_scanned_code = Some(code.clone());
                self.touch(now)
            }
            StreamEvent::HumanDetected => self.touch(now),
        }
    }

    /// Kind must match; an order code on the ack must name the pending order
    fn ack_matches(&self, pending: &PendingCommand, ack: &StreamAck) -> bool {
        if pending.kind() != ack.command {
            return false;
        }
        match (ack.command, ack.order_code.as_deref()) {
            (_, None) => true,
            (CommandKind::Stop, Some(code)) => pending.order_code.as_deref().map_or(true, |p| p == code),
            (CommandKind::Start, Some(code)) => self.last_closed_order.as_deref() != Some(code),
            _ => true,
        }
    }

    fn on_stream_ack(&mut self, ack: &StreamAck, now: Instant) -> Step {
        let Some(pending) = self.pending.as_ref().filter(|p| self.ack_matches(p, ack)) else {
            tracing::debug!(
                camera_id = %self.camera_id,
                command = %ack.command,
                order_code = ?ack.order_code,
                "Unmatched stream ack"
            );
            return Step::default();
        };
        let id = pending.id;

        let outcome = if ack.ok {
            Ok(CommandAck::from(ack))
        } else {
            Err(Error::CommandFailed {
                camera_id: self.camera_id,
                command: ack.command.to_string(),
                message: ack
                    .message
                    .clone()
                    .unwrap_or_else(|| "rejected by server".to_string()),
            })
        };
        self.settle(id, outcome, now)
    }

    fn enter_auto(&mut self, order_code: String, now: Instant) -> Step {
        self.recording = Recording::Auto {
            order_code,
            last_presence_at: now,
        };
        self.last_probe_at = None;
        Step::effect(Effect::WatchPresence(now))
    }

    fn enter_idle(&mut self, effects: &mut Vec<Effect>) {
        if self.recording.is_auto() {
            effects.push(Effect::ReleasePresence);
        }
        if let Some(code) = self.recording.order_code() {
            self.last_closed_order = Some(code.to_string());
        }
        self.recording = Recording::Idle;
        self.last_probe_at = None;
    }

    /// Presence signal; only meaningful in Auto
    fn touch(&mut self, now: Instant) -> Step {
        match &mut self.recording {
            Recording::Auto {
                last_presence_at, ..
            } => {
                *last_presence_at = now;
                self.last_probe_at = None;
                Step::effect(Effect::TouchPresence(now))
            }
            _ => Step::default(),
        }
    }

    // ========================================
    // Watchdog / reconciliation
    // ========================================

    /// Countdown has sat at zero; ask the backend whether the order closed
    pub fn on_presence_expired(&mut self, ticks: u32, now: Instant) -> Step {
        if !self.recording.is_auto() || ticks < 2 {
            return Step::default();
        }
        if let Some(last) = self.last_probe_at {
            if now.saturating_duration_since(last) < self.closure_reprobe {
                return Step::default();
            }
        }

        self.last_probe_at = Some(now);
        tracing::info!(
            camera_id = %self.camera_id,
            order_code = ?self.recording.order_code(),
            "Presence timed out, probing backend for closure"
        );
        Step::effect(self.request_snapshot())
    }

    /// Messages were dropped upstream; state is unknown until a fresh snapshot
    pub fn stream_gap(&mut self, skipped: u64) -> Step {
        tracing::warn!(
            camera_id = %self.camera_id,
            skipped = skipped,
            "Stream gap, resyncing from snapshot"
        );
        self.synced = false;
        Step::effect(self.request_snapshot())
    }

    fn request_snapshot(&mut self) -> Effect {
        self.awaiting_snapshot = true;
        Effect::RequestSnapshot
    }

    /// Server snapshot; held back while a command is pending
    pub fn apply_snapshot(&mut self, snapshot: SessionSnapshot, now: Instant) -> Step {
        if self.pending.is_some() {
            tracing::debug!(camera_id = %self.camera_id, "Command pending, buffering snapshot");
            self.buffered_snapshot = Some(snapshot);
            return Step::default();
        }

        let mut step = Step::default();
        self.merge_snapshot(snapshot, now, &mut step.effects);
        self.replay_held(now, &mut step);
        step
    }

    /// Apply messages that arrived while the snapshot was outstanding
    fn replay_held(&mut self, now: Instant, step: &mut Step) {
        self.awaiting_snapshot = false;
        if self.held.is_empty() {
            return;
        }
        tracing::debug!(camera_id = %self.camera_id, held = self.held.len(), "Replaying held messages");

        while let Some(message) = self.held.pop_front() {
            let replayed = self.dispatch(&message, now);
            step.effects.extend(replayed.effects);
            if step.settled.is_none() {
                step.settled = replayed.settled;
            }
        }
    }

    fn merge_snapshot(&mut self, snapshot: SessionSnapshot, now: Instant, effects: &mut Vec<Effect>) {
        self.connection = snapshot.connection;
        self.synced = true;

        let order_code = snapshot
            .active_order_code
            .unwrap_or_else(|| UNTRACKED_ORDER_CODE.to_string());

        let next = match snapshot.recording {
            RecordingState::Idle => {
                if self.recording != Recording::Idle {
                    tracing::info!(camera_id = %self.camera_id, "Snapshot reports recording closed");
                }
                self.enter_idle(effects);
                return;
            }
            RecordingState::Manual => Recording::Manual { order_code },
            RecordingState::Auto => match &self.recording {
                Recording::Auto {
                    order_code: active, ..
                } if *active == order_code => return,
                _ => {
                    effects.push(Effect::WatchPresence(now));
                    self.last_probe_at = None;
                    Recording::Auto {
                        order_code,
                        last_presence_at: now,
                    }
                }
            },
        };

        if self.recording.is_auto() && !next.is_auto() {
            effects.push(Effect::ReleasePresence);
        }
        if next != self.recording {
            tracing::info!(
                camera_id = %self.camera_id,
                recording = %next.state(),
                order_code = ?next.order_code(),
                "Recording state restored from snapshot"
            );
        }
        self.recording = next;
    }

    /// No snapshot is coming; apply what was held and stay unsynced
    pub fn snapshot_failed(&mut self, message: String, now: Instant) -> Step {
        tracing::warn!(camera_id = %self.camera_id, error = %message, "Snapshot fetch failed");
        self.last_error = Some(message);

        let mut step = Step::default();
        self.replay_held(now, &mut step);
        step
    }

    /// Stream connection dropped; state is unknown until the next snapshot
    pub fn transport_lost(&mut self) {
        self.connection = ConnectionState::Connecting;
        self.synced = false;
        self.awaiting_snapshot = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream_message::InboundMessage;

    const CAM: CameraId = CameraId(7);

    fn unsynced() -> SessionMachine {
        SessionMachine::new(CAM, Duration::from_secs(10))
    }

    fn machine() -> SessionMachine {
        let mut m = unsynced();
        m.apply_snapshot(SessionSnapshot::idle(ConnectionState::Connecting), Instant::now());
        m
    }

    fn stream_ack(command: CommandKind, order_code: Option<&str>) -> InboundMessage {
        InboundMessage {
            camera_id: Some(CAM),
            payload: MessagePayload::Ack(StreamAck {
                command,
                ok: true,
                order_code: order_code.map(str::to_string),
                message: None,
            }),
        }
    }

    fn event(machine: &mut SessionMachine, event: StreamEvent) -> Step {
        machine.on_message(&InboundMessage::event(CAM, event), Instant::now())
    }

    fn created(code: &str) -> StreamEvent {
        StreamEvent::OrderCreated {
            order_code: code.to_string(),
        }
    }

    fn stopped() -> StreamEvent {
        StreamEvent::OrderStopped { order_code: None }
    }

    #[test]
    fn test_order_created_is_idempotent() {
        let mut m = machine();
        let first = event(&mut m, created("ORD-1"));
        assert!(matches!(first.effects.as_slice(), [Effect::WatchPresence(_)]));
        let presence = m.recording().last_presence_at();

        let second = event(&mut m, created("ORD-1"));
        assert!(second.effects.is_empty());
        assert_eq!(m.view().active_order_code.as_deref(), Some("ORD-1"));
        assert_eq!(m.recording().last_presence_at(), presence);
    }

    #[test]
    fn test_manual_has_priority_over_detector() {
        let mut m = machine();
        let (pending, _) = m.begin(Command::StartRecording, Instant::now()).unwrap();
        m.settle(pending.id, Ok(CommandAck::new(CommandKind::Start).with_order_code("M-1")), Instant::now());
        assert_eq!(m.view().recording, RecordingState::Manual);

        let step = event(&mut m, created("ORD-9"));
        assert!(step.effects.is_empty());
        assert_eq!(m.view().recording, RecordingState::Manual);
        assert_eq!(m.view().active_order_code.as_deref(), Some("M-1"));
    }

    #[test]
    fn test_order_created_ignored_while_start_pending() {
        let mut m = machine();
        let (pending, _) = m.begin(Command::StartRecording, Instant::now()).unwrap();

        event(&mut m, created("ORD-1"));
        assert_eq!(m.view().recording, RecordingState::Idle);

        let step = m.settle(pending.id, Ok(CommandAck::new(CommandKind::Start)), Instant::now());
        assert!(step.settled.unwrap().outcome.is_ok());
        let view = m.view();
        assert_eq!(view.recording, RecordingState::Manual);
        assert!(view.active_order_code.unwrap().starts_with("DH-"));
        assert!(view.pending_command.is_none());
    }

    #[test]
    fn test_manual_stop_by_event_then_ack() {
        let mut m = machine();
        let (start, _) = m.begin(Command::StartRecording, Instant::now()).unwrap();
        m.settle(start.id, Ok(CommandAck::new(CommandKind::Start).with_order_code("M-1")), Instant::now());

        let (stop, _) = m.begin(Command::StopRecording { note: None }, Instant::now()).unwrap();
        assert_eq!(stop.order_code.as_deref(), Some("M-1"));

        event(&mut m, stopped());
        assert_eq!(m.view().recording, RecordingState::Idle);

        let step = m.settle(stop.id, Ok(CommandAck::new(CommandKind::Stop)), Instant::now());
        assert!(step.settled.is_some());
        assert_eq!(m.view().recording, RecordingState::Idle);

        assert!(event(&mut m, stopped()).effects.is_empty());
    }

    #[test]
    fn test_pending_stop_survives_unrelated_order() {
        let mut m = machine();
        event(&mut m, created("A-1"));
        let (stop, _) = m.begin(Command::StopRecording { note: None }, Instant::now()).unwrap();

        event(&mut m, created("B-2"));
        assert_eq!(m.view().active_order_code.as_deref(), Some("B-2"));
        assert_eq!(m.view().pending_command.as_ref().map(|p| p.id), Some(stop.id));

        let step = m.settle(stop.id, Ok(CommandAck::new(CommandKind::Stop)), Instant::now());
        assert!(step.settled.unwrap().outcome.is_ok());
        assert_eq!(m.view().recording, RecordingState::Auto);
        assert_eq!(m.view().active_order_code.as_deref(), Some("B-2"));
    }

    #[test]
    fn test_second_command_rejected_but_stop_cancels_start() {
        let mut m = machine();
        let (start, _) = m.begin(Command::StartRecording, Instant::now()).unwrap();

        let err = m.begin(Command::Connect, Instant::now()).unwrap_err();
        assert!(matches!(err, Error::CommandRejected { .. }));

        let (stop, superseded) = m.begin(Command::StopRecording { note: None }, Instant::now()).unwrap();
        assert_eq!(superseded.map(|p| p.id), Some(start.id));
        assert_eq!(stop.supersedes, Some(start.id));

        let late = m.settle(start.id, Ok(CommandAck::new(CommandKind::Start)), Instant::now());
        assert!(late.settled.is_none());
        assert_eq!(m.view().recording, RecordingState::Idle);

        let failed = m.settle(
            stop.id,
            Err(Error::CommandTimeout {
                camera_id: CAM,
                command: "stop".to_string(),
            }),
            Instant::now(),
        );
        assert_eq!(failed.effects, vec![Effect::RequestSnapshot]);
    }

    #[test]
    fn test_failure_leaves_state_unchanged() {
        let mut m = machine();
        event(&mut m, created("ORD-1"));
        let (stop, _) = m.begin(Command::StopRecording { note: None }, Instant::now()).unwrap();

        let step = m.settle(
            stop.id,
            Err(Error::CommandTimeout {
                camera_id: CAM,
                command: "stop".to_string(),
            }),
            Instant::now(),
        );
        assert!(step.settled.unwrap().outcome.is_err());
        let view = m.view();
        assert_eq!(view.recording, RecordingState::Auto);
        assert!(view.pending_command.is_none());
        assert_eq!(view.last_error.as_deref(), Some("No response from server"));
    }

    #[test]
    fn test_start_rejected_when_recording() {
        let mut m = machine();
        event(&mut m, created("ORD-1"));
        assert!(m.begin(Command::StartRecording, Instant::now()).is_err());

        let idle = &mut machine();
        assert!(idle.begin(Command::StopRecording { note: None }, Instant::now()).is_err());
    }

    #[test]
    fn test_stream_ack_settles_pending() {
        let mut m = machine();
        let (pending, _) = m.begin(Command::StartRecording, Instant::now()).unwrap();
        let ack = InboundMessage {
            camera_id: Some(CAM),
            payload: MessagePayload::Ack(StreamAck {
                command: CommandKind::Start,
                ok: true,
                order_code: Some("ORD-5".to_string()),
                message: None,
            }),
        };

        let step = m.on_message(&ack, Instant::now());
        assert_eq!(step.settled.unwrap().command.id, pending.id);
        assert_eq!(m.view().active_order_code.as_deref(), Some("ORD-5"));

        // REST ack arriving later is stale
        assert!(m
            .settle(pending.id, Ok(CommandAck::new(CommandKind::Start)), Instant::now())
            .settled
            .is_none());
    }

    #[test]
    fn test_snapshot_buffered_while_pending() {
        let mut m = unsynced();
        let (pending, _) = m.begin(Command::Connect, Instant::now()).unwrap();

        let step = m.apply_snapshot(
            SessionSnapshot::recording(ConnectionState::Live, RecordingState::Auto, "ORD-3"),
            Instant::now(),
        );
        assert!(step.effects.is_empty());
        assert_eq!(m.view().recording, RecordingState::Idle);
        assert!(!m.view().synced);

        let step = m.settle(pending.id, Ok(CommandAck::new(CommandKind::Connect)), Instant::now());
        assert!(matches!(step.effects.as_slice(), [Effect::WatchPresence(_)]));
        let view = m.view();
        assert!(view.synced);
        assert_eq!(view.recording, RecordingState::Auto);
        assert_eq!(view.connection, ConnectionState::Live);
    }

    #[test]
    fn test_events_held_until_initial_snapshot() {
        let mut m = unsynced();
        assert!(event(&mut m, created("ORD-1")).effects.is_empty());
        assert_eq!(m.view().recording, RecordingState::Idle);
        assert_eq!(m.held(), 1);

        // Frames carry no recording state and pass straight through
        let frame = InboundMessage {
            camera_id: Some(CAM),
            payload: MessagePayload::Frame {
                image: None,
                boxes: Vec::new(),
            },
        };
        m.on_message(&frame, Instant::now());
        assert_eq!(m.view().frames_received, 1);

        // Snapshot taken before the order opened
        let step = m.apply_snapshot(SessionSnapshot::idle(ConnectionState::Live), Instant::now());
        assert!(matches!(step.effects.as_slice(), [Effect::WatchPresence(_)]));
        let view = m.view();
        assert!(view.synced);
        assert_eq!(view.recording, RecordingState::Auto);
        assert_eq!(view.active_order_code.as_deref(), Some("ORD-1"));
        assert_eq!(m.held(), 0);
    }

    #[test]
    fn test_reconnect_snapshot_cannot_undo_later_stop() {
        let mut m = machine();
        event(&mut m, created("ORD-1"));
        m.transport_lost();
        assert!(!m.view().synced);

        assert!(event(&mut m, stopped()).effects.is_empty());
        assert_eq!(m.view().recording, RecordingState::Auto);

        let step = m.apply_snapshot(
            SessionSnapshot::recording(ConnectionState::Live, RecordingState::Auto, "ORD-1"),
            Instant::now(),
        );
        assert_eq!(step.effects, vec![Effect::ReleasePresence]);
        let view = m.view();
        assert!(view.synced);
        assert_eq!(view.recording, RecordingState::Idle);
    }

    #[test]
    fn test_stream_gap_requests_resync() {
        let mut m = machine();
        event(&mut m, created("ORD-1"));

        let step = m.stream_gap(12);
        assert_eq!(step.effects, vec![Effect::RequestSnapshot]);
        assert!(!m.view().synced);

        event(&mut m, created("ORD-2"));
        assert_eq!(m.view().active_order_code.as_deref(), Some("ORD-1"));

        // Without a snapshot the held events still apply
        let step = m.snapshot_failed("Connection error".to_string(), Instant::now());
        assert!(matches!(step.effects.as_slice(), [Effect::WatchPresence(_)]));
        let view = m.view();
        assert_eq!(view.active_order_code.as_deref(), Some("ORD-2"));
        assert!(!view.synced);
        assert_eq!(m.held(), 0);
    }

    #[test]
    fn test_replayed_stream_acks_do_not_settle_newer_commands() {
        let mut m = machine();
        let (start, _) = m.begin(Command::StartRecording, Instant::now()).unwrap();
        m.settle(start.id, Ok(CommandAck::new(CommandKind::Start).with_order_code("M-1")), Instant::now());
        let (stop, _) = m.begin(Command::StopRecording { note: None }, Instant::now()).unwrap();
        m.settle(stop.id, Ok(CommandAck::new(CommandKind::Stop)), Instant::now());
        assert_eq!(m.view().recording, RecordingState::Idle);

        let (restart, _) = m.begin(Command::StartRecording, Instant::now()).unwrap();
        let stale = m.on_message(&stream_ack(CommandKind::Start, Some("M-1")), Instant::now());
        assert!(stale.settled.is_none());
        assert_eq!(m.pending().map(|p| p.id), Some(restart.id));

        let fresh = m.on_message(&stream_ack(CommandKind::Start, Some("M-2")), Instant::now());
        assert_eq!(fresh.settled.unwrap().command.id, restart.id);
        assert_eq!(m.view().active_order_code.as_deref(), Some("M-2"));

        let (stop, _) = m.begin(Command::StopRecording { note: None }, Instant::now()).unwrap();
        let other = m.on_message(&stream_ack(CommandKind::Stop, Some("M-1")), Instant::now());
        assert!(other.settled.is_none());
        assert_eq!(m.view().recording, RecordingState::Manual);

        let own = m.on_message(&stream_ack(CommandKind::Stop, Some("M-2")), Instant::now());
        assert_eq!(own.settled.unwrap().command.id, stop.id);
        assert_eq!(m.view().recording, RecordingState::Idle);
    }

    #[test]
    fn test_snapshot_merge_rules() {
        let mut m = machine();
        event(&mut m, created("ORD-1"));
        let presence = m.recording().last_presence_at();

        let same = m.apply_snapshot(
            SessionSnapshot::recording(ConnectionState::Live, RecordingState::Auto, "ORD-1"),
            Instant::now(),
        );
        assert!(same.effects.is_empty());
        assert_eq!(m.recording().last_presence_at(), presence);

        let manual = m.apply_snapshot(
            SessionSnapshot {
                connection: ConnectionState::Live,
                recording: RecordingState::Manual,
                active_order_code: None,
            },
            Instant::now(),
        );
        assert_eq!(manual.effects, vec![Effect::ReleasePresence]);
        assert_eq!(m.view().active_order_code.as_deref(), Some(UNTRACKED_ORDER_CODE));

        m.apply_snapshot(SessionSnapshot::idle(ConnectionState::Off), Instant::now());
        let view = m.view();
        assert_eq!(view.recording, RecordingState::Idle);
        assert_eq!(view.active_order_code, None);
        assert_eq!(view.connection, ConnectionState::Off);
    }

    #[test]
    fn test_timeout_alone_never_goes_idle() {
        let mut m = machine();
        event(&mut m, created("ORD-1"));
        let now = Instant::now();

        assert!(m.on_presence_expired(1, now).effects.is_empty());
        assert_eq!(m.on_presence_expired(2, now).effects, vec![Effect::RequestSnapshot]);
        assert!(m.on_presence_expired(3, now + Duration::from_secs(1)).effects.is_empty());
        assert_eq!(
            m.on_presence_expired(60, now + Duration::from_secs(11)).effects,
            vec![Effect::RequestSnapshot]
        );
        assert_eq!(m.view().recording, RecordingState::Auto);
    }

    #[test]
    fn test_presence_only_touches_auto() {
        let mut m = machine();
        assert!(event(&mut m, StreamEvent::HumanDetected).effects.is_empty());

        event(&mut m, created("ORD-1"));
        let step = event(
            &mut m,
            StreamEvent::CodeScanned {
                code: "ITEM-4".to_string(),
            },
        );
        assert!(matches!(step.effects.as_slice(), [Effect::TouchPresence(_)]));
        assert_eq!(m.view().last_scanned_code.as_deref(), Some("ITEM-4"));
    }

    #[test]
    fn test_order_stopped_for_other_order_ignored() {
        let mut m = machine();
        event(&mut m, created("ORD-1"));
        event(
            &mut m,
            StreamEvent::OrderStopped {
                order_code: Some("ORD-0".to_string()),
            },
        );
        assert_eq!(m.view().recording, RecordingState::Auto);

        let step = event(&mut m, stopped());
        assert_eq!(step.effects, vec![Effect::ReleasePresence]);
        assert_eq!(m.view().recording, RecordingState::Idle);
    }

    #[test]
    fn test_frames_and_disconnect() {
        let mut m = machine();
        let frame = InboundMessage {
            camera_id: Some(CAM),
            payload: MessagePayload::Frame {
                image: None,
                boxes: Vec::new(),
            },
        };
        m.on_message(&frame, Instant::now());
        assert_eq!(m.view().connection, ConnectionState::Live);
        assert_eq!(m.view().frames_received, 1);

        let (pending, _) = m.begin(Command::Disconnect, Instant::now()).unwrap();
        m.settle(pending.id, Ok(CommandAck::new(CommandKind::Disconnect)), Instant::now());
        assert_eq!(m.view().connection, ConnectionState::Off);
    }

    #[test]
    fn test_toggle() {
        assert_eq!(
            toggle_command(CAM, RecordingState::Idle).unwrap(),
            Command::StartRecording
        );
        assert_eq!(
            toggle_command(CAM, RecordingState::Manual).unwrap(),
            Command::StopRecording { note: None }
        );
        assert!(toggle_command(CAM, RecordingState::Auto).is_err());
    }
}
