//! CameraSession types

use crate::error::Error;
use crate::models::{CameraId, ConnectionState, RecordingState};
use crate::stream_message::CommandKind;
use std::fmt;
use tokio::time::Instant;

/// Order code used when the backend reports a recording without one
pub const UNTRACKED_ORDER_CODE: &str = "untracked";

/// Recording state with its order code; Idle never carries a code
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recording {
    Idle,
    Manual {
        order_code: String,
    },
    Auto {
        order_code: String,
        last_presence_at: Instant,
    },
}

impl Recording {
    pub fn state(&self) -> RecordingState {
        match self {
            Self::Idle => RecordingState::Idle,
            Self::Manual { .. } => RecordingState::Manual,
            Self::Auto { .. } => RecordingState::Auto,
        }
    }

    pub fn order_code(&self) -> Option<&str> {
        match self {
            Self::Idle => None,
            Self::Manual { order_code } | Self::Auto { order_code, .. } => Some(order_code),
        }
    }

    pub fn last_presence_at(&self) -> Option<Instant> {
        match self {
            Self::Auto {
                last_presence_at, ..
            } => Some(*last_presence_at),
            _ => None,
        }
    }

    pub fn is_auto(&self) -> bool {
        matches!(self, Self::Auto { .. })
    }
}

/// Operator command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Connect,
    Disconnect,
    StartRecording,
    StopRecording { note: Option<String> },
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Self::Connect => CommandKind::Connect,
            Self::Disconnect => CommandKind::Disconnect,
            Self::StartRecording => CommandKind::Start,
            Self::StopRecording { .. } => CommandKind::Stop,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.kind().fmt(f)
    }
}

/// A command sent but not yet settled
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCommand {
    pub id: u64,
    pub command: Command,
    /// Order the command refers to (stop only)
    pub order_code: Option<String>,
    pub issued_at: Instant,
    /// Start command this stop cancelled
    pub supersedes: Option<u64>,
}

impl PendingCommand {
    pub fn kind(&self) -> CommandKind {
        self.command.kind()
    }
}

/// Side effects the session task performs after a transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Register with the watchdog (entering Auto or a new Auto order)
    WatchPresence(Instant),
    TouchPresence(Instant),
    ReleasePresence,
    RequestSnapshot,
}

/// A pending command resolved by an ack, failure or timeout
#[derive(Debug)]
pub struct Settled {
    pub command: PendingCommand,
    pub outcome: crate::error::Result<crate::camera_api::CommandAck>,
}

/// Result of feeding one input into the machine
#[derive(Debug, Default)]
pub struct Step {
    pub effects: Vec<Effect>,
    pub settled: Option<Settled>,
}

impl Step {
    pub(crate) fn effect(effect: Effect) -> Self {
        Self {
            effects: vec![effect],
            settled: None,
        }
    }
}

/// Read-only view published to consumers
#[derive(Debug, Clone, PartialEq)]
pub struct SessionView {
    pub camera_id: CameraId,
    pub connection: ConnectionState,
    pub recording: RecordingState,
    pub active_order_code: Option<String>,
    pub last_presence_at: Option<Instant>,
    pub pending_command: Option<PendingCommand>,
    /// A snapshot has been merged since the last gap
    pub synced: bool,
    pub last_scanned_code: Option<String>,
    /// Last command failure or backend error, for a toast
    pub last_error: Option<String>,
    pub frames_received: u64,
}

pub(crate) fn rejected(camera_id: CameraId, command: &Command, reason: impl Into<String>) -> Error {
    Error::CommandRejected {
        camera_id,
        command: command.to_string(),
        reason: reason.into(),
    }
}
