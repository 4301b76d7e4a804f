//! CameraApi - Out-of-Band Request Channel
//!
//! ## Responsibilities
//!
//! - Camera connect/disconnect and recording start/stop requests
//! - One-shot session snapshot query
//!
//! Acknowledgements returned here are not state changes; sessions apply
//! them through their own transition rules.

mod http;

pub use http::HttpCameraApi;

use crate::error::Result;
use crate::models::{CameraId, SessionSnapshot};
use crate::stream_message::{CommandKind, StreamAck};
use async_trait::async_trait;

/// Successful acknowledgement of a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandAck {
    pub command: CommandKind,
    /// Order code assigned by the backend (start only)
    pub order_code: Option<String>,
    pub message: Option<String>,
}

impl CommandAck {
    pub fn new(command: CommandKind) -> Self {
        Self {
            command,
            order_code: None,
            message: None,
        }
    }

    pub fn with_order_code(mut self, order_code: impl Into<String>) -> Self {
        self.order_code = Some(order_code.into());
        self
    }
}

impl From<&StreamAck> for CommandAck {
    fn from(ack: &StreamAck) -> Self {
        Self {
            command: ack.command,
            order_code: ack.order_code.clone(),
            message: ack.message.clone(),
        }
    }
}

/// Backend command and snapshot endpoints
#[async_trait]
pub trait CameraApi: Send + Sync {
    async fn connect(&self, camera_id: CameraId) -> Result<CommandAck>;

    async fn disconnect(&self, camera_id: CameraId) -> Result<CommandAck>;

    async fn start_recording(&self, camera_id: CameraId) -> Result<CommandAck>;

    async fn stop_recording(
        &self,
        camera_id: CameraId,
        order_code: Option<&str>,
        note: Option<&str>,
    ) -> Result<CommandAck>;

    /// Point-in-time server view of the camera
    async fn snapshot(&self, camera_id: CameraId) -> Result<SessionSnapshot>;
}
