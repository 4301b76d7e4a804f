//! CommandGateway - Operator Command Dispatch
//!
//! ## Responsibilities
//!
//! - Serialize commands per camera through the session's pending slot
//! - Send the command over REST with a bounded wait for the acknowledgement
//! - Hand the outcome to the session and report it to the caller
//!
//! The gateway never mutates a session. Failed or timed-out commands are
//! reported once and never retried.

use crate::camera_api::{CameraApi, CommandAck};
use crate::camera_session::{Command, PendingCommand, SessionHandle};
use crate::error::{Error, Result};
use crate::models::CameraId;
use std::sync::Arc;
use std::time::Duration;

/// CommandGateway instance
pub struct CommandGateway {
    api: Arc<dyn CameraApi>,
    ack_timeout: Duration,
}

impl CommandGateway {
    pub fn new(api: Arc<dyn CameraApi>, ack_timeout: Duration) -> Self {
        Self { api, ack_timeout }
    }

    /// Issue a command and wait until the session settles it
    /// (REST ack, stream ack, failure or timeout, whichever comes first).
    pub async fn issue(&self, session: &SessionHandle, command: Command) -> Result<CommandAck> {
        let camera_id = session.camera_id();
        let (pending, settled) = session.begin(command).await?;

        tracing::info!(
            camera_id = %camera_id,
            command = %pending.command,
            command_id = pending.id,
            "Issuing command"
        );

        // Detached so a dropped caller cannot leave the command pending forever
        let api = self.api.clone();
        let ack_timeout = self.ack_timeout;
        let session = session.clone();
        tokio::spawn(async move {
            let outcome = match tokio::time::timeout(ack_timeout, send(api.as_ref(), camera_id, &pending)).await {
                Ok(Ok(ack)) => Ok(ack),
                Ok(Err(e)) => Err(Error::CommandFailed {
                    camera_id,
                    command: pending.command.to_string(),
                    message: match e {
                        Error::Api { message, .. } => message,
                        other => other.user_message(),
                    },
                }),
                Err(_) => Err(Error::CommandTimeout {
                    camera_id,
                    command: pending.command.to_string(),
                }),
            };

            if let Err(e) = &outcome {
                tracing::warn!(camera_id = %camera_id, error = %e, "Command not acknowledged");
            }
            session.settle(pending.id, outcome);
        });

        settled
            .await
            .map_err(|_| Error::SessionClosed(camera_id))?
    }
}

async fn send(api: &dyn CameraApi, camera_id: CameraId, pending: &PendingCommand) -> Result<CommandAck> {
    match &pending.command {
        Command::Connect => api.connect(camera_id).await,
        Command::Disconnect => api.disconnect(camera_id).await,
        Command::StartRecording => api.start_recording(camera_id).await,
        Command::StopRecording { note } => {
            api.stop_recording(camera_id, pending.order_code.as_deref(), note.as_deref())
                .await
        }
    }
}
