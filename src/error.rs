//! Error handling for the packing-floor session controller

use crate::models::CameraId;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Multiplexed connection dropped or could not be established
    #[error("Transport error: {0}")]
    Transport(String),

    /// Reconnect budget exhausted
    #[error("Connection degraded after {attempts} reconnect attempts")]
    ConnectionDegraded { attempts: u32 },

    /// Command refused locally (another command pending, wrong state)
    #[error("Command {command} rejected for camera {camera_id}: {reason}")]
    CommandRejected {
        camera_id: CameraId,
        command: String,
        reason: String,
    },

    /// Backend answered the command with a failure
    #[error("Command {command} failed for camera {camera_id}: {message}")]
    CommandFailed {
        camera_id: CameraId,
        command: String,
        message: String,
    },

    /// Acknowledgement never arrived
    #[error("Command {command} timed out for camera {camera_id}")]
    CommandTimeout { camera_id: CameraId, command: String },

    /// Undecodable inbound frame or missing required fields
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// Non-success response envelope
    #[error("API error (HTTP {status}): {message}")]
    Api { status: u16, message: String },

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// WebSocket protocol error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Config error
    #[error("Config error: {0}")]
    Config(String),

    /// Session task is gone
    #[error("Session for camera {0} is closed")]
    SessionClosed(CameraId),
}

impl Error {
    /// Message suitable for a point-in-time error toast
    pub fn user_message(&self) -> String {
        match self {
            Error::CommandRejected { reason, .. } => reason.clone(),
            Error::CommandFailed { message, .. } => message.clone(),
            Error::CommandTimeout { .. } => "No response from server".to_string(),
            Error::ConnectionDegraded { .. } => "Connection lost, retrying stopped".to_string(),
            Error::Http(_) | Error::Transport(_) | Error::WebSocket(_) => {
                "Connection error".to_string()
            }
            other => other.to_string(),
        }
    }

    /// Whether the error came from the command path
    pub fn is_command_error(&self) -> bool {
        matches!(
            self,
            Error::CommandRejected { .. } | Error::CommandFailed { .. } | Error::CommandTimeout { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_errors_classified() {
        let err = Error::CommandTimeout {
            camera_id: CameraId(7),
            command: "start".to_string(),
        };
        assert!(err.is_command_error());
        assert_eq!(err.user_message(), "No response from server");
        assert!(!Error::MalformedMessage("x".into()).is_command_error());
    }

    #[test]
    fn test_display_includes_camera() {
        let err = Error::CommandRejected {
            camera_id: CameraId(3),
            command: "stop".to_string(),
            reason: "not recording".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Command stop rejected for camera 3: not recording"
        );
    }
}
