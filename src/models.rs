//! Shared models and types
//!
//! This module contains types shared across multiple modules
//! to avoid circular dependencies.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Camera identifier (immutable session key)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CameraId(pub u32);

impl fmt::Display for CameraId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CameraId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<u32>().map(CameraId)
    }
}

impl From<u32> for CameraId {
    fn from(id: u32) -> Self {
        CameraId(id)
    }
}

impl CameraId {
    /// Normalize a JSON camera id (number or numeric string)
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Number(n) => n
                .as_u64()
                .and_then(|v| u32::try_from(v).ok())
                .map(CameraId),
            serde_json::Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }
}

/// Camera connection state as seen by a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Off,
    Connecting,
    Live,
}

/// Recording state of a camera
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RecordingState {
    /// No recording
    Idle,
    /// Operator-initiated recording
    Manual,
    /// Detector-initiated recording
    Auto,
}

impl fmt::Display for RecordingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "IDLE"),
            Self::Manual => write!(f, "MANUAL"),
            Self::Auto => write!(f, "AUTO"),
        }
    }
}

/// Detector mode of a camera
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraMode {
    Security,
    Scan,
    Both,
    Normal,
}

/// Detection box attached to a frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionBox {
    /// [x, y, w, h]
    #[serde(rename = "box")]
    pub rect: [f64; 4],
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

/// Point-in-time server view of a camera
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub connection: ConnectionState,
    pub recording: RecordingState,
    pub active_order_code: Option<String>,
}

impl SessionSnapshot {
    pub fn idle(connection: ConnectionState) -> Self {
        Self {
            connection,
            recording: RecordingState::Idle,
            active_order_code: None,
        }
    }

    pub fn recording(
        connection: ConnectionState,
        recording: RecordingState,
        order_code: impl Into<String>,
    ) -> Self {
        Self {
            connection,
            recording,
            active_order_code: Some(order_code.into()),
        }
    }
}

/// Standard backend response envelope `{code, mes, data}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiEnvelope<T> {
    pub code: Option<i64>,
    pub mes: Option<String>,
    pub data: Option<T>,
}

impl<T> ApiEnvelope<T> {
    /// `code` is either absent or in the 2xx range
    pub fn is_success(&self) -> bool {
        self.code.map_or(true, |c| (200..300).contains(&c))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_camera_id_normalization() {
        assert_eq!(CameraId::from_json(&json!(7)), Some(CameraId(7)));
        assert_eq!(CameraId::from_json(&json!("7")), Some(CameraId(7)));
        assert_eq!(CameraId::from_json(&json!(" 12 ")), Some(CameraId(12)));
        assert_eq!(CameraId::from_json(&json!("cam-7")), None);
        assert_eq!(CameraId::from_json(&json!(-1)), None);
        assert_eq!(CameraId::from_json(&json!(null)), None);
    }

    #[test]
    fn test_recording_state_wire_format() {
        let state: RecordingState = serde_json::from_value(json!("AUTO")).unwrap();
        assert_eq!(state, RecordingState::Auto);
        assert_eq!(RecordingState::Manual.to_string(), "MANUAL");
    }

    #[test]
    fn test_envelope_success() {
        let ok: ApiEnvelope<serde_json::Value> =
            serde_json::from_value(json!({"code": 200, "mes": "ok", "data": {}})).unwrap();
        assert!(ok.is_success());

        let bare: ApiEnvelope<serde_json::Value> = serde_json::from_value(json!({})).unwrap();
        assert!(bare.is_success());

        let failed: ApiEnvelope<serde_json::Value> =
            serde_json::from_value(json!({"code": 409, "mes": "busy"})).unwrap();
        assert!(!failed.is_success());
    }
}
