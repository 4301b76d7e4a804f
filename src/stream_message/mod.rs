//! StreamMessage - Multiplexed Connection Wire Format
//!
//! ## Responsibilities
//!
//! - Decode inbound frames into a tagged `InboundMessage`
//! - Normalize camera ids (number, numeric string, `cam_id` alias)
//! - Normalize event names (`ORDER_CREATED` == `order-created`)
//! - Encode outbound commands
//!
//! Undecodable frames surface as `Error::MalformedMessage`; callers log and drop them.

use crate::error::{Error, Result};
use crate::models::{CameraId, CameraMode, DetectionBox};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Message kind on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Frame,
    Event,
    Ack,
    Error,
}

/// Command named in an acknowledgement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    Connect,
    Disconnect,
    Start,
    Stop,
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect => write!(f, "connect"),
            Self::Disconnect => write!(f, "disconnect"),
            Self::Start => write!(f, "start"),
            Self::Stop => write!(f, "stop"),
        }
    }
}

impl CommandKind {
    fn parse(name: &str) -> Option<Self> {
        match normalize_name(name).as_str() {
            "connect" => Some(Self::Connect),
            "disconnect" => Some(Self::Disconnect),
            "start" | "start-recording" => Some(Self::Start),
            "stop" | "stop-recording" => Some(Self::Stop),
            _ => None,
        }
    }
}

/// Detector event carried by an `event` message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Detector opened an order recording
    OrderCreated { order_code: String },
    /// Server closed the current order
    OrderStopped { order_code: Option<String> },
    /// QR / barcode read by the detector (presence signal)
    CodeScanned { code: String },
    /// Person detected in the station (presence signal)
    HumanDetected,
}

/// Command acknowledgement pushed over the stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamAck {
    pub command: CommandKind,
    pub ok: bool,
    pub order_code: Option<String>,
    pub message: Option<String>,
}

/// Kind-specific payload
#[derive(Debug, Clone, PartialEq)]
pub enum MessagePayload {
    Frame {
        /// Opaque image reference (base64 or URL), never decoded here
        image: Option<String>,
        boxes: Vec<DetectionBox>,
    },
    Event(StreamEvent),
    Ack(StreamAck),
    Error { message: String },
}

/// Decoded inbound message
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    /// `None` for broadcast messages
    pub camera_id: Option<CameraId>,
    pub payload: MessagePayload,
}

impl InboundMessage {
    pub fn kind(&self) -> MessageKind {
        match self.payload {
            MessagePayload::Frame { .. } => MessageKind::Frame,
            MessagePayload::Event(_) => MessageKind::Event,
            MessagePayload::Ack(_) => MessageKind::Ack,
            MessagePayload::Error { .. } => MessageKind::Error,
        }
    }

    pub fn event(camera_id: CameraId, event: StreamEvent) -> Self {
        Self {
            camera_id: Some(camera_id),
            payload: MessagePayload::Event(event),
        }
    }

    /// Decode a text frame
    pub fn decode(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| Error::MalformedMessage(format!("invalid JSON: {}", e)))?;
        Self::from_value(&value)
    }

    /// Decode a binary frame carrying UTF-8 JSON
    pub fn decode_bytes(bytes: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| Error::MalformedMessage(format!("invalid JSON: {}", e)))?;
        Self::from_value(&value)
    }

    pub fn from_value(value: &Value) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| Error::MalformedMessage("message is not an object".to_string()))?;

        let camera_id = extract_camera_id(value)?;
        let kind = match obj.get("kind") {
            Some(Value::String(k)) => parse_kind(k)?,
            Some(other) => {
                return Err(Error::MalformedMessage(format!("kind is not a string: {}", other)))
            }
            None => infer_kind(value)?,
        };

        let payload = match kind {
            MessageKind::Frame => decode_frame(value)?,
            MessageKind::Event => MessagePayload::Event(decode_event(value)?),
            MessageKind::Ack => MessagePayload::Ack(decode_ack(value)?),
            MessageKind::Error => MessagePayload::Error {
                message: match value.get("error").or_else(|| value.get("message")) {
                    Some(Value::String(s)) => s.clone(),
                    Some(other) => other.to_string(),
                    None => "unknown error".to_string(),
                },
            },
        };

        Ok(Self { camera_id, payload })
    }
}

/// Lowercase and treat `_` as `-`
fn normalize_name(name: &str) -> String {
    name.trim().to_ascii_lowercase().replace('_', "-")
}

fn parse_kind(kind: &str) -> Result<MessageKind> {
    match normalize_name(kind).as_str() {
        "frame" => Ok(MessageKind::Frame),
        "event" => Ok(MessageKind::Event),
        "ack" => Ok(MessageKind::Ack),
        "error" => Ok(MessageKind::Error),
        other => Err(Error::MalformedMessage(format!("unknown kind: {}", other))),
    }
}

fn infer_kind(value: &Value) -> Result<MessageKind> {
    if value.get("event").is_some() {
        Ok(MessageKind::Event)
    } else if value.get("error").is_some() {
        Ok(MessageKind::Error)
    } else if value.get("image").is_some() || value.get("metadata").is_some() {
        Ok(MessageKind::Frame)
    } else {
        Err(Error::MalformedMessage("cannot infer message kind".to_string()))
    }
}

/// `camera_id`, then `cam_id`, then `data.cam_id`
fn extract_camera_id(value: &Value) -> Result<Option<CameraId>> {
    let raw = value
        .get("camera_id")
        .or_else(|| value.get("cam_id"))
        .or_else(|| value.get("data").and_then(|d| d.get("cam_id")))
        .filter(|v| !v.is_null());

    match raw {
        None => Ok(None),
        Some(v) => CameraId::from_json(v)
            .map(Some)
            .ok_or_else(|| Error::MalformedMessage(format!("invalid camera_id: {}", v))),
    }
}

fn decode_frame(value: &Value) -> Result<MessagePayload> {
    let image = match value.get("image") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => {
            return Err(Error::MalformedMessage(format!("image is not a string: {}", other)))
        }
    };
    let boxes = match value.get("metadata") {
        None | Some(Value::Null) => Vec::new(),
        Some(m) => serde_json::from_value::<Vec<DetectionBox>>(m.clone())
            .map_err(|e| Error::MalformedMessage(format!("invalid metadata: {}", e)))?,
    };
    Ok(MessagePayload::Frame { image, boxes })
}

fn string_field<'a>(data: Option<&'a Value>, key: &str) -> Option<&'a str> {
    data.and_then(|d| d.get(key))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn decode_event(value: &Value) -> Result<StreamEvent> {
    let name = value
        .get("event")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::MalformedMessage("event name missing".to_string()))?;
    let data = value.get("data");

    match normalize_name(name).as_str() {
        "order-created" => {
            let code = string_field(data, "order_code")
                .or_else(|| string_field(data, "code"))
                .ok_or_else(|| {
                    Error::MalformedMessage("order-created without order code".to_string())
                })?;
            Ok(StreamEvent::OrderCreated {
                order_code: code.to_string(),
            })
        }
        "order-stopped" => Ok(StreamEvent::OrderStopped {
            order_code: string_field(data, "order_code")
                .or_else(|| string_field(data, "code"))
                .map(str::to_string),
        }),
        "code-scanned" | "qr-scanned" | "barcode-detected" => {
            let code = match data {
                Some(Value::String(s)) => Some(s.clone()),
                Some(Value::Number(n)) => Some(n.to_string()),
                _ => string_field(data, "code").map(str::to_string),
            };
            code.map(|code| StreamEvent::CodeScanned { code })
                .ok_or_else(|| Error::MalformedMessage("code-scanned without code".to_string()))
        }
        "human-detected" | "presence-detected" => Ok(StreamEvent::HumanDetected),
        other => Err(Error::MalformedMessage(format!("unknown event: {}", other))),
    }
}

fn decode_ack(value: &Value) -> Result<StreamAck> {
    let command = value
        .get("command")
        .and_then(Value::as_str)
        .and_then(CommandKind::parse)
        .ok_or_else(|| Error::MalformedMessage("ack without known command".to_string()))?;
    let ok = value
        .get("ok")
        .and_then(Value::as_bool)
        .ok_or_else(|| Error::MalformedMessage(format!("{} ack without ok flag", command)))?;

    Ok(StreamAck {
        command,
        ok,
        order_code: value
            .get("order_code")
            .and_then(Value::as_str)
            .map(str::to_string),
        message: value
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}

/// Command sent over the multiplexed connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum OutboundCommand {
    /// Switch the detector mode of a camera
    ChangeMode { camera_id: CameraId, mode: CameraMode },
}

impl OutboundCommand {
    pub fn camera_id(&self) -> CameraId {
        match self {
            Self::ChangeMode { camera_id, .. } => *camera_id,
        }
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
