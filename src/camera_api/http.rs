//! REST implementation of `CameraApi`

use super::{CameraApi, CommandAck};
use crate::error::{Error, Result};
use crate::models::{ApiEnvelope, CameraId, ConnectionState, RecordingState, SessionSnapshot};
use crate::stream_message::CommandKind;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::RwLock;

/// `data` of `GET /cameras/{id}`
#[derive(Debug, Deserialize)]
struct CameraStatusData {
    #[serde(default)]
    is_connected: bool,
    #[serde(default)]
    recording_state: Option<RecordingState>,
    #[serde(default)]
    active_order_code: Option<String>,
}

impl From<CameraStatusData> for SessionSnapshot {
    fn from(data: CameraStatusData) -> Self {
        let connection = if data.is_connected {
            ConnectionState::Live
        } else {
            ConnectionState::Off
        };
        let recording = data.recording_state.unwrap_or(RecordingState::Idle);
        let active_order_code = match recording {
            RecordingState::Idle => None,
            _ => data
                .active_order_code
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty()),
        };

        SessionSnapshot {
            connection,
            recording,
            active_order_code,
        }
    }
}

/// `data` of `POST /cameras/{id}/recording/start`
#[derive(Debug, Default, Deserialize)]
struct StartData {
    #[serde(default)]
    order_code: Option<String>,
}

#[derive(Debug, Serialize)]
struct StopBody<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    order_code: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    note: Option<&'a str>,
}

/// HTTP camera API client
pub struct HttpCameraApi {
    client: Client,
    base_url: String,
    token: RwLock<Option<String>>,
}

impl HttpCameraApi {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(5))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: RwLock::new(None),
        })
    }

    /// Bearer token shared with the stream connection
    pub async fn set_token(&self, token: impl Into<String>) {
        *self.token.write().await = Some(token.into());
    }

    fn url(&self, camera_id: CameraId, path: &str) -> String {
        format!("{}/cameras/{}{}", self.base_url, camera_id, path)
    }

    async fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match self.token.read().await.as_deref() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn execute<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<Option<T>> {
        let request = self.authorized(request).await;
        let resp = request.send().await?;
        let status = resp.status();
        let body = resp.text().await?;

        parse_envelope(status.as_u16(), &body)
    }

    async fn command(&self, camera_id: CameraId, kind: CommandKind, path: &str) -> Result<CommandAck> {
        let url = self.url(camera_id, path);
        tracing::debug!(camera_id = %camera_id, command = %kind, url = %url, "Sending camera command");

        self.execute::<serde_json::Value>(self.client.post(&url))
            .await
            .map(|_| CommandAck::new(kind))
    }
}

/// Decode `{code, mes, data}`; HTTP and envelope codes must both be 2xx
fn parse_envelope<T: DeserializeOwned>(status: u16, body: &str) -> Result<Option<T>> {
    let envelope: Option<ApiEnvelope<T>> = if body.trim().is_empty() {
        None
    } else {
        serde_json::from_str(body).ok()
    };

    if !(200..300).contains(&status) {
        let message = envelope
            .and_then(|e| e.mes)
            .unwrap_or_else(|| body.chars().take(200).collect());
        return Err(Error::Api { status, message });
    }

    match envelope {
        None if body.trim().is_empty() => Ok(None),
        None => Err(Error::MalformedMessage(format!(
            "unexpected response body: {}",
            body.chars().take(200).collect::<String>()
        ))),
        Some(envelope) if !envelope.is_success() => Err(Error::Api {
            status: envelope
                .code
                .and_then(|c| u16::try_from(c).ok())
                .unwrap_or(status),
            message: envelope.mes.unwrap_or_else(|| "request failed".to_string()),
        }),
        Some(envelope) => Ok(envelope.data),
    }
}

#[async_trait]
impl CameraApi for HttpCameraApi {
    async fn connect(&self, camera_id: CameraId) -> Result<CommandAck> {
        self.command(camera_id, CommandKind::Connect, "/connect").await
    }

    async fn disconnect(&self, camera_id: CameraId) -> Result<CommandAck> {
        self.command(camera_id, CommandKind::Disconnect, "/disconnect")
            .await
    }

    async fn start_recording(&self, camera_id: CameraId) -> Result<CommandAck> {
        let url = self.url(camera_id, "/recording/start");
        let data: StartData = self
            .execute(self.client.post(&url))
            .await?
            .unwrap_or_default();

        let mut ack = CommandAck::new(CommandKind::Start);
        ack.order_code = data.order_code.filter(|c| !c.trim().is_empty());
        Ok(ack)
    }

    async fn stop_recording(
        &self,
        camera_id: CameraId,
        order_code: Option<&str>,
        note: Option<&str>,
    ) -> Result<CommandAck> {
        let url = self.url(camera_id, "/recording/stop");
        let body = StopBody { order_code, note };

        self.execute::<serde_json::Value>(self.client.post(&url).json(&body))
            .await?;

        let mut ack = CommandAck::new(CommandKind::Stop);
        ack.order_code = order_code.map(str::to_string);
        Ok(ack)
    }

    async fn snapshot(&self, camera_id: CameraId) -> Result<SessionSnapshot> {
        let url = self.url(camera_id, "");
        let data: CameraStatusData = self
            .execute(self.client.get(&url))
            .await?
            .ok_or_else(|| Error::MalformedMessage("camera status without data".to_string()))?;

        Ok(data.into())
    }
}
