//! Controller state
//!
//! Builds the session controller and holds its shared components

use crate::camera_api::{CameraApi, HttpCameraApi};
use crate::camera_session::{SessionDeps, SessionHandle, SessionRegistry};
use crate::channel_router::ChannelRouter;
use crate::command_gateway::CommandGateway;
use crate::error::{Error, Result};
use crate::models::{CameraId, CameraMode};
use crate::presence_watchdog::{PresenceWatchdog, WatchdogConfig};
use crate::reconciliation_service::ReconciliationService;
use crate::stream_message::OutboundCommand;
use crate::transport::{BackoffPolicy, ConnectionInfo, Transport, TransportConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Controller configuration
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// REST base URL (`http://` or `https://`)
    pub api_url: String,
    /// Stream endpoint path appended to the ws form of `api_url`
    pub ws_path: String,
    pub watchdog_threshold: Duration,
    pub watchdog_tick: Duration,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub reconnect_max_retries: u32,
    pub handshake_timeout: Duration,
    /// Bounded wait for a command acknowledgement
    pub command_timeout: Duration,
    pub closure_reprobe: Duration,
    pub channel_capacity: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            api_url: std::env::var("PACKCAM_API_URL")
                .unwrap_or_else(|_| "http://localhost:8000".to_string()),
            ws_path: std::env::var("PACKCAM_WS_PATH")
                .unwrap_or_else(|_| "/smart-stream/ws/smart-stream".to_string()),
            watchdog_threshold: Duration::from_secs(env_u64("PACKCAM_WATCHDOG_THRESHOLD_SECS", 60)),
            watchdog_tick: Duration::from_millis(env_u64("PACKCAM_WATCHDOG_TICK_MS", 200)),
            backoff_base: Duration::from_millis(env_u64("PACKCAM_BACKOFF_BASE_MS", 3000)),
            backoff_cap: Duration::from_millis(env_u64("PACKCAM_BACKOFF_CAP_MS", 30000)),
            reconnect_max_retries: env_u64("PACKCAM_RECONNECT_MAX_RETRIES", 10) as u32,
            handshake_timeout: Duration::from_millis(env_u64("PACKCAM_HANDSHAKE_TIMEOUT_MS", 10000)),
            command_timeout: Duration::from_millis(env_u64("PACKCAM_COMMAND_TIMEOUT_MS", 10000)),
            closure_reprobe: Duration::from_secs(env_u64("PACKCAM_CLOSURE_REPROBE_SECS", 10)),
            channel_capacity: env_u64("PACKCAM_CHANNEL_CAPACITY", 256) as usize,
        }
    }
}

impl ControllerConfig {
    /// `http://host` -> `ws://host{ws_path}`, `https://` -> `wss://`
    pub fn ws_url(&self) -> Result<String> {
        let base = self.api_url.trim_end_matches('/');
        let ws_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else if base.starts_with("ws://") || base.starts_with("wss://") {
            base.to_string()
        } else {
            return Err(Error::Config(format!("unsupported api_url scheme: {}", self.api_url)));
        };
        Ok(format!("{}{}", ws_base, self.ws_path))
    }

    pub fn validate(&self) -> Result<()> {
        self.ws_url()?;
        if self.watchdog_threshold.is_zero() {
            return Err(Error::Config("watchdog threshold must be positive".to_string()));
        }
        if self.watchdog_tick.is_zero() {
            return Err(Error::Config("watchdog tick must be positive".to_string()));
        }
        Ok(())
    }

    pub fn transport_config(&self) -> Result<TransportConfig> {
        Ok(TransportConfig {
            ws_url: self.ws_url()?,
            backoff: BackoffPolicy {
                base: self.backoff_base,
                cap: self.backoff_cap,
                max_retries: self.reconnect_max_retries,
            },
            handshake_timeout: self.handshake_timeout,
            channel_capacity: self.channel_capacity,
        })
    }

    pub fn watchdog_config(&self) -> WatchdogConfig {
        WatchdogConfig {
            threshold: self.watchdog_threshold,
            tick_interval: self.watchdog_tick,
        }
    }
}

/// Root scope of the session controller; owns the single transport
pub struct SessionController {
    pub config: ControllerConfig,
    pub transport: Arc<Transport>,
    pub router: Arc<ChannelRouter>,
    pub watchdog: Arc<PresenceWatchdog>,
    pub reconciler: Arc<ReconciliationService>,
    pub gateway: Arc<CommandGateway>,
    pub sessions: Arc<SessionRegistry>,
    http_api: Option<Arc<HttpCameraApi>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl SessionController {
    /// Controller backed by the REST API at `config.api_url`
    pub fn new(config: ControllerConfig) -> Result<Self> {
        let http_api = Arc::new(HttpCameraApi::new(
            config.api_url.clone(),
            config.command_timeout,
        )?);
        let mut controller = Self::with_api(config, http_api.clone())?;
        controller.http_api = Some(http_api);
        Ok(controller)
    }

    /// Controller with an injected command/snapshot backend.
    /// Must be called inside a tokio runtime.
    pub fn with_api(config: ControllerConfig, api: Arc<dyn CameraApi>) -> Result<Self> {
        config.validate()?;

        let transport = Transport::new(config.transport_config()?);
        let router = ChannelRouter::spawn(transport.events(), config.channel_capacity);
        let watchdog = PresenceWatchdog::new(config.watchdog_config());
        let reconciler = ReconciliationService::new(api.clone());
        let gateway = Arc::new(CommandGateway::new(api, config.command_timeout));

        let sessions = SessionRegistry::new(SessionDeps {
            router: router.clone(),
            watchdog: watchdog.clone(),
            reconciler: reconciler.clone(),
            gateway: gateway.clone(),
            closure_reprobe: config.closure_reprobe,
        });

        Ok(Self {
            config,
            transport,
            router,
            watchdog,
            reconciler,
            gateway,
            sessions,
            http_api: None,
            watcher: Mutex::new(None),
        })
    }

    /// Connect the stream and start the shared watchdog tick
    pub async fn start(&self, token: &str) {
        if let Some(api) = &self.http_api {
            api.set_token(token).await;
        }

        {
            let mut watcher = self.watcher.lock().await;
            if watcher.is_none() {
                *watcher = Some(self.reconciler.watch_reconnects(
                    self.transport.subscribe_status(),
                    Arc::downgrade(&self.sessions),
                ));
            }
        }

        self.watchdog.start().await;
        self.transport.connect(token).await;

        tracing::info!(api_url = %self.config.api_url, "Session controller started");
    }

    /// Open (or reuse) the session of a camera that became visible
    pub async fn open_camera(&self, camera_id: CameraId) -> SessionHandle {
        self.sessions.open(camera_id).await
    }

    /// Camera no longer displayed; never stops the remote recording
    pub async fn close_camera(&self, camera_id: CameraId) -> bool {
        self.sessions.close(camera_id).await
    }

    /// Switch the detector mode over the stream; false while offline
    pub async fn change_mode(&self, camera_id: CameraId, mode: CameraMode) -> bool {
        self.transport
            .send(OutboundCommand::ChangeMode { camera_id, mode })
            .await
    }

    pub fn connection(&self) -> ConnectionInfo {
        self.transport.status()
    }

    pub async fn shutdown(&self) {
        self.sessions.close_all().await;
        self.watchdog.stop().await;
        self.transport.shutdown().await;
        if let Some(watcher) = self.watcher.lock().await.take() {
            watcher.abort();
        }
        tracing::info!("Session controller stopped");
    }
}
