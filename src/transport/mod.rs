//! Transport - Multiplexed Backend Connection
//!
//! ## Responsibilities
//!
//! - Own the single persistent WebSocket to the backend
//! - Decode inbound frames and publish them on one shared stream
//! - Serialize outbound commands (dropped with a warning while offline)
//! - Reconnect with bounded exponential backoff, re-issuing the token
//!
//! Transport holds no camera state. Consumers subscribe through `events()`
//! once; reconnects never create additional subscriptions.

pub mod types;

pub use types::{BackoffPolicy, ConnectionInfo, ConnectionStatus, TransportConfig};

use crate::error::{Error, Result};
use crate::stream_message::{InboundMessage, OutboundCommand};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;

/// How a single connection ended
enum SessionEnd {
    Shutdown,
    Closed,
}

/// Connection handles guarded together so a send never races a reconnect
#[derive(Default)]
struct Link {
    outbound: Option<mpsc::UnboundedSender<OutboundCommand>>,
    shutdown: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

/// Transport instance
pub struct Transport {
    config: TransportConfig,
    inbound_tx: broadcast::Sender<Arc<InboundMessage>>,
    status_tx: watch::Sender<ConnectionInfo>,
    link: Mutex<Link>,
}

impl Transport {
    /// Create new Transport (not connected)
    pub fn new(config: TransportConfig) -> Arc<Self> {
        let (inbound_tx, _) = broadcast::channel(config.channel_capacity.max(1));
        let (status_tx, _) = watch::channel(ConnectionInfo::default());
        Arc::new(Self {
            config,
            inbound_tx,
            status_tx,
            link: Mutex::new(Link::default()),
        })
    }

    /// Establish the connection. No-op while connecting, connected or backing off.
    pub async fn connect(self: &Arc<Self>, token: &str) {
        let mut link = self.link.lock().await;

        let running = link.task.as_ref().is_some_and(|t| !t.is_finished());
        if running || self.status().is_active() {
            tracing::debug!("Transport already connecting/connected, ignoring connect");
            return;
        }

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        self.status_tx.send_modify(|info| {
            info.status = ConnectionStatus::Connecting;
            info.retry_count = 0;
            info.backoff_until = None;
            info.degraded = false;
        });

        let transport = self.clone();
        let token = token.to_string();
        let task = tokio::spawn(async move {
            transport
                .run_connection_loop(token, outbound_rx, shutdown_rx)
                .await;
        });

        link.outbound = Some(outbound_tx);
        link.shutdown = Some(shutdown_tx);
        link.task = Some(task);

        tracing::info!(ws_url = %self.config.ws_url, "Transport connecting");
    }

    /// Enqueue an outbound command. Returns false (and logs) when not connected.
    pub async fn send(&self, command: OutboundCommand) -> bool {
        let link = self.link.lock().await;

        if !self.status().is_connected() {
            tracing::warn!(
                camera_id = %command.camera_id(),
                "Transport not connected, dropping outbound command"
            );
            return false;
        }

        match link.outbound.as_ref() {
            Some(tx) => tx.send(command).is_ok(),
            None => false,
        }
    }

    /// The single shared inbound stream
    pub fn events(&self) -> broadcast::Receiver<Arc<InboundMessage>> {
        self.inbound_tx.subscribe()
    }

    /// Current connection state
    pub fn status(&self) -> ConnectionInfo {
        self.status_tx.borrow().clone()
    }

    /// Observe connection state transitions
    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionInfo> {
        self.status_tx.subscribe()
    }

    /// Tear down the connection and stop reconnecting
    pub async fn shutdown(&self) {
        let task = {
            let mut link = self.link.lock().await;
            if let Some(shutdown) = link.shutdown.take() {
                let _ = shutdown.send(true);
            }
            link.outbound = None;
            link.task.take()
        };

        if let Some(task) = task {
            let _ = task.await;
        }

        self.status_tx.send_modify(|info| {
            info.status = ConnectionStatus::Disconnected;
            info.backoff_until = None;
        });
        tracing::info!("Transport shut down");
    }

    fn endpoint_url(&self, token: &str) -> String {
        let sep = if self.config.ws_url.contains('?') { '&' } else { '?' };
        format!(
            "{}{}token={}",
            self.config.ws_url,
            sep,
            urlencoding::encode(token)
        )
    }

    async fn run_connection_loop(
        self: Arc<Self>,
        token: String,
        mut outbound_rx: mpsc::UnboundedReceiver<OutboundCommand>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let policy = self.config.backoff.clone();
        let mut attempts: u32 = 0;

        loop {
            self.status_tx.send_modify(|info| {
                info.status = ConnectionStatus::Connecting;
                info.backoff_until = None;
            });

            let outcome = self
                .run_session(&token, &mut attempts, &mut outbound_rx, &mut shutdown_rx)
                .await;

            self.mark_disconnected(&mut outbound_rx).await;

            match outcome {
                Ok(SessionEnd::Shutdown) => break,
                Ok(SessionEnd::Closed) => {
                    tracing::warn!("Backend closed the stream connection");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Stream connection failed");
                }
            }

            if *shutdown_rx.borrow() {
                break;
            }

            attempts += 1;
            if attempts > policy.max_retries {
                let err = Error::ConnectionDegraded {
                    attempts: policy.max_retries,
                };
                tracing::error!(error = %err, "Giving up on stream connection");
                self.status_tx.send_modify(|info| {
                    info.status = ConnectionStatus::Disconnected;
                    info.retry_count = attempts - 1;
                    info.backoff_until = None;
                    info.degraded = true;
                });
                break;
            }

            let delay = policy.delay(attempts);
            let deadline = Instant::now() + delay;
            self.status_tx.send_modify(|info| {
                info.retry_count = attempts;
                info.backoff_until = Some(deadline);
            });
            tracing::warn!(
                attempt = attempts,
                max_retries = policy.max_retries,
                delay_ms = delay.as_millis() as u64,
                "Reconnecting stream"
            );

            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {}
                _ = shutdown_rx.changed() => break,
            }
        }

        tracing::info!("Stream connection loop stopped");
    }

    /// One connection from handshake to close
    async fn run_session(
        &self,
        token: &str,
        attempts: &mut u32,
        outbound_rx: &mut mpsc::UnboundedReceiver<OutboundCommand>,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Result<SessionEnd> {
        let url = self.endpoint_url(token);

        let handshake = tokio::time::timeout(
            self.config.handshake_timeout,
            tokio_tungstenite::connect_async(url.as_str()),
        );
        let (ws, _response) = tokio::select! {
            result = handshake => result.map_err(|_| {
                Error::Transport(format!(
                    "handshake timed out after {}ms",
                    self.config.handshake_timeout.as_millis()
                ))
            })??,
            _ = shutdown_rx.changed() => return Ok(SessionEnd::Shutdown),
        };

        *attempts = 0;
        {
            let _link = self.link.lock().await;
            self.status_tx.send_modify(|info| {
                info.status = ConnectionStatus::Connected;
                info.retry_count = 0;
                info.backoff_until = None;
                info.degraded = false;
                info.epoch += 1;
            });
        }
        tracing::info!(epoch = self.status().epoch, "Stream connected");

        let (mut write, mut read) = ws.split();

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(SessionEnd::Shutdown);
                }
                Some(command) = outbound_rx.recv() => {
                    let text = command.encode()?;
                    write.send(Message::Text(text.into())).await?;
                }
                frame = read.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.dispatch(InboundMessage::decode(text.as_str())),
                    Some(Ok(Message::Binary(bytes))) => self.dispatch(InboundMessage::decode_bytes(&bytes)),
                    Some(Ok(Message::Close(_))) | None => return Ok(SessionEnd::Closed),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(Error::Transport(e.to_string())),
                },
            }
        }
    }

    fn dispatch(&self, decoded: Result<InboundMessage>) {
        match decoded {
            Ok(message) => {
                // Err only means nobody is subscribed yet
                let _ = self.inbound_tx.send(Arc::new(message));
            }
            Err(e) => {
                tracing::debug!(error = %e, "Dropping malformed stream message");
            }
        }
    }

    /// Flip to Disconnected under the link lock and discard queued commands
    async fn mark_disconnected(&self, outbound_rx: &mut mpsc::UnboundedReceiver<OutboundCommand>) {
        let _link = self.link.lock().await;
        self.status_tx.send_modify(|info| {
            info.status = ConnectionStatus::Disconnected;
        });

        let mut dropped = 0usize;
        while outbound_rx.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            tracing::warn!(dropped = dropped, "Discarded outbound commands queued before disconnect");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CameraId, CameraMode};
    use crate::stream_message::{MessagePayload, StreamEvent};
    use std::time::Duration;
    use tokio::net::{TcpListener, TcpStream};
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
    use tokio_tungstenite::WebSocketStream;

    fn test_config(addr: std::net::SocketAddr, max_retries: u32) -> TransportConfig {
        TransportConfig {
            ws_url: format!("ws://{}/smart-stream/ws/smart-stream", addr),
            backoff: BackoffPolicy {
                base: Duration::from_millis(10),
                cap: Duration::from_millis(40),
                max_retries,
            },
            handshake_timeout: Duration::from_secs(2),
            channel_capacity: 64,
        }
    }

    /// Accept one client and report the request URI
    async fn accept(
        listener: &TcpListener,
        uri_tx: &mpsc::UnboundedSender<String>,
    ) -> WebSocketStream<TcpStream> {
        let (stream, _) = listener.accept().await.unwrap();
        let tx = uri_tx.clone();
        tokio_tungstenite::accept_hdr_async(
            stream,
            move |req: &Request, resp: Response| -> std::result::Result<Response, ErrorResponse> {
                let _ = tx.send(req.uri().to_string());
                Ok(resp)
            },
        )
        .await
        .unwrap()
    }

    async fn wait_for<F>(rx: &mut watch::Receiver<ConnectionInfo>, pred: F) -> ConnectionInfo
    where
        F: Fn(&ConnectionInfo) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                {
                    let info = rx.borrow_and_update().clone();
                    if pred(&info) {
                        return info;
                    }
                }
                rx.changed().await.unwrap();
            }
        })
        .await
        .expect("status condition not reached")
    }

    #[tokio::test]
    async fn test_inbound_frames_are_decoded_and_malformed_dropped() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let transport = Transport::new(test_config(listener.local_addr().unwrap(), 3));
        let mut events = transport.events();
        let (uri_tx, mut uri_rx) = mpsc::unbounded_channel();

        transport.connect("secret token").await;
        let mut server = accept(&listener, &uri_tx).await;

        let uri = uri_rx.recv().await.unwrap();
        assert_eq!(uri, "/smart-stream/ws/smart-stream?token=secret%20token");

        server.send(Message::Text("{broken".to_string().into())).await.unwrap();
        server
            .send(Message::Text(
                r#"{"camera_id":"7","event":"ORDER_CREATED","data":{"code":"ORD-1"}}"#
                    .to_string()
                    .into(),
            ))
            .await
            .unwrap();

        let msg = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.camera_id, Some(CameraId(7)));
        assert_eq!(
            msg.payload,
            MessagePayload::Event(StreamEvent::OrderCreated {
                order_code: "ORD-1".to_string()
            })
        );

        transport.shutdown().await;
        assert_eq!(transport.status().status, ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let transport = Transport::new(test_config(listener.local_addr().unwrap(), 3));
        let (uri_tx, _uri_rx) = mpsc::unbounded_channel();
        let mut status = transport.subscribe_status();

        transport.connect("t").await;
        transport.connect("t").await;
        let _server = accept(&listener, &uri_tx).await;
        wait_for(&mut status, |i| i.is_connected()).await;

        transport.connect("t").await;
        let second = tokio::time::timeout(Duration::from_millis(200), listener.accept()).await;
        assert!(second.is_err(), "a second connection was opened");
        assert_eq!(transport.status().epoch, 1);

        transport.shutdown().await;
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let transport = Transport::new(test_config(listener.local_addr().unwrap(), 3));
        let command = OutboundCommand::ChangeMode {
            camera_id: CameraId(2),
            mode: CameraMode::Both,
        };

        assert!(!transport.send(command.clone()).await);

        let (uri_tx, _uri_rx) = mpsc::unbounded_channel();
        let mut status = transport.subscribe_status();
        transport.connect("t").await;
        let mut server = accept(&listener, &uri_tx).await;
        wait_for(&mut status, |i| i.is_connected()).await;

        assert!(transport.send(command).await);
        let received = tokio::time::timeout(Duration::from_secs(5), server.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let value: serde_json::Value =
            serde_json::from_str(received.to_text().unwrap()).unwrap();
        assert_eq!(value, serde_json::json!({"camera_id": 2, "mode": "both"}));

        transport.shutdown().await;
    }

    #[tokio::test]
    async fn test_reconnect_reissues_token_without_new_subscription() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let transport = Transport::new(test_config(listener.local_addr().unwrap(), 5));
        let mut events = transport.events();
        let mut status = transport.subscribe_status();
        let (uri_tx, mut uri_rx) = mpsc::unbounded_channel();

        transport.connect("tok").await;
        let mut first = accept(&listener, &uri_tx).await;
        wait_for(&mut status, |i| i.epoch == 1 && i.is_connected()).await;
        first.close(None).await.unwrap();
        drop(first);

        let mut second = accept(&listener, &uri_tx).await;
        wait_for(&mut status, |i| i.epoch == 2 && i.is_connected()).await;

        assert_eq!(uri_rx.recv().await.unwrap(), uri_rx.recv().await.unwrap());

        second
            .send(Message::Text(
                r#"{"camera_id":1,"event":"human_detected"}"#.to_string().into(),
            ))
            .await
            .unwrap();
        let msg = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.payload, MessagePayload::Event(StreamEvent::HumanDetected));
        assert_eq!(transport.inbound_tx.receiver_count(), 1);

        transport.shutdown().await;
    }

    #[tokio::test]
    async fn test_retry_budget_exhaustion_degrades() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport = Transport::new(test_config(addr, 2));
        let mut status = transport.subscribe_status();
        transport.connect("t").await;

        let info = wait_for(&mut status, |i| i.degraded).await;
        assert_eq!(info.status, ConnectionStatus::Disconnected);
        assert_eq!(info.retry_count, 2);
        assert!(!info.is_active());
    }

    #[tokio::test]
    async fn test_stalled_handshake_counts_as_failed_attempt() {
        // Accepts TCP but never answers the upgrade
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut config = test_config(listener.local_addr().unwrap(), 1);
        config.handshake_timeout = Duration::from_millis(100);
        let held = tokio::spawn(async move {
            let mut sockets = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                sockets.push(stream);
            }
        });

        let transport = Transport::new(config);
        let mut status = transport.subscribe_status();
        transport.connect("t").await;

        let info = wait_for(&mut status, |i| i.degraded).await;
        assert_eq!(info.status, ConnectionStatus::Disconnected);
        assert_eq!(info.epoch, 0);
        held.abort();
    }
}
