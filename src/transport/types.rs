//! Transport types

use std::time::Duration;
use tokio::time::Instant;

/// Connection status of the multiplexed connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

/// Observable state of the single process-wide connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub status: ConnectionStatus,
    /// Consecutive failed attempts since the last successful connect
    pub retry_count: u32,
    /// Next reconnect attempt, while waiting out a backoff
    pub backoff_until: Option<Instant>,
    /// Retry budget exhausted; no further automatic reconnects
    pub degraded: bool,
    /// Number of successful connects so far (1 = first connect)
    pub epoch: u64,
}

impl Default for ConnectionInfo {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            retry_count: 0,
            backoff_until: None,
            degraded: false,
            epoch: 0,
        }
    }
}

impl ConnectionInfo {
    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }

    /// Connecting, connected, or waiting to retry
    pub fn is_active(&self) -> bool {
        match self.status {
            ConnectionStatus::Connecting | ConnectionStatus::Connected => true,
            ConnectionStatus::Disconnected => self.backoff_until.is_some(),
        }
    }
}

/// Bounded exponential backoff
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_retries: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(3),
            cap: Duration::from_secs(30),
            max_retries: 10,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry `attempt` (1-based): base * 2^(attempt-1), capped
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exp;
        self.base
            .checked_mul(factor)
            .map_or(self.cap, |d| d.min(self.cap))
    }
}

/// Transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// WebSocket endpoint without the token query
    pub ws_url: String,
    pub backoff: BackoffPolicy,
    /// Upper bound on the WebSocket handshake; expiry counts as a failed attempt
    pub handshake_timeout: Duration,
    /// Inbound broadcast buffer
    pub channel_capacity: usize,
}
