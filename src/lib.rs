//! Packcam Session Library
//!
//! Real-time multi-camera session controller for the packing-floor dashboard
//!
//! ## Architecture (6 Components)
//!
//! 1. Transport - Single multiplexed WebSocket with reconnect/backoff
//! 2. ChannelRouter - Per-camera demultiplexing of the shared stream
//! 3. PresenceWatchdog - Shared idle countdown for Auto recordings
//! 4. CameraSession - Per-camera recording lifecycle state machine
//! 5. ReconciliationService - Snapshot merge on open and after reconnects
//! 6. CommandGateway - Operator commands over REST with bounded acks
//!
//! ## Design Principles
//!
//! - Authoritative events: recording state changes only on server input
//! - View/record decoupling: closing a viewer never stops a recording
//! - One owner per state: each session mutates only its own fields

pub mod camera_api;
pub mod camera_session;
pub mod channel_router;
pub mod command_gateway;
pub mod error;
pub mod models;
pub mod presence_watchdog;
pub mod reconciliation_service;
pub mod state;
pub mod stream_message;
pub mod transport;

pub use error::{Error, Result};
pub use state::{ControllerConfig, SessionController};
