//! ChannelRouter - Per-Camera Demultiplexing
//!
//! ## Responsibilities
//!
//! - Consume the Transport stream once (single upstream subscription)
//! - Fan messages out to per-camera channels keyed by normalized camera id
//! - Share one channel between all subscribers of the same camera
//! - Drop a camera channel when its last subscriber goes away
//!
//! Messages without a camera id go to the broadcast channel only. Messages
//! lost to a full buffer surface as a `Routed::Gap` so the session can resync.

use crate::models::CameraId;
use crate::stream_message::InboundMessage;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use uuid::Uuid;

type ChannelMap = Mutex<HashMap<CameraId, CameraChannel>>;

/// Item delivered on a camera channel
#[derive(Debug, Clone)]
pub enum Routed {
    Message(Arc<InboundMessage>),
    /// Messages for this camera may have been dropped
    Gap { skipped: u64 },
}

/// One demuxed camera channel
struct CameraChannel {
    tx: broadcast::Sender<Routed>,
    subscribers: HashSet<Uuid>,
}

fn lock(channels: &ChannelMap) -> MutexGuard<'_, HashMap<CameraId, CameraChannel>> {
    channels.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// ChannelRouter instance
pub struct ChannelRouter {
    channels: Arc<ChannelMap>,
    broadcast_tx: broadcast::Sender<Arc<InboundMessage>>,
    capacity: usize,
    task: JoinHandle<()>,
}

impl ChannelRouter {
    /// Start routing from the given upstream subscription
    pub fn spawn(upstream: broadcast::Receiver<Arc<InboundMessage>>, capacity: usize) -> Arc<Self> {
        let capacity = capacity.max(1);
        let channels: Arc<ChannelMap> = Arc::new(Mutex::new(HashMap::new()));
        let (broadcast_tx, _) = broadcast::channel(capacity);

        let task = tokio::spawn(Self::run(upstream, channels.clone(), broadcast_tx.clone()));

        tracing::info!("ChannelRouter started");

        Arc::new(Self {
            channels,
            broadcast_tx,
            capacity,
            task,
        })
    }

    async fn run(
        mut upstream: broadcast::Receiver<Arc<InboundMessage>>,
        channels: Arc<ChannelMap>,
        broadcast_tx: broadcast::Sender<Arc<InboundMessage>>,
    ) {
        loop {
            match upstream.recv().await {
                Ok(message) => Self::route(&channels, &broadcast_tx, message),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped = skipped, "ChannelRouter lagged behind transport");
                    // Any camera may have lost messages
                    for channel in lock(&channels).values() {
                        let _ = channel.tx.send(Routed::Gap { skipped });
                    }
                }
                Err(RecvError::Closed) => break,
            }
        }
        tracing::info!("ChannelRouter stopped");
    }

    fn route(
        channels: &ChannelMap,
        broadcast_tx: &broadcast::Sender<Arc<InboundMessage>>,
        message: Arc<InboundMessage>,
    ) {
        match message.camera_id {
            None => {
                let _ = broadcast_tx.send(message);
            }
            Some(camera_id) => {
                let channels = lock(channels);
                if let Some(channel) = channels.get(&camera_id) {
                    let _ = channel.tx.send(Routed::Message(message));
                }
            }
        }
    }

    /// Subscribe to the messages of one camera
    pub fn for_camera(&self, camera_id: CameraId) -> CameraSubscription {
        let id = Uuid::new_v4();
        let mut channels = lock(&self.channels);

        let channel = channels.entry(camera_id).or_insert_with(|| {
            tracing::debug!(camera_id = %camera_id, "Opening camera channel");
            CameraChannel {
                tx: broadcast::channel(self.capacity).0,
                subscribers: HashSet::new(),
            }
        });
        channel.subscribers.insert(id);

        CameraSubscription {
            camera_id,
            id,
            rx: channel.tx.subscribe(),
            channels: Arc::downgrade(&self.channels),
        }
    }

    /// Subscribe to camera-less (system-wide) messages
    pub fn subscribe_broadcast(&self) -> broadcast::Receiver<Arc<InboundMessage>> {
        self.broadcast_tx.subscribe()
    }

    /// Cameras with at least one subscriber
    pub fn active_cameras(&self) -> Vec<CameraId> {
        let mut ids: Vec<CameraId> = lock(&self.channels).keys().copied().collect();
        ids.sort();
        ids
    }

    /// Number of subscribers sharing a camera channel
    pub fn subscriber_count(&self, camera_id: CameraId) -> usize {
        lock(&self.channels)
            .get(&camera_id)
            .map_or(0, |c| c.subscribers.len())
    }
}

impl Drop for ChannelRouter {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Per-camera message stream; unsubscribes on drop
pub struct CameraSubscription {
    camera_id: CameraId,
    id: Uuid,
    rx: broadcast::Receiver<Routed>,
    channels: Weak<ChannelMap>,
}

impl CameraSubscription {
    pub fn camera_id(&self) -> CameraId {
        self.camera_id
    }

    /// Next item in arrival order. `None` once the router is gone.
    pub async fn recv(&mut self) -> Option<Routed> {
        match self.rx.recv().await {
            Ok(routed) => Some(routed),
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(
                    camera_id = %self.camera_id,
                    skipped = skipped,
                    "Camera subscriber lagged, messages skipped"
                );
                Some(Routed::Gap { skipped })
            }
            Err(RecvError::Closed) => None,
        }
    }
}

impl Drop for CameraSubscription {
    fn drop(&mut self) {
        let Some(channels) = self.channels.upgrade() else {
            return;
        };
        let mut channels = lock(&channels);
        if let Some(channel) = channels.get_mut(&self.camera_id) {
            channel.subscribers.remove(&self.id);
            if channel.subscribers.is_empty() {
                channels.remove(&self.camera_id);
                tracing::debug!(camera_id = %self.camera_id, "Closed camera channel");
            }
        }
    }
}
