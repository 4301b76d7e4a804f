//! ReconciliationService - Snapshot Merge After Gaps
//!
//! ## Responsibilities
//!
//! - Fetch a one-shot camera snapshot when a session opens
//! - Re-fetch for every open session after the stream reconnects
//! - Serve closure probes from sessions whose countdown expired
//!
//! Merging is done by the session itself; snapshots arriving while a
//! command is pending are buffered there, never dropped here. One fetch runs
//! per camera; every session that asked during it gets the result, and a
//! request made mid-fetch triggers a fresh fetch before anyone is served.

use crate::camera_api::CameraApi;
use crate::camera_session::{SessionRegistry, SnapshotSink};
use crate::models::CameraId;
use crate::transport::ConnectionInfo;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

/// Fetch in progress for one camera
struct InFlight {
    sinks: Vec<SnapshotSink>,
    /// A request arrived after the running fetch started
    refetch: bool,
}

/// ReconciliationService instance
pub struct ReconciliationService {
    api: Arc<dyn CameraApi>,
    in_flight: Mutex<HashMap<CameraId, InFlight>>,
}

impl ReconciliationService {
    pub fn new(api: Arc<dyn CameraApi>) -> Arc<Self> {
        Arc::new(Self {
            api,
            in_flight: Mutex::new(HashMap::new()),
        })
    }

    /// Fetch a snapshot for one session. At most one fetch per camera runs at a time.
    pub async fn request(self: &Arc<Self>, sink: SnapshotSink) {
        let camera_id = sink.camera_id();
        {
            let mut in_flight = self.in_flight.lock().await;
            if let Some(fetch) = in_flight.get_mut(&camera_id) {
                if !fetch.sinks.iter().any(|s| s.session_id() == sink.session_id()) {
                    fetch.sinks.push(sink);
                }
                fetch.refetch = true;
                tracing::debug!(camera_id = %camera_id, "Snapshot in flight, refetch queued");
                return;
            }
            in_flight.insert(
                camera_id,
                InFlight {
                    sinks: vec![sink],
                    refetch: false,
                },
            );
        }

        let service = self.clone();
        tokio::spawn(async move { service.fetch(camera_id).await });
    }

    async fn fetch(&self, camera_id: CameraId) {
        let (result, sinks) = loop {
            let result = self.api.snapshot(camera_id).await;

            let mut in_flight = self.in_flight.lock().await;
            let refetch = match in_flight.get_mut(&camera_id) {
                Some(fetch) if fetch.refetch => {
                    fetch.refetch = false;
                    true
                }
                _ => false,
            };
            if !refetch {
                let sinks = in_flight
                    .remove(&camera_id)
                    .map(|fetch| fetch.sinks)
                    .unwrap_or_default();
                break (result, sinks);
            }
            tracing::debug!(camera_id = %camera_id, "Snapshot superseded, fetching again");
        };

        match &result {
            Ok(snapshot) => tracing::debug!(
                camera_id = %camera_id,
                recording = %snapshot.recording,
                order_code = ?snapshot.active_order_code,
                sessions = sinks.len(),
                "Snapshot fetched"
            ),
            Err(e) => tracing::warn!(camera_id = %camera_id, error = %e, "Snapshot fetch failed"),
        }

        for sink in sinks {
            if !sink.deliver(&result) {
                tracing::debug!(
                    camera_id = %camera_id,
                    session_id = %sink.session_id(),
                    "Session closed before snapshot arrived"
                );
            }
        }
    }

    pub async fn in_flight(&self) -> usize {
        self.in_flight.lock().await.len()
    }

    /// Follow transport status: mark sessions stale on loss, reconcile on reconnect
    pub fn watch_reconnects(
        self: &Arc<Self>,
        mut status: watch::Receiver<ConnectionInfo>,
        registry: Weak<SessionRegistry>,
    ) -> JoinHandle<()> {
        let service = self.clone();

        tokio::spawn(async move {
            let (mut last_epoch, mut was_connected, mut was_degraded) = {
                let info = status.borrow_and_update();
                (info.epoch, info.is_connected(), info.degraded)
            };

            while status.changed().await.is_ok() {
                let info = status.borrow_and_update().clone();
                let Some(registry) = registry.upgrade() else {
                    break;
                };

                if was_connected && !info.is_connected() {
                    tracing::info!("Stream connection lost, sessions marked unsynced");
                    for handle in registry.handles().await {
                        handle.transport_lost();
                    }
                }

                if info.degraded && !was_degraded {
                    tracing::error!(
                        retry_count = info.retry_count,
                        "Stream connection degraded, camera views may be stale"
                    );
                }

                if info.is_connected() && info.epoch > last_epoch {
                    if last_epoch > 0 {
                        let handles = registry.handles().await;
                        tracing::info!(
                            epoch = info.epoch,
                            sessions = handles.len(),
                            "Stream reconnected, reconciling sessions"
                        );
                        for handle in handles {
                            service.request(handle.snapshot_sink()).await;
                        }
                    }
                    last_epoch = info.epoch;
                }

                was_connected = info.is_connected();
                was_degraded = info.degraded;
            }

            tracing::debug!("Reconnect watcher stopped");
        })
    }
}
