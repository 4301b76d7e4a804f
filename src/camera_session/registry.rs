//! Session registry: one live session per camera

use super::{spawn_session, SessionDeps, SessionHandle};
use crate::models::CameraId;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

pub struct SessionRegistry {
    deps: SessionDeps,
    sessions: RwLock<HashMap<CameraId, SessionHandle>>,
}

impl SessionRegistry {
    pub fn new(deps: SessionDeps) -> Arc<Self> {
        Arc::new(Self {
            deps,
            sessions: RwLock::new(HashMap::new()),
        })
    }

    /// Return the live session for a camera, opening one if needed
    pub async fn open(&self, camera_id: CameraId) -> SessionHandle {
        let mut sessions = self.sessions.write().await;

        if let Some(handle) = sessions.get(&camera_id) {
            if !handle.is_closed() {
                return handle.clone();
            }
        }

        let handle = spawn_session(camera_id, &self.deps).await;
        sessions.insert(camera_id, handle.clone());
        tracing::debug!(camera_id = %camera_id, open = sessions.len(), "Session registered");
        handle
    }

    pub async fn get(&self, camera_id: CameraId) -> Option<SessionHandle> {
        self.sessions
            .read()
            .await
            .get(&camera_id)
            .filter(|h| !h.is_closed())
            .cloned()
    }

    /// Stop viewing a camera. The remote recording is left alone.
    pub async fn close(&self, camera_id: CameraId) -> bool {
        match self.sessions.write().await.remove(&camera_id) {
            Some(handle) => {
                handle.shutdown();
                tracing::info!(camera_id = %camera_id, "Viewer closed, recording left untouched");
                true
            }
            None => false,
        }
    }

    pub async fn handles(&self) -> Vec<SessionHandle> {
        self.sessions
            .read()
            .await
            .values()
            .filter(|h| !h.is_closed())
            .cloned()
            .collect()
    }

    pub async fn close_all(&self) {
        let handles: Vec<_> = self.sessions.write().await.drain().collect();
        for (_, handle) in handles {
            handle.shutdown();
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}
