//! ZooKeeper backend
//!
//! Maps `zookeeper-client` sessions onto the coordination traits.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tracing::{debug, warn};
use zookeeper_client as zk;

use super::{ChildWatch, CoordinationBackend, CoordinationSession, NodeMode, SessionState, WatchEvent};
use crate::error::{Result, StaveError};

/// Backend connecting to a ZooKeeper ensemble
pub struct ZooKeeperBackend {
    cluster: String,
    session_timeout: Duration,
}

impl ZooKeeperBackend {
    /// Create a backend for `servers` (host:port list)
    pub fn new(servers: &[String], session_timeout: Duration) -> Self {
        Self {
            cluster: servers.join(","),
            session_timeout,
        }
    }
}

#[async_trait]
impl CoordinationBackend for ZooKeeperBackend {
    async fn connect(&self) -> Result<Arc<dyn CoordinationSession>> {
        let client = zk::Client::connector()
            .session_timeout(self.session_timeout)
            .connect(&self.cluster)
            .await
            .map_err(|e| StaveError::ConnectionFailed {
                endpoint: self.cluster.clone(),
                reason: e.to_string(),
            })?;

        let id = client.session_id().0 as u64;
        let (events_tx, events) = watch::channel(SessionState::Connected);
        let mut states = client.state_watcher();
        tokio::spawn(async move {
            loop {
                let state = match states.changed().await {
                    zk::SessionState::SyncConnected | zk::SessionState::ConnectedReadOnly => {
                        SessionState::Connected
                    }
                    zk::SessionState::Disconnected => SessionState::Disconnected,
                    zk::SessionState::Closed => SessionState::Closed,
                    _ => SessionState::Expired,
                };
                let _ = events_tx.send(state);
                if matches!(state, SessionState::Expired | SessionState::Closed) {
                    debug!("ZooKeeper session {:#x} ended: {:?}", id, state);
                    return;
                }
            }
        });

        Ok(Arc::new(ZooKeeperSession {
            id,
            client: Mutex::new(Some(client)),
            events,
        }))
    }

    fn describe(&self) -> String {
        format!("zookeeper://{}", self.cluster)
    }
}

struct ZooKeeperSession {
    id: u64,
    client: Mutex<Option<zk::Client>>,
    events: watch::Receiver<SessionState>,
}

impl ZooKeeperSession {
    fn client(&self) -> Result<zk::Client> {
        self.client
            .lock()
            .clone()
            .ok_or(StaveError::SessionExpired {
                session_id: self.id,
            })
    }

    fn map_err(&self, path: &str, err: zk::Error) -> StaveError {
        match err {
            zk::Error::NoNode => StaveError::NoNode { path: path.into() },
            zk::Error::NodeExists => StaveError::NodeExists { path: path.into() },
            zk::Error::NotEmpty => StaveError::NotEmpty { path: path.into() },
            zk::Error::SessionExpired | zk::Error::ClientClosed => StaveError::SessionExpired {
                session_id: self.id,
            },
            zk::Error::ConnectionLoss | zk::Error::OperationTimeout => {
                StaveError::CoordinationDisconnected {
                    reason: err.to_string(),
                }
            }
            zk::Error::BadArguments(_) => StaveError::InvalidPath { path: path.into() },
            other => StaveError::Internal {
                message: format!("zookeeper {}: {}", path, other),
            },
        }
    }
}

#[async_trait]
impl CoordinationSession for ZooKeeperSession {
    fn id(&self) -> u64 {
        self.id
    }

    fn state_events(&self) -> watch::Receiver<SessionState> {
        self.events.clone()
    }

    async fn create(&self, path: &str, data: &[u8], mode: NodeMode) -> Result<()> {
        let client = self.client()?;
        let mode = match mode {
            NodeMode::Persistent => zk::CreateMode::Persistent,
            NodeMode::Ephemeral => zk::CreateMode::Ephemeral,
        };
        client
            .create(path, data, &mode.with_acls(zk::Acls::anyone_all()))
            .await
            .map(|_| ())
            .map_err(|e| self.map_err(path, e))
    }

    async fn set_data(&self, path: &str, data: &[u8]) -> Result<()> {
        let client = self.client()?;
        client
            .set_data(path, data, None)
            .await
            .map(|_| ())
            .map_err(|e| self.map_err(path, e))
    }

    async fn get_data(&self, path: &str) -> Result<Vec<u8>> {
        let client = self.client()?;
        client
            .get_data(path)
            .await
            .map(|(data, _)| data)
            .map_err(|e| self.map_err(path, e))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let client = self.client()?;
        client
            .delete(path, None)
            .await
            .map_err(|e| self.map_err(path, e))
    }

    async fn children_watched(&self, path: &str) -> Result<(Vec<String>, ChildWatch)> {
        let client = self.client()?;
        let (children, watcher) = client
            .get_children_watched(path)
            .await
            .map_err(|e| self.map_err(path, e))?;

        let (mut tx, rx) = oneshot::channel();
        let path = path.to_string();
        tokio::spawn(async move {
            tokio::select! {
                event = watcher.changed() => match child_event(event.event_type) {
                    Some(change) => {
                        let _ = tx.send(change);
                    }
                    None => debug!("Child watch on {} ended with {:?}", path, event.event_type),
                },
                _ = tx.closed() => {}
            }
        });

        Ok((children, rx))
    }

    async fn close(&self) {
        if self.client.lock().take().is_none() {
            warn!("ZooKeeper session {:#x} already closed", self.id);
        }
    }
}

/// Map a child watch firing to a re-fetch. Deletion of the watched node
/// counts as a change so the path gets recreated; session events do not.
fn child_event(event_type: zk::EventType) -> Option<WatchEvent> {
    match event_type {
        zk::EventType::NodeChildrenChanged | zk::EventType::NodeDeleted => {
            Some(WatchEvent::ChildrenChanged)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_event_mapping() {
        assert_eq!(
            child_event(zk::EventType::NodeChildrenChanged),
            Some(WatchEvent::ChildrenChanged)
        );
        assert_eq!(
            child_event(zk::EventType::NodeDeleted),
            Some(WatchEvent::ChildrenChanged)
        );
        assert_eq!(child_event(zk::EventType::Session), None);
    }
}
