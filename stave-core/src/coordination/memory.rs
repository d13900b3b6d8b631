//! In-process coordination service
//!
//! A small ZooKeeper-like tree with sessions, ephemeral nodes and one-shot
//! child watches. Used for standalone nodes and for tests, where
//! [`MemoryCoordinator::restart`] simulates a service restart.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info};

use super::{
    parent_path, validate_path, ChildWatch, CoordinationBackend, CoordinationSession, NodeMode,
    SessionState, WatchEvent,
};
use crate::error::{Result, StaveError};

struct ZNode {
    data: Vec<u8>,
    owner: Option<u64>,
}

struct Service {
    running: bool,
    next_session: u64,
    nodes: BTreeMap<String, ZNode>,
    sessions: HashMap<u64, watch::Sender<SessionState>>,
    child_watches: HashMap<String, Vec<(u64, oneshot::Sender<WatchEvent>)>>,
}

impl Service {
    fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            "/".to_string(),
            ZNode {
                data: Vec::new(),
                owner: None,
            },
        );
        Self {
            running: true,
            next_session: 1,
            nodes,
            sessions: HashMap::new(),
            child_watches: HashMap::new(),
        }
    }

    fn check(&self, session_id: u64) -> Result<()> {
        if !self.running {
            return Err(StaveError::CoordinationDisconnected {
                reason: "service unavailable".into(),
            });
        }
        if !self.sessions.contains_key(&session_id) {
            return Err(StaveError::SessionExpired { session_id });
        }
        Ok(())
    }

    fn children(&self, path: &str) -> Vec<String> {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{}/", path)
        };
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter_map(|(key, _)| {
                let rest = &key[prefix.len()..];
                (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_string())
            })
            .collect()
    }

    fn fire_children_changed(&mut self, path: &str) {
        if let Some(watches) = self.child_watches.remove(path) {
            for (_, tx) in watches {
                let _ = tx.send(WatchEvent::ChildrenChanged);
            }
        }
    }

    fn remove_node(&mut self, path: &str) {
        self.nodes.remove(path);
        // A deleted node's own child watches fire too
        self.fire_children_changed(path);
        if let Some(parent) = parent_path(path) {
            let parent = parent.to_string();
            self.fire_children_changed(&parent);
        }
    }

    /// End a session: drop its ephemerals and its pending watches
    fn end_session(&mut self, session_id: u64, state: SessionState) {
        if let Some(tx) = self.sessions.remove(&session_id) {
            let _ = tx.send(state);
        }

        let owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.owner == Some(session_id))
            .map(|(path, _)| path.clone())
            .collect();
        for path in owned {
            self.remove_node(&path);
        }

        for watches in self.child_watches.values_mut() {
            watches.retain(|(owner, _)| *owner != session_id);
        }
        self.child_watches.retain(|_, watches| !watches.is_empty());
    }
}

/// In-process coordination service
#[derive(Clone)]
pub struct MemoryCoordinator {
    inner: Arc<Mutex<Service>>,
}

impl MemoryCoordinator {
    /// Create a running service with an empty tree
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Service::new())),
        }
    }

    /// Take the service down; sessions see `Disconnected`
    pub fn stop(&self) {
        let mut svc = self.inner.lock();
        svc.running = false;
        for tx in svc.sessions.values() {
            let _ = tx.send(SessionState::Disconnected);
        }
        info!("Memory coordinator stopped");
    }

    /// Bring the service back; surviving sessions see `Connected`
    pub fn start(&self) {
        let mut svc = self.inner.lock();
        svc.running = true;
        for tx in svc.sessions.values() {
            let _ = tx.send(SessionState::Connected);
        }
        info!("Memory coordinator started");
    }

    /// Expire every live session
    pub fn expire_sessions(&self) {
        let mut svc = self.inner.lock();
        let ids: Vec<u64> = svc.sessions.keys().copied().collect();
        for id in ids {
            svc.end_session(id, SessionState::Expired);
        }
    }

    /// Stop, expire all sessions, and start again
    pub fn restart(&self) {
        self.stop();
        self.expire_sessions();
        self.start();
    }

    /// Number of registered child watches on `path` whose receiver is still alive
    pub fn pending_watches(&self, path: &str) -> usize {
        let svc = self.inner.lock();
        svc.child_watches
            .get(path)
            .map(|watches| watches.iter().filter(|(_, tx)| !tx.is_closed()).count())
            .unwrap_or(0)
    }

    /// Children of `path`, read without a session
    pub fn children(&self, path: &str) -> Vec<String> {
        self.inner.lock().children(path)
    }

    /// Data at `path`, read without a session
    pub fn data(&self, path: &str) -> Option<Vec<u8>> {
        self.inner.lock().nodes.get(path).map(|node| node.data.clone())
    }

    /// Number of live sessions
    pub fn session_count(&self) -> usize {
        self.inner.lock().sessions.len()
    }
}

impl Default for MemoryCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordinationBackend for MemoryCoordinator {
    async fn connect(&self) -> Result<Arc<dyn CoordinationSession>> {
        let mut svc = self.inner.lock();
        if !svc.running {
            return Err(StaveError::ConnectionFailed {
                endpoint: self.describe(),
                reason: "service unavailable".into(),
            });
        }

        let id = svc.next_session;
        svc.next_session += 1;
        let (tx, rx) = watch::channel(SessionState::Connected);
        svc.sessions.insert(id, tx);
        debug!("Opened memory session {}", id);

        Ok(Arc::new(MemorySession {
            id,
            service: self.inner.clone(),
            events: rx,
        }))
    }

    fn describe(&self) -> String {
        "memory".into()
    }
}

struct MemorySession {
    id: u64,
    service: Arc<Mutex<Service>>,
    events: watch::Receiver<SessionState>,
}

#[async_trait]
impl CoordinationSession for MemorySession {
    fn id(&self) -> u64 {
        self.id
    }

    fn state_events(&self) -> watch::Receiver<SessionState> {
        self.events.clone()
    }

    async fn create(&self, path: &str, data: &[u8], mode: NodeMode) -> Result<()> {
        validate_path(path)?;
        let mut svc = self.service.lock();
        svc.check(self.id)?;

        if svc.nodes.contains_key(path) {
            return Err(StaveError::NodeExists { path: path.into() });
        }
        let parent = parent_path(path)
            .ok_or_else(|| StaveError::NodeExists { path: path.into() })?
            .to_string();
        if !svc.nodes.contains_key(&parent) {
            return Err(StaveError::NoNode { path: parent });
        }

        let owner = match mode {
            NodeMode::Persistent => None,
            NodeMode::Ephemeral => Some(self.id),
        };
        svc.nodes.insert(
            path.to_string(),
            ZNode {
                data: data.to_vec(),
                owner,
            },
        );
        svc.fire_children_changed(&parent);
        Ok(())
    }

    async fn set_data(&self, path: &str, data: &[u8]) -> Result<()> {
        let mut svc = self.service.lock();
        svc.check(self.id)?;
        let node = svc
            .nodes
            .get_mut(path)
            .ok_or_else(|| StaveError::NoNode { path: path.into() })?;
        node.data = data.to_vec();
        Ok(())
    }

    async fn get_data(&self, path: &str) -> Result<Vec<u8>> {
        let svc = self.service.lock();
        svc.check(self.id)?;
        svc.nodes
            .get(path)
            .map(|node| node.data.clone())
            .ok_or_else(|| StaveError::NoNode { path: path.into() })
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let mut svc = self.service.lock();
        svc.check(self.id)?;
        if path == "/" || !svc.nodes.contains_key(path) {
            return Err(StaveError::NoNode { path: path.into() });
        }
        if !svc.children(path).is_empty() {
            return Err(StaveError::NotEmpty { path: path.into() });
        }
        svc.remove_node(path);
        Ok(())
    }

    async fn children_watched(&self, path: &str) -> Result<(Vec<String>, ChildWatch)> {
        let mut svc = self.service.lock();
        svc.check(self.id)?;
        if !svc.nodes.contains_key(path) {
            return Err(StaveError::NoNode { path: path.into() });
        }

        let children = svc.children(path);
        let (tx, rx) = oneshot::channel();
        let watches = svc.child_watches.entry(path.to_string()).or_default();
        watches.retain(|(_, tx)| !tx.is_closed());
        watches.push((self.id, tx));
        Ok((children, rx))
    }

    async fn close(&self) {
        let mut svc = self.service.lock();
        svc.end_session(self.id, SessionState::Closed);
        debug!("Closed memory session {}", self.id);
    }
}
