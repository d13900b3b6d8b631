//! Session-resilient coordination watcher
//!
//! Owns one coordination session at a time and hides its loss from callers.
//! A single driver task runs the reconnect state machine
//! (CONNECTED → DISCONNECTED → RECONNECTING → CONNECTED); subscriptions
//! react to a new session generation only by re-fetching their child list,
//! which registers exactly one new one-shot watch per path.

use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::subscription::{ChildUpdates, Disconnections, WatchSubscription};
use super::{
    ensure_path, join_path, parent_path, validate_path, ChildWatch, CoordinationBackend,
    CoordinationSession, NodeMode, SessionState, WatchEvent,
};
use crate::error::{Result, StaveError};
use crate::metrics::standard;

/// Configuration for the coordination watcher
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Every path is relative to this namespace
    pub namespace: String,
    /// How long an operation waits for a usable session
    pub operation_timeout: Duration,
    /// Linear backoff step between reconnect attempts
    pub reconnect_backoff: Duration,
    /// Give up after this many failed attempts (0 = never)
    pub max_reconnect_attempts: u32,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            namespace: crate::DEFAULT_NAMESPACE.into(),
            operation_timeout: Duration::from_secs(5),
            reconnect_backoff: Duration::from_millis(500),
            max_reconnect_attempts: 0,
        }
    }
}

/// Connection state of the watcher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// A usable session exists; the generation increases with every new session
    Connected { generation: u64 },
    /// Connection lost, session may resume
    Disconnected,
    /// Session lost, establishing a new one
    Reconnecting,
    /// Closed by its owner
    Closed,
    /// Reconnect attempts exhausted
    Failed,
}

impl ConnectionState {
    fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Failed)
    }
}

struct Inner {
    backend: Arc<dyn CoordinationBackend>,
    config: WatcherConfig,
    root: String,
    session: RwLock<Option<Arc<dyn CoordinationSession>>>,
    state: watch::Sender<ConnectionState>,
    subscriptions: Mutex<HashMap<String, Arc<WatchSubscription>>>,
    ephemerals: Mutex<BTreeMap<String, Vec<u8>>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Session-resilient watch and ephemeral-node manager
#[derive(Clone)]
pub struct CoordinationWatcher {
    inner: Arc<Inner>,
}

impl CoordinationWatcher {
    /// Open a session and start the reconnect driver
    pub async fn connect(
        backend: Arc<dyn CoordinationBackend>,
        config: WatcherConfig,
    ) -> Result<Self> {
        let root = normalize_namespace(&config.namespace)?;
        let session = backend.connect().await?;
        ensure_path(session.as_ref(), &root).await?;

        info!(
            "Connected to coordination service {} (session {}, namespace {})",
            backend.describe(),
            session.id(),
            root
        );

        let (state, _) = watch::channel(ConnectionState::Connected { generation: 1 });
        let inner = Arc::new(Inner {
            backend,
            config,
            root,
            session: RwLock::new(Some(session.clone())),
            state,
            subscriptions: Mutex::new(HashMap::new()),
            ephemerals: Mutex::new(BTreeMap::new()),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        });

        let driver = tokio::spawn(drive(inner.clone(), session, 1));
        inner.track(driver);

        Ok(Self { inner })
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Observe connection state changes
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Number of live subscriptions
    pub fn live_subscriptions(&self) -> usize {
        self.inner.subscriptions.lock().len()
    }

    /// Absolute path of `path` inside the namespace
    pub fn full_path(&self, path: &str) -> Result<String> {
        let full = if path == "/" || path.is_empty() {
            self.inner.root.clone()
        } else {
            join_path(&self.inner.root, path)
        };
        validate_path(&full)?;
        Ok(full)
    }

    /// Watch the child list of `path`.
    ///
    /// The first element of `updates` is the current child list. Repeated
    /// calls for the same path share one subscription.
    pub fn watch_children(&self, path: &str) -> Result<(ChildUpdates, Disconnections)> {
        let full = self.full_path(path)?;
        if self.inner.cancel.is_cancelled() || self.state().is_terminal() {
            return Err(StaveError::WatcherClosed);
        }

        let sub = {
            let mut subs = self.inner.subscriptions.lock();
            match subs.get(&full) {
                Some(sub) if !sub.is_closed() => sub.clone(),
                _ => {
                    let sub = Arc::new(WatchSubscription::new(
                        full.clone(),
                        self.inner.cancel.child_token(),
                    ));
                    subs.insert(full.clone(), sub.clone());
                    standard::LIVE_SUBSCRIPTIONS.inc();

                    let task = tokio::spawn(run_subscription(self.inner.clone(), sub.clone()));
                    self.inner.track(task);
                    debug!("Watching children of {}", full);
                    sub
                }
            }
        };

        sub.handle()
            .ok_or(StaveError::WatchCancelled { path: full })
    }

    /// Cancel the subscription on `path`, closing its streams.
    ///
    /// Returns false if there was no live subscription.
    pub fn remove_watch(&self, path: &str) -> Result<bool> {
        let full = self.full_path(path)?;
        let sub = self.inner.subscriptions.lock().remove(&full);
        Ok(match sub {
            Some(sub) => {
                let closed = sub.close();
                if closed {
                    standard::LIVE_SUBSCRIPTIONS.dec();
                    debug!("Removed watch on {}", full);
                }
                closed
            }
            None => false,
        })
    }

    /// Create an ephemeral node, re-created after every session loss
    pub async fn create_ephemeral(&self, path: &str, value: &[u8]) -> Result<()> {
        let full = self.full_path(path)?;
        self.inner
            .ephemerals
            .lock()
            .insert(full.clone(), value.to_vec());

        let data = value.to_vec();
        self.retrying(move |session| {
            let full = full.clone();
            let data = data.clone();
            async move { put_ephemeral(session.as_ref(), &full, &data).await }
        })
        .await
    }

    /// Replace an ephemeral node so that watchers of its parent see the change
    pub async fn set_ephemeral(&self, path: &str, value: &[u8]) -> Result<()> {
        let full = self.full_path(path)?;
        self.inner
            .ephemerals
            .lock()
            .insert(full.clone(), value.to_vec());

        let data = value.to_vec();
        self.retrying(move |session| {
            let full = full.clone();
            let data = data.clone();
            async move {
                match session.delete(&full).await {
                    Ok(()) | Err(StaveError::NoNode { .. }) => {}
                    Err(e) => return Err(e),
                }
                put_ephemeral(session.as_ref(), &full, &data).await
            }
        })
        .await
    }

    /// Delete an ephemeral node and stop re-creating it
    pub async fn remove_ephemeral(&self, path: &str) -> Result<()> {
        let full = self.full_path(path)?;
        self.inner.ephemerals.lock().remove(&full);

        self.retrying(move |session| {
            let full = full.clone();
            async move {
                match session.delete(&full).await {
                    Ok(()) | Err(StaveError::NoNode { .. }) => Ok(()),
                    Err(e) => Err(e),
                }
            }
        })
        .await
    }

    /// Read a node's data
    pub async fn get_data(&self, path: &str) -> Result<Vec<u8>> {
        let full = self.full_path(path)?;
        self.retrying(move |session| {
            let full = full.clone();
            async move { session.get_data(&full).await }
        })
        .await
    }

    /// Tear down all subscriptions, the driver and the session
    pub async fn close(&self) {
        if self.inner.cancel.is_cancelled() {
            return;
        }
        self.inner.cancel.cancel();
        self.inner.set_state(ConnectionState::Closed);
        self.inner.close_subscriptions();

        let tasks = std::mem::take(&mut *self.inner.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }

        let session = self.inner.session.write().take();
        if let Some(session) = session {
            session.close().await;
        }
        info!("Coordination watcher closed");
    }

    /// Run `op` against a live session, retrying transient failures
    /// until the operation timeout.
    async fn retrying<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn(Arc<dyn CoordinationSession>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let inner = &self.inner;
        let attempt = async {
            let mut state = inner.state.subscribe();
            loop {
                let (_, session) = inner.wait_session(&mut state, 0).await?;
                match op(session).await {
                    Err(e) if e.is_retryable() => {
                        debug!("Retrying coordination operation: {}", e);
                        tokio::time::sleep(inner.retry_delay()).await;
                    }
                    other => return other,
                }
            }
        };

        match tokio::time::timeout(inner.config.operation_timeout, attempt).await {
            Ok(result) => result,
            Err(_) => Err(StaveError::CoordinationDisconnected {
                reason: format!(
                    "no usable session within {:?}",
                    inner.config.operation_timeout
                ),
            }),
        }
    }
}

impl Inner {
    fn track(&self, task: JoinHandle<()>) {
        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    /// Move to `next` unless closed or failed; returns the previous state
    fn set_state(&self, next: ConnectionState) -> ConnectionState {
        let mut previous = next;
        self.state.send_if_modified(|current| {
            previous = *current;
            if current.is_terminal() || *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        previous
    }

    fn retry_delay(&self) -> Duration {
        (self.config.reconnect_backoff / 5).max(Duration::from_millis(10))
    }

    fn notify_disconnected(&self) {
        for sub in self.subscriptions.lock().values() {
            sub.notify_disconnected();
        }
    }

    fn close_subscriptions(&self) {
        let subs: Vec<_> = self.subscriptions.lock().drain().map(|(_, s)| s).collect();
        for sub in subs {
            if sub.close() {
                standard::LIVE_SUBSCRIPTIONS.dec();
            }
        }
    }

    /// Drop a subscription that ended on its own
    fn retire(&self, sub: &Arc<WatchSubscription>) {
        {
            let mut subs = self.subscriptions.lock();
            if subs
                .get(sub.path())
                .is_some_and(|current| Arc::ptr_eq(current, sub))
            {
                subs.remove(sub.path());
            }
        }
        if sub.close() {
            standard::LIVE_SUBSCRIPTIONS.dec();
        }
    }

    /// Wait for a connected session of at least `min_generation`
    async fn wait_session(
        &self,
        state: &mut watch::Receiver<ConnectionState>,
        min_generation: u64,
    ) -> Result<(u64, Arc<dyn CoordinationSession>)> {
        loop {
            let current = *state.borrow_and_update();
            match current {
                ConnectionState::Connected { generation } if generation >= min_generation => {
                    if let Some(session) = self.session.read().clone() {
                        return Ok((generation, session));
                    }
                }
                ConnectionState::Closed => return Err(StaveError::WatcherClosed),
                ConnectionState::Failed => {
                    return Err(StaveError::RetriesExhausted {
                        attempts: self.config.max_reconnect_attempts,
                    })
                }
                _ => {}
            }
            if state.changed().await.is_err() {
                return Err(StaveError::WatcherClosed);
            }
        }
    }

    /// Open a new session, with linear backoff between attempts
    async fn reconnect(&self) -> Option<Arc<dyn CoordinationSession>> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let result = match self.backend.connect().await {
                Ok(session) => ensure_path(session.as_ref(), &self.root)
                    .await
                    .map(|_| session),
                Err(e) => Err(e),
            };

            match result {
                Ok(session) => {
                    info!(
                        "Re-established coordination session {} after {} attempts",
                        session.id(),
                        attempt
                    );
                    return Some(session);
                }
                Err(e) => {
                    let max = self.config.max_reconnect_attempts;
                    if max > 0 && attempt >= max {
                        error!("Giving up on coordination service after {} attempts: {}", attempt, e);
                        return None;
                    }
                    let delay = self.config.reconnect_backoff * attempt.min(10);
                    warn!("Reconnect attempt {} failed: {} (retrying in {:?})", attempt, e, delay);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    fn remembered_ephemerals(&self) -> Vec<(String, Vec<u8>)> {
        self.ephemerals
            .lock()
            .iter()
            .map(|(path, data)| (path.clone(), data.clone()))
            .collect()
    }

    async fn restore_ephemerals(&self, session: &dyn CoordinationSession) {
        for (path, data) in self.remembered_ephemerals() {
            match put_ephemeral(session, &path, &data).await {
                Ok(()) => debug!("Restored ephemeral {}", path),
                Err(e) => warn!("Failed to restore ephemeral {}: {}", path, e),
            }
        }
    }

    /// Re-apply ephemerals written while a resumed session was unreachable.
    ///
    /// Stale values are replaced by delete + create so watchers of the
    /// parent see the change.
    async fn reconcile_ephemerals(&self, session: &dyn CoordinationSession) {
        for (path, data) in self.remembered_ephemerals() {
            let result = match session.get_data(&path).await {
                Ok(current) if current == data => continue,
                Ok(_) => match session.delete(&path).await {
                    Ok(()) | Err(StaveError::NoNode { .. }) => {
                        put_ephemeral(session, &path, &data).await
                    }
                    Err(e) => Err(e),
                },
                Err(StaveError::NoNode { .. }) => put_ephemeral(session, &path, &data).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => debug!("Re-applied ephemeral {}", path),
                Err(e) => warn!("Failed to re-apply ephemeral {}: {}", path, e),
            }
        }
    }
}

/// Reconnect driver. Owns the connection state machine.
async fn drive(inner: Arc<Inner>, mut session: Arc<dyn CoordinationSession>, mut generation: u64) {
    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => return,
            _ = follow_session(&inner, session.as_ref(), generation) => {}
        }

        // The session is gone for good
        inner.session.write().take();
        let previous = inner.set_state(ConnectionState::Reconnecting);
        if matches!(previous, ConnectionState::Connected { .. }) {
            inner.notify_disconnected();
        }
        warn!("Coordination session {} lost, reconnecting", session.id());

        let next = tokio::select! {
            _ = inner.cancel.cancelled() => return,
            next = inner.reconnect() => next,
        };

        match next {
            Some(next) => {
                generation += 1;
                inner.restore_ephemerals(next.as_ref()).await;
                *inner.session.write() = Some(next.clone());
                inner.set_state(ConnectionState::Connected { generation });
                standard::RECONNECTS.inc();
                session = next;
            }
            None => {
                inner.set_state(ConnectionState::Failed);
                inner.close_subscriptions();
                return;
            }
        }
    }
}

/// Track one session's events until it expires or closes
async fn follow_session(inner: &Inner, session: &dyn CoordinationSession, generation: u64) {
    let mut events = session.state_events();
    loop {
        let event = *events.borrow_and_update();
        match event {
            SessionState::Connected => {
                let resuming = *inner.state.borrow() == ConnectionState::Disconnected;
                if resuming {
                    inner.reconcile_ephemerals(session).await;
                }
                inner.set_state(ConnectionState::Connected { generation });
                if resuming {
                    info!("Coordination session {} resumed", session.id());
                }
            }
            SessionState::Disconnected => {
                let previous = inner.set_state(ConnectionState::Disconnected);
                if matches!(previous, ConnectionState::Connected { .. }) {
                    warn!("Disconnected from coordination service");
                    inner.notify_disconnected();
                }
            }
            SessionState::Expired | SessionState::Closed => return,
        }
        if events.changed().await.is_err() {
            return;
        }
    }
}

/// Per-path subscription task. Delivers a full snapshot after every change.
async fn run_subscription(inner: Arc<Inner>, sub: Arc<WatchSubscription>) {
    let cancel = sub.cancel_token().clone();
    let mut state = inner.state.subscribe();
    let mut min_generation = 0;
    let mut changed = false;

    loop {
        let waited = tokio::select! {
            _ = cancel.cancelled() => break,
            waited = inner.wait_session(&mut state, min_generation) => waited,
        };
        let (generation, session) = match waited {
            Ok(found) => found,
            Err(e) => {
                debug!("Subscription on {} ending: {}", sub.path(), e);
                break;
            }
        };

        let fetched = tokio::select! {
            _ = cancel.cancelled() => break,
            fetched = fetch_children(session.as_ref(), sub.path()) => fetched,
        };

        match fetched {
            Ok((children, child_watch)) => {
                sub.deliver(children.into_iter().collect(), changed);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = child_watch => match event {
                        Ok(WatchEvent::ChildrenChanged) => {
                            min_generation = generation;
                            changed = true;
                        }
                        Err(_) => {
                            debug!("Watch on {} lost with session generation {}", sub.path(), generation);
                            min_generation = generation + 1;
                            changed = false;
                        }
                    },
                }
            }
            Err(e) if e.is_session_loss() => {
                min_generation = generation + 1;
                changed = false;
            }
            Err(e) if e.is_retryable() => {
                debug!("Fetching children of {} failed: {}", sub.path(), e);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(inner.retry_delay()) => {}
                }
            }
            Err(e) => {
                error!("Watch on {} failed permanently: {}", sub.path(), e);
                break;
            }
        }
    }

    inner.retire(&sub);
}

async fn fetch_children(
    session: &dyn CoordinationSession,
    path: &str,
) -> Result<(Vec<String>, ChildWatch)> {
    match session.children_watched(path).await {
        Err(StaveError::NoNode { .. }) => {
            ensure_path(session, path).await?;
            session.children_watched(path).await
        }
        other => other,
    }
}

async fn put_ephemeral(session: &dyn CoordinationSession, path: &str, data: &[u8]) -> Result<()> {
    match session.create(path, data, NodeMode::Ephemeral).await {
        Ok(()) => Ok(()),
        Err(StaveError::NoNode { .. }) => {
            if let Some(parent) = parent_path(path) {
                ensure_path(session, parent).await?;
            }
            session.create(path, data, NodeMode::Ephemeral).await
        }
        Err(StaveError::NodeExists { .. }) => session.set_data(path, data).await,
        Err(e) => Err(e),
    }
}

fn normalize_namespace(namespace: &str) -> Result<String> {
    let trimmed = namespace.trim_matches('/');
    let root = if trimmed.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", trimmed)
    };
    validate_path(&root)?;
    Ok(root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::MemoryCoordinator;

    fn config() -> WatcherConfig {
        WatcherConfig {
            namespace: "test".into(),
            operation_timeout: Duration::from_secs(2),
            reconnect_backoff: Duration::from_millis(20),
            max_reconnect_attempts: 0,
        }
    }

    #[test]
    fn test_normalize_namespace() {
        assert_eq!(normalize_namespace("stave").unwrap(), "/stave");
        assert_eq!(normalize_namespace("/a/b/").unwrap(), "/a/b");
        assert_eq!(normalize_namespace("").unwrap(), "/");
    }

    #[tokio::test]
    async fn test_same_path_shares_subscription() {
        let service = MemoryCoordinator::new();
        let watcher = CoordinationWatcher::connect(Arc::new(service.clone()), config())
            .await
            .unwrap();

        let (mut a, _) = watcher.watch_children("/foo").unwrap();
        let (mut b, _) = watcher.watch_children("/foo").unwrap();
        assert_eq!(watcher.live_subscriptions(), 1);

        assert_eq!(a.recv().await, Some(Default::default()));
        assert_eq!(b.recv().await, Some(Default::default()));
        assert_eq!(service.pending_watches("/test/foo"), 1);

        watcher.close().await;
    }

    #[tokio::test]
    async fn test_ephemeral_is_namespaced() {
        let service = MemoryCoordinator::new();
        let watcher = CoordinationWatcher::connect(Arc::new(service.clone()), config())
            .await
            .unwrap();

        watcher.create_ephemeral("/db/node-1", b"v1").await.unwrap();
        assert_eq!(service.data("/test/db/node-1"), Some(b"v1".to_vec()));
        assert_eq!(watcher.get_data("/db/node-1").await.unwrap(), b"v1".to_vec());

        watcher.remove_ephemeral("/db/node-1").await.unwrap();
        assert_eq!(service.data("/test/db/node-1"), None);
        watcher.remove_ephemeral("/db/node-1").await.unwrap();

        watcher.close().await;
    }

    #[tokio::test]
    async fn test_operations_after_close() {
        let service = MemoryCoordinator::new();
        let watcher = CoordinationWatcher::connect(Arc::new(service.clone()), config())
            .await
            .unwrap();
        watcher.close().await;

        assert_eq!(watcher.state(), ConnectionState::Closed);
        assert!(matches!(
            watcher.watch_children("/foo"),
            Err(StaveError::WatcherClosed)
        ));
        assert!(matches!(
            watcher.get_data("/").await,
            Err(StaveError::WatcherClosed)
        ));
        assert!(!watcher.remove_watch("/foo").unwrap());
        assert_eq!(service.session_count(), 0);
    }
}
