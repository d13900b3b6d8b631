//! Watch subscriptions
//!
//! One [`WatchSubscription`] exists per watched path. Callers hold
//! [`ChildUpdates`] and [`Disconnections`] handles onto it; closing the
//! subscription closes every handle exactly once.

use parking_lot::Mutex;
use std::collections::BTreeSet;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::metrics::standard;

/// Full, ordered child list of a watched path
pub type ChildSnapshot = BTreeSet<String>;

const SNAPSHOT_CAPACITY: usize = 64;
const DISCONNECT_CAPACITY: usize = 16;

struct SubscriptionState {
    last: Option<ChildSnapshot>,
    updates: Option<broadcast::Sender<ChildSnapshot>>,
    disconnected: Option<broadcast::Sender<()>>,
    handles: usize,
}

/// The single live subscription for a path
pub(crate) struct WatchSubscription {
    path: String,
    state: Mutex<SubscriptionState>,
    cancel: CancellationToken,
}

impl WatchSubscription {
    pub(crate) fn new(path: String, cancel: CancellationToken) -> Self {
        let (updates, _) = broadcast::channel(SNAPSHOT_CAPACITY);
        let (disconnected, _) = broadcast::channel(DISCONNECT_CAPACITY);
        Self {
            path,
            state: Mutex::new(SubscriptionState {
                last: None,
                updates: Some(updates),
                disconnected: Some(disconnected),
                handles: 0,
            }),
            cancel,
        }
    }

    pub(crate) fn path(&self) -> &str {
        &self.path
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// New handles onto this subscription; `None` once closed.
    ///
    /// A handle taken after the first delivery starts with the latest snapshot.
    pub(crate) fn handle(&self) -> Option<(ChildUpdates, Disconnections)> {
        let mut state = self.state.lock();
        let updates = state.updates.as_ref()?.subscribe();
        let disconnected = state.disconnected.as_ref()?.subscribe();
        state.handles += 1;
        Some((
            ChildUpdates {
                initial: state.last.clone(),
                rx: updates,
            },
            Disconnections { rx: disconnected },
        ))
    }

    /// Deliver a snapshot.
    ///
    /// Unless the service reported a change, a snapshot equal to the last
    /// one delivered is dropped.
    pub(crate) fn deliver(&self, snapshot: ChildSnapshot, changed: bool) -> bool {
        let mut state = self.state.lock();
        if !changed && state.last.as_ref() == Some(&snapshot) {
            return false;
        }
        let Some(updates) = state.updates.as_ref() else {
            return false;
        };
        let _ = updates.send(snapshot.clone());
        state.last = Some(snapshot);
        standard::SNAPSHOTS_DELIVERED.inc();
        true
    }

    /// Signal a connectivity loss without closing updates
    pub(crate) fn notify_disconnected(&self) {
        let state = self.state.lock();
        if let Some(tx) = state.disconnected.as_ref() {
            let _ = tx.send(());
        }
    }

    /// Close both streams. Returns false if already closed.
    pub(crate) fn close(&self) -> bool {
        self.cancel.cancel();
        let mut state = self.state.lock();
        let updates = state.updates.take();
        let disconnected = state.disconnected.take();
        let closed = updates.is_some() || disconnected.is_some();
        if closed {
            debug!(
                "Closed subscription on {} ({} handles)",
                self.path, state.handles
            );
        }
        closed
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().updates.is_none()
    }
}

/// Stream of child snapshots for a watched path
pub struct ChildUpdates {
    initial: Option<ChildSnapshot>,
    rx: broadcast::Receiver<ChildSnapshot>,
}

impl ChildUpdates {
    /// Next snapshot, or `None` once the watch is removed.
    ///
    /// A slow reader that falls behind skips to the oldest retained
    /// snapshot; every snapshot is complete so nothing needs reconciling.
    pub async fn recv(&mut self) -> Option<ChildSnapshot> {
        if let Some(snapshot) = self.initial.take() {
            return Some(snapshot);
        }
        loop {
            match self.rx.recv().await {
                Ok(snapshot) => return Some(snapshot),
                Err(RecvError::Lagged(skipped)) => {
                    debug!("Child updates lagged, skipped {} snapshots", skipped);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

/// Stream of connectivity-loss signals for a watched path
pub struct Disconnections {
    rx: broadcast::Receiver<()>,
}

impl Disconnections {
    /// Next disconnect signal, or `None` once the watch is removed
    pub async fn recv(&mut self) -> Option<()> {
        loop {
            match self.rx.recv().await {
                Ok(()) => return Some(()),
                Err(RecvError::Lagged(_)) => return Some(()),
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(names: &[&str]) -> ChildSnapshot {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[tokio::test]
    async fn test_late_handle_starts_with_latest() {
        let sub = WatchSubscription::new("/a".into(), CancellationToken::new());
        let (mut first, _) = sub.handle().unwrap();
        assert!(sub.deliver(snapshot(&[]), false));
        assert!(sub.deliver(snapshot(&["x"]), true));

        let (mut second, _) = sub.handle().unwrap();
        assert_eq!(first.recv().await, Some(snapshot(&[])));
        assert_eq!(first.recv().await, Some(snapshot(&["x"])));
        assert_eq!(second.recv().await, Some(snapshot(&["x"])));
    }

    #[tokio::test]
    async fn test_duplicate_snapshot_not_delivered() {
        let sub = WatchSubscription::new("/a".into(), CancellationToken::new());
        assert!(sub.deliver(snapshot(&["x"]), false));
        assert!(!sub.deliver(snapshot(&["x"]), false));
        assert!(sub.deliver(snapshot(&["x"]), true));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_ends_streams() {
        let sub = WatchSubscription::new("/a".into(), CancellationToken::new());
        let (mut updates, mut disconnected) = sub.handle().unwrap();

        assert!(sub.close());
        assert!(!sub.close());
        assert!(sub.cancel_token().is_cancelled());
        assert!(sub.handle().is_none());
        assert!(!sub.deliver(snapshot(&["late"]), true));

        assert_eq!(updates.recv().await, None);
        assert_eq!(disconnected.recv().await, None);
    }
}
