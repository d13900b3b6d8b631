//! Reload trigger
//!
//! Fans "rescan now" requests out to every dataset coordinator.

use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info};

use crate::metrics::standard;

const RELOAD_CAPACITY: usize = 8;

/// Cloneable handle that forces an immediate convergence cycle
#[derive(Clone)]
pub struct ReloadTrigger {
    sender: Arc<broadcast::Sender<()>>,
}

impl ReloadTrigger {
    /// Create a new trigger
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(RELOAD_CAPACITY);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Request a rescan on every listener
    pub fn reload(&self) {
        standard::RELOADS.inc();
        let listeners = self.sender.send(()).unwrap_or(0);
        info!("Reload requested ({} listeners)", listeners);
    }

    /// Create a new listener
    pub fn subscribe(&self) -> ReloadListener {
        ReloadListener {
            rx: self.sender.subscribe(),
        }
    }
}

impl Default for ReloadTrigger {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving end of a [`ReloadTrigger`]
pub struct ReloadListener {
    rx: broadcast::Receiver<()>,
}

impl ReloadListener {
    /// Wait for the next reload. Returns false once every trigger is gone.
    pub async fn next(&mut self) -> bool {
        match self.rx.recv().await {
            Ok(()) => true,
            Err(RecvError::Lagged(missed)) => {
                debug!("Coalesced {} reload requests", missed);
                true
            }
            Err(RecvError::Closed) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_reload_fans_out() {
        let trigger = ReloadTrigger::new();
        let mut a = trigger.subscribe();
        let mut b = trigger.clone().subscribe();

        trigger.reload();
        assert!(a.next().await);
        assert!(b.next().await);
    }

    #[tokio::test]
    async fn test_lagged_listener_sees_one_reload() {
        let trigger = ReloadTrigger::new();
        let mut listener = trigger.subscribe();
        for _ in 0..(RELOAD_CAPACITY * 2) {
            trigger.reload();
        }

        assert!(listener.next().await);
        let mut seen = 1;
        while tokio::time::timeout(Duration::from_millis(20), listener.next())
            .await
            .is_ok()
        {
            seen += 1;
        }
        assert!(seen <= RELOAD_CAPACITY + 1);
    }

    #[tokio::test]
    async fn test_closed_when_triggers_dropped() {
        let trigger = ReloadTrigger::new();
        let mut listener = trigger.subscribe();
        drop(trigger);
        assert!(!listener.next().await);
    }
}
