//! Graceful shutdown handling
//!
//! Broadcast-based shutdown signaling. Unlike a bare broadcast channel, a
//! listener that subscribes after the signal fired still observes it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

struct Shared {
    sender: broadcast::Sender<()>,
    triggered: AtomicBool,
}

/// Shutdown signal broadcaster
#[derive(Clone)]
pub struct ShutdownSignal {
    shared: Arc<Shared>,
}

impl ShutdownSignal {
    /// Create a new shutdown signal
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1);
        Self {
            shared: Arc::new(Shared {
                sender,
                triggered: AtomicBool::new(false),
            }),
        }
    }

    /// Trigger shutdown
    pub fn shutdown(&self) {
        if !self.shared.triggered.swap(true, Ordering::SeqCst) {
            let _ = self.shared.sender.send(());
        }
    }

    /// True once shutdown was triggered
    pub fn is_triggered(&self) -> bool {
        self.shared.triggered.load(Ordering::SeqCst)
    }

    /// Resolve once shutdown is triggered
    pub async fn wait(&self) {
        let mut receiver = self.shared.sender.subscribe();
        if self.is_triggered() {
            return;
        }
        let _ = receiver.recv().await;
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_signal() {
        let signal = ShutdownSignal::new();
        let waiter = signal.clone();

        let handle = tokio::spawn(async move {
            waiter.wait().await;
            42
        });

        signal.shutdown();
        assert_eq!(handle.await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_late_waiter_sees_shutdown() {
        let signal = ShutdownSignal::new();
        signal.shutdown();
        signal.shutdown();

        tokio::time::timeout(std::time::Duration::from_secs(1), signal.wait())
            .await
            .unwrap();
        assert!(signal.is_triggered());
    }
}
