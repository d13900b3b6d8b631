//! Coordination service access
//!
//! The backend traits abstract a ZooKeeper-shaped service: sessions,
//! ephemeral nodes and one-shot child watches. [`CoordinationWatcher`]
//! builds session-resilient subscriptions on top of them.

pub mod memory;
pub mod subscription;
pub mod watcher;
#[cfg(feature = "zookeeper")]
pub mod zookeeper;

pub use memory::MemoryCoordinator;
pub use subscription::{ChildSnapshot, ChildUpdates, Disconnections};
pub use watcher::{ConnectionState, CoordinationWatcher, WatcherConfig};
#[cfg(feature = "zookeeper")]
pub use self::zookeeper::ZooKeeperBackend;

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{oneshot, watch};

use crate::error::{Result, StaveError};

/// Lifecycle of a node in the coordination tree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeMode {
    /// Survives the creating session
    Persistent,
    /// Removed when the creating session ends
    Ephemeral,
}

/// Session state as reported by the service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Session is usable
    Connected,
    /// Connection lost; the session may still be resumed
    Disconnected,
    /// Session is gone; ephemerals and watches are lost
    Expired,
    /// Session was closed by its owner
    Closed,
}

/// Event delivered to a one-shot child watch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEvent {
    /// The child list of the watched path changed
    ChildrenChanged,
}

/// One-shot child watch. A dropped sender means the session was lost.
pub type ChildWatch = oneshot::Receiver<WatchEvent>;

/// Factory for sessions against a coordination service
#[async_trait]
pub trait CoordinationBackend: Send + Sync + 'static {
    /// Open a new session
    async fn connect(&self) -> Result<Arc<dyn CoordinationSession>>;

    /// Human readable endpoint description
    fn describe(&self) -> String;
}

/// A single session with the coordination service
#[async_trait]
pub trait CoordinationSession: Send + Sync {
    /// Service-assigned session id
    fn id(&self) -> u64;

    /// Session state changes
    fn state_events(&self) -> watch::Receiver<SessionState>;

    /// Create a node; the parent must exist
    async fn create(&self, path: &str, data: &[u8], mode: NodeMode) -> Result<()>;

    /// Replace a node's data
    async fn set_data(&self, path: &str, data: &[u8]) -> Result<()>;

    /// Read a node's data
    async fn get_data(&self, path: &str) -> Result<Vec<u8>>;

    /// Delete a childless node
    async fn delete(&self, path: &str) -> Result<()>;

    /// List children and register a one-shot watch on the child list
    async fn children_watched(&self, path: &str) -> Result<(Vec<String>, ChildWatch)>;

    /// End the session; its ephemerals are removed
    async fn close(&self);
}

/// Validate an absolute coordination path
pub fn validate_path(path: &str) -> Result<()> {
    let valid = path == "/"
        || (path.starts_with('/')
            && !path.ends_with('/')
            && path[1..].split('/').all(|segment| !segment.is_empty()));
    if valid {
        Ok(())
    } else {
        Err(StaveError::InvalidPath { path: path.into() })
    }
}

/// Join a parent path and a child name
pub fn join_path(parent: &str, child: &str) -> String {
    let child = child.trim_matches('/');
    if parent == "/" || parent.is_empty() {
        format!("/{}", child)
    } else {
        format!("{}/{}", parent.trim_end_matches('/'), child)
    }
}

/// Parent of an absolute path; `None` for the root
pub fn parent_path(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(i) => Some(&path[..i]),
        None => None,
    }
}

/// Create every missing persistent ancestor of `path`, and `path` itself
pub(crate) async fn ensure_path(session: &dyn CoordinationSession, path: &str) -> Result<()> {
    let mut current = String::new();
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        current.push('/');
        current.push_str(segment);
        match session.create(&current, b"", NodeMode::Persistent).await {
            Ok(()) | Err(StaveError::NodeExists { .. }) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
