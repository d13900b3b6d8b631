//! Serving version control
//!
//! The active version pointer consulted on every request. Readers clone an
//! `Arc` of the current state; swaps replace it whole, so a reader never
//! sees a half-updated version.

pub mod http;

pub use http::router;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

use crate::error::{Result, StaveError};
use crate::metrics::standard;
use crate::version::{LoadedVersion, Version};

/// Snapshot of what a dataset is serving
#[derive(Debug)]
pub struct ServingState {
    loaded: Option<LoadedVersion>,
    /// When this state was adopted
    pub since: DateTime<Utc>,
}

impl ServingState {
    fn empty() -> Self {
        Self {
            loaded: None,
            since: Utc::now(),
        }
    }

    /// Served version, if any
    pub fn version(&self) -> Option<&Version> {
        self.loaded.as_ref().map(|l| &l.version)
    }

    /// Served data, if any
    pub fn loaded(&self) -> Option<&LoadedVersion> {
        self.loaded.as_ref()
    }

    /// Look up a key in the served version
    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.loaded.as_ref().and_then(|l| l.get(key))
    }
}

/// Holds and atomically swaps the served version of one dataset
pub struct ServingVersionController {
    dataset: String,
    state: watch::Sender<Arc<ServingState>>,
}

impl ServingVersionController {
    /// Create a controller serving nothing
    pub fn new(dataset: impl Into<String>) -> Self {
        let (state, _) = watch::channel(Arc::new(ServingState::empty()));
        Self {
            dataset: dataset.into(),
            state,
        }
    }

    /// Dataset this controller serves
    pub fn dataset(&self) -> &str {
        &self.dataset
    }

    /// Current state
    pub fn current(&self) -> Arc<ServingState> {
        self.state.borrow().clone()
    }

    /// Current version
    pub fn version(&self) -> Option<Version> {
        self.state.borrow().version().cloned()
    }

    /// Look up a key in the current version
    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.current().get(key)
    }

    /// Observe swaps
    pub fn subscribe(&self) -> watch::Receiver<Arc<ServingState>> {
        self.state.subscribe()
    }

    /// Serve `loaded` if it is newer than the current version.
    ///
    /// Returns true if the version changed. An equal version is a no-op; an
    /// older one is rejected with [`StaveError::Downgrade`].
    pub fn swap(&self, loaded: LoadedVersion) -> Result<bool> {
        let mut outcome = Ok(false);
        let mut previous = None;

        self.state.send_if_modified(|current| match current.version() {
            Some(served) if loaded.version < *served => {
                outcome = Err(StaveError::Downgrade {
                    current: served.to_string(),
                    proposed: loaded.version.to_string(),
                });
                false
            }
            Some(served) if loaded.version == *served => false,
            served => {
                previous = served.cloned();
                *current = Arc::new(ServingState {
                    loaded: Some(loaded),
                    since: Utc::now(),
                });
                outcome = Ok(true);
                true
            }
        });

        if let Ok(true) = outcome {
            standard::VERSION_SWAPS.inc();
            match (previous, self.version()) {
                (Some(from), Some(to)) => {
                    info!("Swapped {} from version {} to {}", self.dataset, from, to)
                }
                (None, Some(to)) => info!("Now serving {} version {}", self.dataset, to),
                _ => {}
            }
        }
        outcome
    }
}
