//! Local version tracking
//!
//! Scans the backend for dataset versions that carry a completion marker.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::Version;
use crate::error::{Result, StaveError};

/// Configuration for the version tracker
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Backend root, laid out as `{root}/{dataset}/{version}/`
    pub root: PathBuf,
    /// Only versions with the marker file are candidates
    pub require_marker: bool,
    /// Completion marker file name
    pub marker: String,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            require_marker: true,
            marker: crate::DEFAULT_SUCCESS_FILE.into(),
        }
    }
}

/// Produces the set of locally available, fully written versions
#[derive(Debug, Clone)]
pub struct VersionTracker {
    config: TrackerConfig,
}

impl VersionTracker {
    /// Create a new tracker
    pub fn new(config: TrackerConfig) -> Self {
        Self { config }
    }

    /// Backend root
    pub fn root(&self) -> &Path {
        &self.config.root
    }

    /// Directory holding a version's files
    pub fn version_dir(&self, dataset: &str, version: &Version) -> PathBuf {
        self.config.root.join(dataset).join(version.as_str())
    }

    /// Scan a dataset for candidate versions.
    ///
    /// Partial versions are left out; a missing dataset directory yields
    /// an empty set. Errors on individual entries are logged and skipped.
    pub async fn scan(&self, dataset: &str) -> Result<BTreeSet<Version>> {
        let dataset_dir = self.config.root.join(dataset);
        let mut candidates = BTreeSet::new();

        let mut entries = match tokio::fs::read_dir(&dataset_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Dataset directory {} does not exist yet", dataset_dir.display());
                return Ok(candidates);
            }
            Err(e) => return Err(e.into()),
        };

        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!("Error listing {}: {}", dataset_dir.display(), e);
                    break;
                }
            };

            let name = entry.file_name().to_string_lossy().into_owned();
            if is_hidden(&name) {
                continue;
            }

            match self.inspect(dataset, &name, &entry.path()).await {
                Ok(Some(version)) => {
                    candidates.insert(version);
                }
                Ok(None) => {}
                Err(StaveError::PartialVersion { version, .. }) => {
                    debug!("Skipping {}/{}: not marked complete", dataset, version);
                }
                Err(e) => warn!("Skipping {}/{}: {}", dataset, name, e),
            }
        }

        debug!("Scanned {}: {} candidate versions", dataset, candidates.len());
        Ok(candidates)
    }

    /// Check a single entry. `Ok(None)` for entries that are not version directories.
    async fn inspect(&self, dataset: &str, name: &str, path: &Path) -> Result<Option<Version>> {
        let metadata = tokio::fs::metadata(path).await?;
        if !metadata.is_dir() {
            return Ok(None);
        }

        if self.config.require_marker {
            let marker = path.join(&self.config.marker);
            if !tokio::fs::try_exists(&marker).await? {
                return Err(StaveError::PartialVersion {
                    dataset: dataset.into(),
                    version: name.into(),
                });
            }
        }

        Ok(Some(Version::new(name)))
    }

    /// List dataset directories under the backend root
    pub async fn discover_datasets(&self) -> Result<Vec<String>> {
        let mut datasets = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.config.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if is_hidden(&name) {
                continue;
            }
            if entry.file_type().await?.is_dir() {
                datasets.push(name);
            }
        }
        datasets.sort();
        Ok(datasets)
    }
}

/// Names starting with `.` or `_` are never versions or datasets
pub(crate) fn is_hidden(name: &str) -> bool {
    name.starts_with('.') || name.starts_with('_')
}
