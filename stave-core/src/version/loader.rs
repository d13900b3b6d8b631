//! Version loading
//!
//! Copies a complete version from the backend into the local store and
//! indexes its records. Data files hold one `key\tvalue` record per line.

use bytes::Bytes;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::tracker::is_hidden;
use super::Version;
use crate::error::{Result, StaveError};
use crate::metrics::standard;

/// Configuration for the version loader
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Backend root
    pub root: PathBuf,
    /// Local store root
    pub local_store: PathBuf,
    /// Pause between files to avoid hammering the backend
    pub throttle: Duration,
    /// Completion marker file name (never indexed)
    pub marker: String,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            local_store: PathBuf::from("./store"),
            throttle: Duration::ZERO,
            marker: crate::DEFAULT_SUCCESS_FILE.into(),
        }
    }
}

/// A fully loaded, immutable version
#[derive(Debug)]
pub struct LoadedVersion {
    /// Version identity
    pub version: Version,
    /// Local copy of the version's files
    pub path: PathBuf,
    records: HashMap<String, Bytes>,
}

impl LoadedVersion {
    /// Build a loaded version from in-memory records
    pub fn from_records(version: Version, records: HashMap<String, Bytes>) -> Self {
        Self {
            version,
            path: PathBuf::new(),
            records,
        }
    }

    /// Look up a key
    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.records.get(key).cloned()
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True if the version holds no records
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Loads versions from the backend into the local store
#[derive(Debug, Clone)]
pub struct VersionLoader {
    config: LoaderConfig,
}

impl VersionLoader {
    /// Create a new loader
    pub fn new(config: LoaderConfig) -> Self {
        Self { config }
    }

    /// Copy and index a version
    pub async fn load(&self, dataset: &str, version: &Version) -> Result<LoadedVersion> {
        let start = Instant::now();
        let source = self.config.root.join(dataset).join(version.as_str());
        let dataset_store = self.config.local_store.join(dataset);
        let target = dataset_store.join(version.as_str());
        let staging = dataset_store.join(format!(".{}.partial", version));

        tokio::fs::create_dir_all(&dataset_store).await?;
        if tokio::fs::try_exists(&staging).await? {
            tokio::fs::remove_dir_all(&staging).await?;
        }
        tokio::fs::create_dir_all(&staging).await?;

        let staged = match self.stage(dataset, version, &source, &staging).await {
            Ok(staged) => staged,
            Err(e) => {
                discard(&staging).await;
                return Err(e);
            }
        };
        if let Err(e) = replace_dir(&staging, &target).await {
            discard(&staging).await;
            return Err(e);
        }
        let Staged {
            files,
            records,
            bytes_loaded,
        } = staged;

        standard::VERSIONS_LOADED.inc();
        standard::BYTES_LOADED.inc_by(bytes_loaded);
        standard::LOAD_DURATION.observe(start.elapsed().as_secs_f64());

        info!(
            "Loaded {}/{}: {} files, {} records, {} bytes in {:?}",
            dataset,
            version,
            files,
            records.len(),
            bytes_loaded,
            start.elapsed()
        );

        Ok(LoadedVersion {
            version: version.clone(),
            path: target,
            records,
        })
    }

    /// Remove local copies of every version except `keep`
    pub async fn prune(&self, dataset: &str, keep: &Version) -> Result<()> {
        let dataset_store = self.config.local_store.join(dataset);
        let mut entries = match tokio::fs::read_dir(&dataset_store).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == keep.as_str() || name.starts_with('.') {
                continue;
            }
            if let Err(e) = tokio::fs::remove_dir_all(entry.path()).await {
                warn!("Failed to prune {}/{}: {}", dataset, name, e);
            } else {
                debug!("Pruned local copy of {}/{}", dataset, name);
            }
        }
        Ok(())
    }

    /// Copy every data file into `staging` and index it
    async fn stage(
        &self,
        dataset: &str,
        version: &Version,
        source: &Path,
        staging: &Path,
    ) -> Result<Staged> {
        let files = self.data_files(source).await?;
        let mut records = HashMap::new();
        let mut bytes_loaded = 0u64;

        for (i, file) in files.iter().enumerate() {
            if i > 0 && !self.config.throttle.is_zero() {
                tokio::time::sleep(self.config.throttle).await;
            }

            let name = file.file_name().unwrap_or_default();
            let local = staging.join(name);
            tokio::fs::copy(file, &local).await?;

            let data = tokio::fs::read(&local).await?;
            bytes_loaded += data.len() as u64;
            parse_records(&local, &data, &mut records)?;
            debug!("Loaded {} for {}/{}", local.display(), dataset, version);
        }

        Ok(Staged {
            files: files.len(),
            records,
            bytes_loaded,
        })
    }

    async fn data_files(&self, source: &Path) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        let mut entries = tokio::fs::read_dir(source).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == self.config.marker || is_hidden(&name) {
                continue;
            }
            if entry.file_type().await?.is_file() {
                files.push(entry.path());
            }
        }
        files.sort();
        Ok(files)
    }
}

struct Staged {
    files: usize,
    records: HashMap<String, Bytes>,
    bytes_loaded: u64,
}

async fn replace_dir(staging: &Path, target: &Path) -> Result<()> {
    if tokio::fs::try_exists(target).await? {
        tokio::fs::remove_dir_all(target).await?;
    }
    tokio::fs::rename(staging, target).await?;
    Ok(())
}

/// Best-effort removal of a half-written staging directory
async fn discard(staging: &Path) {
    match tokio::fs::remove_dir_all(staging).await {
        Ok(()) => debug!("Discarded {}", staging.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to discard {}: {}", staging.display(), e),
    }
}

fn parse_records(file: &Path, data: &[u8], records: &mut HashMap<String, Bytes>) -> Result<()> {
    let text = String::from_utf8_lossy(data);
    for (i, line) in text.lines().enumerate() {
        if line.is_empty() {
            continue;
        }
        let (key, value) = line.split_once('\t').ok_or_else(|| StaveError::InvalidRecord {
            file: file.display().to_string(),
            line: i + 1,
        })?;
        records.insert(key.to_string(), Bytes::copy_from_slice(value.as_bytes()));
    }
    Ok(())
}
