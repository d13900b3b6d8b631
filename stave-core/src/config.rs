//! Node configuration
//!
//! Loaded from a TOML file. Durations are given in milliseconds.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::convergence::ConvergenceConfig;
use crate::coordination::{validate_path, WatcherConfig};
use crate::error::{Result, StaveError};
use crate::logging::LogFormat;
use crate::version::{LoaderConfig, TrackerConfig};

/// Top-level node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// HTTP bind address
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
    /// Backend root holding `{dataset}/{version}/` directories
    pub root: PathBuf,
    /// Local store for loaded copies
    pub local_store: PathBuf,
    /// Only versions carrying the completion marker are candidates
    #[serde(default = "default_true")]
    pub require_success_file: bool,
    /// Completion marker file name
    #[serde(default = "default_success_file")]
    pub success_file: String,
    /// Pause between files while loading a version
    #[serde(default)]
    pub throttle_loads_ms: u64,
    /// Datasets to serve; empty means discover under `root`
    #[serde(default)]
    pub datasets: Vec<String>,
    /// Periodic rescan interval, 0 disables polling
    #[serde(default)]
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub coordination: CoordinationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Coordination service settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    /// Service endpoints; empty runs an in-process service
    pub servers: Vec<String>,
    /// Tree namespace
    pub namespace: String,
    /// Bound on the join wait and the post-publish settle wait
    pub time_to_converge_ms: u64,
    /// Bound on probe latency
    pub proxy_timeout_ms: u64,
    /// Host advertised to siblings; defaults to `$HOSTNAME`
    pub advertised_hostname: Option<String>,
    /// Service session timeout
    pub session_timeout_ms: u64,
    /// How long an operation waits for a usable session
    pub operation_timeout_ms: u64,
    /// Linear reconnect backoff step
    pub reconnect_backoff_ms: u64,
    /// 0 retries forever
    pub max_reconnect_attempts: u32,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            namespace: crate::DEFAULT_NAMESPACE.into(),
            time_to_converge_ms: 10_000,
            proxy_timeout_ms: 100,
            advertised_hostname: None,
            session_timeout_ms: 10_000,
            operation_timeout_ms: 5_000,
            reconnect_backoff_ms: 500,
            max_reconnect_attempts: 0,
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Base `EnvFilter` directive
    pub level: String,
    /// `compact` or `json`
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "compact".into(),
        }
    }
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], crate::DEFAULT_PORT))
}

fn default_true() -> bool {
    true
}

fn default_success_file() -> String {
    crate::DEFAULT_SUCCESS_FILE.into()
}

impl NodeConfig {
    /// Configuration with defaults for everything but the two paths
    pub fn new(root: impl Into<PathBuf>, local_store: impl Into<PathBuf>) -> Self {
        Self {
            bind: default_bind(),
            root: root.into(),
            local_store: local_store.into(),
            require_success_file: true,
            success_file: default_success_file(),
            throttle_loads_ms: 0,
            datasets: Vec::new(),
            poll_interval_ms: 0,
            coordination: CoordinationConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Load and validate a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            StaveError::config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&text)
    }

    /// Parse and validate TOML text
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: NodeConfig =
            toml::from_str(text).map_err(|e| StaveError::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for consistency
    pub fn validate(&self) -> Result<()> {
        if self.root.as_os_str().is_empty() {
            return Err(StaveError::config("root must be set"));
        }
        if self.local_store.as_os_str().is_empty() {
            return Err(StaveError::config("local_store must be set"));
        }
        if self.local_store == self.root {
            return Err(StaveError::config("local_store must differ from root"));
        }
        if self.success_file.is_empty() || self.success_file.contains('/') {
            return Err(StaveError::config(format!(
                "invalid success_file {:?}",
                self.success_file
            )));
        }
        for dataset in &self.datasets {
            if dataset.is_empty()
                || dataset.contains('/')
                || dataset.starts_with('.')
                || dataset.starts_with('_')
            {
                return Err(StaveError::config(format!("invalid dataset name {:?}", dataset)));
            }
        }

        let coordination = &self.coordination;
        validate_path(&format!("/{}", coordination.namespace.trim_matches('/')))
            .map_err(|_| StaveError::config(format!("invalid namespace {:?}", coordination.namespace)))?;
        if coordination.time_to_converge_ms == 0 {
            return Err(StaveError::config("time_to_converge_ms must be positive"));
        }
        if coordination.operation_timeout_ms == 0 {
            return Err(StaveError::config("operation_timeout_ms must be positive"));
        }
        if coordination.proxy_timeout_ms == 0 {
            return Err(StaveError::config("proxy_timeout_ms must be positive"));
        }
        if coordination.servers.iter().any(|s| s.trim().is_empty()) {
            return Err(StaveError::config("empty coordination server address"));
        }
        if !coordination.servers.is_empty() && !cfg!(feature = "zookeeper") {
            return Err(StaveError::config(
                "coordination.servers requires the `zookeeper` feature",
            ));
        }

        self.logging.format.parse::<LogFormat>()?;
        Ok(())
    }

    /// Host this node advertises to its siblings
    pub fn advertised_hostname(&self) -> String {
        self.coordination
            .advertised_hostname
            .clone()
            .filter(|h| !h.is_empty())
            .or_else(|| std::env::var("HOSTNAME").ok().filter(|h| !h.is_empty()))
            .unwrap_or_else(|| "localhost".into())
    }

    pub fn time_to_converge(&self) -> Duration {
        Duration::from_millis(self.coordination.time_to_converge_ms)
    }

    pub fn proxy_timeout(&self) -> Duration {
        Duration::from_millis(self.coordination.proxy_timeout_ms)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.coordination.session_timeout_ms)
    }

    pub fn poll_interval(&self) -> Option<Duration> {
        (self.poll_interval_ms > 0).then(|| Duration::from_millis(self.poll_interval_ms))
    }

    pub fn tracker_config(&self) -> TrackerConfig {
        TrackerConfig {
            root: self.root.clone(),
            require_marker: self.require_success_file,
            marker: self.success_file.clone(),
        }
    }

    pub fn loader_config(&self) -> LoaderConfig {
        LoaderConfig {
            root: self.root.clone(),
            local_store: self.local_store.clone(),
            throttle: Duration::from_millis(self.throttle_loads_ms),
            marker: self.success_file.clone(),
        }
    }

    pub fn watcher_config(&self) -> WatcherConfig {
        WatcherConfig {
            namespace: self.coordination.namespace.clone(),
            operation_timeout: Duration::from_millis(self.coordination.operation_timeout_ms),
            reconnect_backoff: Duration::from_millis(self.coordination.reconnect_backoff_ms),
            max_reconnect_attempts: self.coordination.max_reconnect_attempts,
        }
    }

    pub fn convergence_config(&self, identity: &str) -> ConvergenceConfig {
        ConvergenceConfig {
            identity: identity.to_string(),
            time_to_converge: self.time_to_converge(),
            poll_interval: self.poll_interval(),
        }
    }
}
