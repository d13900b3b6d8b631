//! Serving node
//!
//! Wires configuration, coordination, convergence and the HTTP surface for
//! every dataset. A node first joins (connects, watches siblings, adopts what
//! the cluster already serves) and only then starts accepting requests.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::NodeConfig;
use crate::convergence::{ConvergenceCoordinator, DatasetStatus};
use crate::coordination::{
    ConnectionState, CoordinationBackend, CoordinationWatcher, MemoryCoordinator,
};
use crate::error::{Result, StaveError};
use crate::runtime::{ReloadTrigger, ShutdownSignal};
use crate::serving;
use crate::version::{VersionLoader, VersionTracker};

/// Reported state of a node
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    /// `host:port` identity
    pub identity: String,
    /// Per-dataset state
    pub datasets: BTreeMap<String, DatasetStatus>,
}

impl NodeStatus {
    pub(crate) fn collect(
        identity: &str,
        datasets: &BTreeMap<String, Arc<ConvergenceCoordinator>>,
    ) -> Self {
        Self {
            identity: identity.to_string(),
            datasets: datasets
                .iter()
                .map(|(name, coordinator)| (name.clone(), coordinator.status()))
                .collect(),
        }
    }
}

/// A serving node
pub struct Node {
    identity: String,
    local_addr: SocketAddr,
    watcher: CoordinationWatcher,
    datasets: Arc<BTreeMap<String, Arc<ConvergenceCoordinator>>>,
    reload: ReloadTrigger,
    shutdown: ShutdownSignal,
    listener: Mutex<Option<TcpListener>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    /// Join using the coordination service named in the configuration
    pub async fn join(config: NodeConfig) -> Result<Self> {
        let backend = backend_for(&config)?;
        Self::join_with(config, backend).await
    }

    /// Join using an explicit coordination backend
    pub async fn join_with(
        config: NodeConfig,
        backend: Arc<dyn CoordinationBackend>,
    ) -> Result<Self> {
        config.validate()?;

        let listener = TcpListener::bind(config.bind).await?;
        let local_addr = listener.local_addr()?;
        let identity = format!("{}:{}", config.advertised_hostname(), local_addr.port());

        let watcher = CoordinationWatcher::connect(backend, config.watcher_config()).await?;
        let tracker = Arc::new(VersionTracker::new(config.tracker_config()));
        let loader = Arc::new(VersionLoader::new(config.loader_config()));

        let names = if config.datasets.is_empty() {
            let found = tracker.discover_datasets().await?;
            if found.is_empty() {
                warn!("No datasets found under {}", config.root.display());
            }
            found
        } else {
            config.datasets.clone()
        };

        let mut datasets = BTreeMap::new();
        for name in names {
            let coordinator = Arc::new(ConvergenceCoordinator::new(
                name.clone(),
                config.convergence_config(&identity),
                watcher.clone(),
                tracker.clone(),
                loader.clone(),
            ));
            coordinator.join().await?;
            datasets.insert(name, coordinator);
        }

        info!(
            "Node {} joined with datasets {:?}",
            identity,
            datasets.keys().collect::<Vec<_>>()
        );

        Ok(Self {
            identity,
            local_addr,
            watcher,
            datasets: Arc::new(datasets),
            reload: ReloadTrigger::new(),
            shutdown: ShutdownSignal::new(),
            listener: Mutex::new(Some(listener)),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Serve requests and run convergence until shutdown
    pub fn start(&self) -> Result<()> {
        let listener = self.listener.lock().take().ok_or_else(|| StaveError::Internal {
            message: "node already started".into(),
        })?;

        let mut tasks = self.tasks.lock();
        for coordinator in self.datasets.values() {
            let reloads = self.reload.subscribe();
            tasks.push(tokio::spawn(
                coordinator.clone().run(reloads, self.shutdown.clone()),
            ));
        }

        let app = serving::router(&self.identity, self.datasets.clone());
        let shutdown = self.shutdown.clone();
        let addr = self.local_addr;
        tasks.push(tokio::spawn(async move {
            info!("Serving on {}", addr);
            let server = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.wait().await });
            if let Err(e) = server.await {
                error!("HTTP server error: {}", e);
            }
        }));
        Ok(())
    }

    /// This node's `host:port` identity
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Address the HTTP surface is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Coordinator for a dataset
    pub fn dataset(&self, name: &str) -> Option<&Arc<ConvergenceCoordinator>> {
        self.datasets.get(name)
    }

    /// Handle for triggering reloads
    pub fn reload_trigger(&self) -> ReloadTrigger {
        self.reload.clone()
    }

    /// Force a convergence cycle on every dataset
    pub fn reload(&self) {
        self.reload.reload();
    }

    /// Observe the coordination connection
    pub fn coordination_state(&self) -> watch::Receiver<ConnectionState> {
        self.watcher.state_changes()
    }

    /// Current status
    pub fn status(&self) -> NodeStatus {
        NodeStatus::collect(&self.identity, &self.datasets)
    }

    /// Stop serving, withdraw publications and close the session
    pub async fn shutdown(&self) {
        if self.shutdown.is_triggered() {
            return;
        }
        info!("Node {} shutting down", self.identity);
        self.shutdown.shutdown();

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
        drop(self.listener.lock().take());

        for coordinator in self.datasets.values() {
            coordinator.leave().await;
        }
        self.watcher.close().await;
    }
}

fn backend_for(config: &NodeConfig) -> Result<Arc<dyn CoordinationBackend>> {
    if config.coordination.servers.is_empty() {
        info!("No coordination servers configured, running standalone");
        return Ok(Arc::new(MemoryCoordinator::new()));
    }

    #[cfg(feature = "zookeeper")]
    let backend: Result<Arc<dyn CoordinationBackend>> =
        Ok(Arc::new(crate::coordination::ZooKeeperBackend::new(
            &config.coordination.servers,
            config.session_timeout(),
        )));

    #[cfg(not(feature = "zookeeper"))]
    let backend: Result<Arc<dyn CoordinationBackend>> = Err(StaveError::config(
        "coordination.servers requires the `zookeeper` feature",
    ));

    backend
}
