//! Per-dataset convergence coordinator
//!
//! Runs the join phase and the convergence cycles of one dataset.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::view::{join_candidates, upgrade_candidates, ClusterView};
use crate::coordination::{ChildSnapshot, ChildUpdates, CoordinationWatcher, Disconnections};
use crate::error::{Result, StaveError};
use crate::metrics::standard;
use crate::runtime::{ReloadListener, ShutdownSignal};
use crate::serving::ServingVersionController;
use crate::version::{Version, VersionLoader, VersionTracker};

/// Configuration for a convergence coordinator
#[derive(Debug, Clone)]
pub struct ConvergenceConfig {
    /// This node's identity (`host:port`)
    pub identity: String,
    /// Bound on the join-phase wait and the post-publish settle wait
    pub time_to_converge: Duration,
    /// Periodic rescan interval, if any
    pub poll_interval: Option<Duration>,
}

impl Default for ConvergenceConfig {
    fn default() -> Self {
        Self {
            identity: format!("localhost:{}", crate::DEFAULT_PORT),
            time_to_converge: Duration::from_secs(10),
            poll_interval: None,
        }
    }
}

/// Reported state of one dataset
#[derive(Debug, Clone, Serialize)]
pub struct DatasetStatus {
    /// Served version
    pub version: Option<Version>,
    /// When the served version was adopted
    pub since: DateTime<Utc>,
    /// Records in the served version
    pub records: usize,
    /// What every node publishes
    pub cluster: ClusterView,
}

struct CycleState {
    /// Value last published under our node path
    published: Option<String>,
}

/// Drives one dataset toward the newest locally available version
pub struct ConvergenceCoordinator {
    dataset: String,
    config: ConvergenceConfig,
    watcher: CoordinationWatcher,
    tracker: Arc<VersionTracker>,
    loader: Arc<VersionLoader>,
    controller: Arc<ServingVersionController>,
    view: watch::Sender<Option<ClusterView>>,
    cycle: tokio::sync::Mutex<CycleState>,
    view_task: Mutex<Option<JoinHandle<()>>>,
}

impl ConvergenceCoordinator {
    /// Create a coordinator serving nothing
    pub fn new(
        dataset: impl Into<String>,
        config: ConvergenceConfig,
        watcher: CoordinationWatcher,
        tracker: Arc<VersionTracker>,
        loader: Arc<VersionLoader>,
    ) -> Self {
        let dataset = dataset.into();
        let (view, _) = watch::channel(None);
        Self {
            controller: Arc::new(ServingVersionController::new(dataset.clone())),
            dataset,
            config,
            watcher,
            tracker,
            loader,
            view,
            cycle: tokio::sync::Mutex::new(CycleState { published: None }),
            view_task: Mutex::new(None),
        }
    }

    /// Dataset name
    pub fn dataset(&self) -> &str {
        &self.dataset
    }

    /// Serving controller for this dataset
    pub fn controller(&self) -> &Arc<ServingVersionController> {
        &self.controller
    }

    /// Latest cluster view (empty before the first snapshot)
    pub fn cluster_view(&self) -> ClusterView {
        self.view.borrow().clone().unwrap_or_default()
    }

    /// Observe cluster view changes
    pub fn view_changes(&self) -> watch::Receiver<Option<ClusterView>> {
        self.view.subscribe()
    }

    /// Current status
    pub fn status(&self) -> DatasetStatus {
        let serving = self.controller.current();
        DatasetStatus {
            version: serving.version().cloned(),
            since: serving.since,
            records: serving.loaded().map_or(0, |l| l.len()),
            cluster: self.cluster_view(),
        }
    }

    fn dataset_path(&self) -> String {
        format!("/{}", self.dataset)
    }

    fn node_path(&self) -> String {
        format!("/{}/{}", self.dataset, self.config.identity)
    }

    /// Join phase, run before the node is reachable.
    ///
    /// Starts watching siblings, waits up to `time_to_converge` for the first
    /// cluster view, then adopts the newest local candidate a sibling already
    /// publishes. Publishing our own version is left to the first cycle.
    pub async fn join(self: &Arc<Self>) -> Result<()> {
        let _cycle = self.cycle.lock().await;
        if self.view_task.lock().is_some() {
            return Ok(());
        }

        let (updates, disconnects) = self.watcher.watch_children(&self.dataset_path())?;
        let task = tokio::spawn(self.clone().track_view(updates, disconnects));
        *self.view_task.lock() = Some(task);

        let mut views = self.view.subscribe();
        let viewed = tokio::time::timeout(self.config.time_to_converge, views.wait_for(Option::is_some))
            .await
            .is_ok();
        if !viewed {
            warn!(
                "No cluster view for {} within {:?}, joining alone",
                self.dataset, self.config.time_to_converge
            );
        }

        standard::RESCANS.inc();
        let candidates = self.tracker.scan(&self.dataset).await?;
        let view = self.cluster_view();
        let targets = join_candidates(&candidates, &view, &self.config.identity);
        if targets.is_empty() {
            debug!(
                "Joining {} with nothing in use by {} siblings",
                self.dataset,
                view.len()
            );
        }
        self.adopt(targets).await;
        Ok(())
    }

    /// Run one convergence cycle; returns the served version afterwards
    pub async fn converge(&self) -> Result<Option<Version>> {
        let start = Instant::now();
        let mut state = self.cycle.lock().await;

        standard::RESCANS.inc();
        let candidates: BTreeSet<Version> = self.tracker.scan(&self.dataset).await?;
        let highest = candidates.iter().next_back().cloned();
        self.publish(&mut state, highest.as_ref()).await;

        let served = self.controller.version();
        self.adopt(upgrade_candidates(&candidates, served.as_ref()))
            .await;

        self.settle(highest.as_ref()).await;
        standard::CONVERGE_DURATION.observe(start.elapsed().as_secs_f64());
        Ok(self.controller.version())
    }

    /// Run cycles until shutdown: once at start, then on every reload or poll tick
    pub async fn run(self: Arc<Self>, mut reloads: ReloadListener, shutdown: ShutdownSignal) {
        info!("Converging {} as {}", self.dataset, self.config.identity);
        loop {
            if let Err(e) = self.converge().await {
                warn!("Convergence cycle for {} failed: {}", self.dataset, e);
            }

            tokio::select! {
                _ = shutdown.wait() => break,
                more = reloads.next() => {
                    if !more {
                        shutdown.wait().await;
                        break;
                    }
                    debug!("Reload for {}", self.dataset);
                }
                _ = poll(self.config.poll_interval) => {
                    debug!("Poll tick for {}", self.dataset);
                }
            }
        }
        debug!("Convergence loop for {} stopped", self.dataset);
    }

    /// Withdraw our publication and stop watching siblings
    pub async fn leave(&self) {
        if let Err(e) = self.watcher.remove_ephemeral(&self.node_path()).await {
            warn!("Failed to withdraw {} publication: {}", self.dataset, e);
        }
        if let Err(e) = self.watcher.remove_watch(&self.dataset_path()) {
            debug!("Removing watch for {}: {}", self.dataset, e);
        }

        let task = self.view_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    /// Try `targets` newest first and serve the first that loads
    async fn adopt(&self, targets: Vec<Version>) {
        for version in targets {
            let loaded = match self.loader.load(&self.dataset, &version).await {
                Ok(loaded) => loaded,
                Err(e) => {
                    standard::LOAD_FAILURES.inc();
                    warn!("Skipping {} version {}: {}", self.dataset, version, e);
                    continue;
                }
            };

            match self.controller.swap(loaded) {
                Ok(true) => {
                    if let Err(e) = self.loader.prune(&self.dataset, &version).await {
                        warn!("Failed to prune local store for {}: {}", self.dataset, e);
                    }
                }
                Ok(false) => {}
                Err(e) => warn!("Not adopting {}: {}", version, e),
            }
            return;
        }
    }

    /// Publish `version` under our node path if it changed
    async fn publish(&self, state: &mut CycleState, version: Option<&Version>) {
        let value = version.map(Version::to_string).unwrap_or_default();
        if state.published.as_deref() == Some(value.as_str()) {
            return;
        }

        match self
            .watcher
            .set_ephemeral(&self.node_path(), value.as_bytes())
            .await
        {
            Ok(()) => {
                if value.is_empty() {
                    info!("Published {} with no version available", self.dataset);
                } else {
                    info!("Published {} version {}", self.dataset, value);
                }
                state.published = Some(value);
            }
            Err(e) => warn!("Failed to publish {} version: {}", self.dataset, e),
        }
    }

    /// Wait until our publication shows up in the cluster view
    async fn settle(&self, published: Option<&Version>) {
        let identity = self.config.identity.as_str();
        let mut views = self.view.subscribe();
        let settled = tokio::time::timeout(
            self.config.time_to_converge,
            views.wait_for(|view| {
                view.as_ref().is_some_and(|view| {
                    view.contains(identity) && view.published(identity) == published
                })
            }),
        )
        .await
        .is_ok();

        if !settled {
            warn!(
                "Publication for {} did not settle within {:?}",
                self.dataset, self.config.time_to_converge
            );
        }
    }

    async fn track_view(self: Arc<Self>, mut updates: ChildUpdates, mut disconnects: Disconnections) {
        loop {
            tokio::select! {
                snapshot = updates.recv() => match snapshot {
                    Some(children) => {
                        let view = self.build_view(&children).await;
                        self.view.send_replace(Some(view));
                    }
                    None => break,
                },
                Some(()) = disconnects.recv() => {
                    warn!(
                        "Lost coordination connectivity for {}, still serving {:?}",
                        self.dataset,
                        self.controller.version().map(|v| v.to_string())
                    );
                }
            }
        }
        debug!("Stopped tracking cluster view for {}", self.dataset);
    }

    async fn build_view(&self, children: &ChildSnapshot) -> ClusterView {
        let previous = self.cluster_view();
        let dataset_path = self.dataset_path();
        let mut view = ClusterView::new();

        for node in children {
            match self.watcher.get_data(&format!("{}/{}", dataset_path, node)).await {
                Ok(data) => view.insert(node.as_str(), Version::from_published(&data)),
                Err(StaveError::NoNode { .. }) => {}
                Err(e) => {
                    debug!("Reading {} publication failed: {}", node, e);
                    view.insert(node.as_str(), previous.published(node).cloned());
                }
            }
        }
        view
    }
}

async fn poll(interval: Option<Duration>) {
    match interval {
        Some(interval) => tokio::time::sleep(interval).await,
        None => std::future::pending().await,
    }
}
