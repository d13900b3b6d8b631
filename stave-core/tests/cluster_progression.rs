//! Multi-node convergence tests over an in-process coordination service
//!
//! Every node gets its own backend root so versions can be made available
//! to some nodes and not others. Progressions are recorded from each
//! node's serving controller.
//!
//! Run with: cargo test --test cluster_progression

use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::task::JoinHandle;

use stave_core::convergence::{ClusterView, ConvergenceCoordinator};
use stave_core::coordination::{ConnectionState, MemoryCoordinator};
use stave_core::probe::{ObservedState, Progression};
use stave_core::serving::ServingState;
use stave_core::{Node, NodeConfig, Version};

const DATASET: &str = "names";
const WAIT: Duration = Duration::from_secs(10);

fn v(name: &str) -> Version {
    Version::from(name)
}

fn serving(name: &str) -> ObservedState {
    ObservedState::Serving(v(name))
}

fn observed(state: &ServingState) -> ObservedState {
    match state.version() {
        Some(version) => ObservedState::Serving(version.clone()),
        None => ObservedState::NoVersion,
    }
}

fn make_available(root: &Path, version: &str) {
    let dir = root.join(DATASET).join(version);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(
        dir.join("part-00000"),
        format!("alice\t{}\nbob\t{}\n", version, version),
    )
    .unwrap();
    std::fs::write(dir.join("_SUCCESS"), b"").unwrap();
}

fn remove_version(root: &Path, version: &str) {
    std::fs::remove_dir_all(root.join(DATASET).join(version)).unwrap();
}

struct TestNode {
    node: Node,
    backend: TempDir,
    _store: TempDir,
    progression: Arc<Mutex<Progression>>,
    recorder: Option<JoinHandle<()>>,
}

impl TestNode {
    /// Join the cluster with `versions` already available locally
    async fn join(service: &MemoryCoordinator, versions: &[&str]) -> Self {
        let backend = tempfile::tempdir().unwrap();
        let store = tempfile::tempdir().unwrap();
        for version in versions {
            make_available(backend.path(), version);
        }

        let mut config = NodeConfig::new(backend.path(), store.path());
        config.bind = "127.0.0.1:0".parse().unwrap();
        config.datasets = vec![DATASET.into()];
        config.coordination.namespace = "cluster-test".into();
        config.coordination.advertised_hostname = Some("127.0.0.1".into());
        config.coordination.time_to_converge_ms = 2_000;
        config.coordination.operation_timeout_ms = 2_000;
        config.coordination.reconnect_backoff_ms = 20;

        let node = Node::join_with(config, Arc::new(service.clone()))
            .await
            .unwrap();

        Self {
            node,
            backend,
            _store: store,
            progression: Arc::new(Mutex::new(Progression::new())),
            recorder: None,
        }
    }

    fn coordinator(&self) -> &Arc<ConvergenceCoordinator> {
        self.node.dataset(DATASET).unwrap()
    }

    fn make_available(&self, version: &str) {
        make_available(self.backend.path(), version);
    }

    /// Start serving; what the node serves at this moment is its first
    /// reachable state
    fn start(&mut self) {
        let mut states = self.coordinator().controller().subscribe();
        let first = observed(&states.borrow_and_update());
        self.progression.lock().observe(first);

        let progression = self.progression.clone();
        self.recorder = Some(tokio::spawn(async move {
            while states.changed().await.is_ok() {
                let state = observed(&states.borrow_and_update());
                progression.lock().observe(state);
            }
        }));

        self.node.start().unwrap();
    }

    async fn wait_serving(&self, version: &str) {
        let target = v(version);
        let mut states = self.coordinator().controller().subscribe();
        let reached = tokio::time::timeout(
            WAIT,
            states.wait_for(|state| state.version() == Some(&target)),
        )
        .await;
        assert!(
            matches!(reached, Ok(Ok(_))),
            "{} never served {}",
            self.node.identity(),
            version
        );

        // Let the recorder catch up before anything moves on
        let expected = serving(version);
        let recorded = tokio::time::timeout(WAIT, async {
            while self.progression.lock().last() != &expected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(recorded.is_ok());
    }

    async fn wait_view(&self, check: impl Fn(&ClusterView) -> bool) {
        let mut views = self.coordinator().view_changes();
        let reached = tokio::time::timeout(
            WAIT,
            views.wait_for(|view| view.as_ref().is_some_and(&check)),
        )
        .await;
        assert!(
            matches!(reached, Ok(Ok(_))),
            "view of {} never settled: {:?}",
            self.node.identity(),
            self.coordinator().cluster_view()
        );
    }

    fn served(&self) -> Option<Version> {
        self.coordinator().controller().version()
    }

    fn progression(&self) -> Vec<ObservedState> {
        self.progression.lock().states().to_vec()
    }

    async fn shutdown(mut self) {
        self.node.shutdown().await;
        if let Some(recorder) = self.recorder.take() {
            recorder.abort();
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fresh_single_node() {
    let service = MemoryCoordinator::new();
    let mut node = TestNode::join(&service, &["v3"]).await;
    assert_eq!(node.served(), None);

    node.start();
    node.wait_serving("v3").await;

    assert_eq!(
        node.progression(),
        vec![ObservedState::Down, ObservedState::NoVersion, serving("v3")]
    );
    assert_eq!(node.coordinator().controller().get("alice").unwrap(), "v3");
    node.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_upgrading_single_node() {
    let service = MemoryCoordinator::new();
    let mut node = TestNode::join(&service, &["v1"]).await;
    node.start();
    node.wait_serving("v1").await;

    node.make_available("v2");
    node.node.reload();
    node.wait_serving("v2").await;

    node.make_available("v3");
    node.node.reload();
    node.wait_serving("v3").await;

    assert_eq!(
        node.progression(),
        vec![
            ObservedState::Down,
            ObservedState::NoVersion,
            serving("v1"),
            serving("v2"),
            serving("v3"),
        ]
    );
    node.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_upgrading_cluster() {
    let service = MemoryCoordinator::new();
    let mut nodes = Vec::new();
    for _ in 0..3 {
        nodes.push(TestNode::join(&service, &["v1"]).await);
    }
    for node in &mut nodes {
        node.start();
    }
    for node in &nodes {
        node.wait_serving("v1").await;
    }

    for next in ["v2", "v3"] {
        for node in &nodes {
            node.make_available(next);
            node.node.reload();
        }
        for node in &nodes {
            node.wait_serving(next).await;
        }
    }

    for node in nodes {
        assert_eq!(
            node.progression(),
            vec![
                ObservedState::Down,
                ObservedState::NoVersion,
                serving("v1"),
                serving("v2"),
                serving("v3"),
            ]
        );
        assert!(node.progression.lock().is_monotonic());
        node.shutdown().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_delayed_upgrade() {
    let service = MemoryCoordinator::new();
    let mut nodes = Vec::new();
    for _ in 0..3 {
        nodes.push(TestNode::join(&service, &["v1"]).await);
    }
    for node in &mut nodes {
        node.start();
    }
    for node in &nodes {
        node.wait_serving("v1").await;
    }

    // Only the first node sees v2
    nodes[0].make_available("v2");
    assert_eq!(nodes[0].coordinator().converge().await.unwrap(), Some(v("v2")));
    for node in &nodes[1..] {
        assert_eq!(node.coordinator().converge().await.unwrap(), Some(v("v1")));
    }

    let leader = nodes[0].node.identity().to_string();
    nodes[1]
        .wait_view(|view| view.published(&leader) == Some(&v("v2")))
        .await;
    assert_eq!(nodes[1].served(), Some(v("v1")));

    for node in &nodes[1..] {
        node.make_available("v2");
        node.node.reload();
    }
    for node in &nodes {
        node.wait_serving("v2").await;
    }

    for node in nodes {
        assert_eq!(
            node.progression(),
            vec![
                ObservedState::Down,
                ObservedState::NoVersion,
                serving("v1"),
                serving("v2"),
            ]
        );
        node.shutdown().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_no_downgrade() {
    let service = MemoryCoordinator::new();
    let mut node = TestNode::join(&service, &["v3"]).await;
    node.start();
    node.wait_serving("v3").await;

    remove_version(node.backend.path(), "v3");
    node.make_available("v2");
    node.node.reload();
    assert_eq!(node.coordinator().converge().await.unwrap(), Some(v("v3")));

    // The publication follows what is available, serving does not
    let identity = node.node.identity().to_string();
    node.wait_view(|view| view.published(&identity) == Some(&v("v2")))
        .await;
    assert_eq!(node.served(), Some(v("v3")));
    assert_eq!(node.coordinator().controller().get("bob").unwrap(), "v3");

    assert_eq!(
        node.progression(),
        vec![ObservedState::Down, ObservedState::NoVersion, serving("v3")]
    );
    node.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_late_join_skips_no_version() {
    let service = MemoryCoordinator::new();
    let mut early = Vec::new();
    for _ in 0..2 {
        early.push(TestNode::join(&service, &["v3"]).await);
    }
    for node in &mut early {
        node.start();
    }
    for node in &early {
        node.wait_serving("v3").await;
    }

    let mut late = TestNode::join(&service, &["v1", "v3"]).await;
    assert_eq!(late.served(), Some(v("v3")));
    late.start();
    late.wait_serving("v3").await;

    assert_eq!(late.progression(), vec![ObservedState::Down, serving("v3")]);

    late.shutdown().await;
    for node in early {
        node.shutdown().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_late_join_adopts_what_siblings_serve() {
    let service = MemoryCoordinator::new();
    let mut early = TestNode::join(&service, &["v2"]).await;
    early.start();
    early.wait_serving("v2").await;

    // Joins on the version in use, then moves up on its first cycle
    let mut late = TestNode::join(&service, &["v1", "v2", "v3"]).await;
    assert_eq!(late.served(), Some(v("v2")));
    late.start();
    late.wait_serving("v3").await;

    assert_eq!(
        late.progression(),
        vec![ObservedState::Down, serving("v2"), serving("v3")]
    );

    late.shutdown().await;
    early.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_node_without_data() {
    let service = MemoryCoordinator::new();
    let mut serving_node = TestNode::join(&service, &["v1"]).await;
    let mut empty = TestNode::join(&service, &[]).await;
    serving_node.start();
    empty.start();
    serving_node.wait_serving("v1").await;

    let identity = empty.node.identity().to_string();
    serving_node
        .wait_view(|view| view.contains(&identity) && view.published(&identity).is_none())
        .await;

    assert_eq!(empty.served(), None);
    assert_eq!(
        empty.progression(),
        vec![ObservedState::Down, ObservedState::NoVersion]
    );

    // Once the data shows up it converges like everyone else
    empty.make_available("v1");
    empty.node.reload();
    empty.wait_serving("v1").await;

    empty.shutdown().await;
    serving_node.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_views_show_every_node() {
    let service = MemoryCoordinator::new();
    let mut nodes = Vec::new();
    for _ in 0..3 {
        nodes.push(TestNode::join(&service, &["v1"]).await);
    }
    for node in &mut nodes {
        node.start();
    }

    let identities: Vec<String> = nodes
        .iter()
        .map(|n| n.node.identity().to_string())
        .collect();
    for node in &nodes {
        node.wait_view(|view| {
            view.len() == 3
                && identities
                    .iter()
                    .all(|id| view.published(id) == Some(&v("v1")))
        })
        .await;
    }

    let status = nodes[0].node.status();
    assert_eq!(status.identity, identities[0]);
    assert_eq!(status.datasets[DATASET].version, Some(v("v1")));
    assert_eq!(status.datasets[DATASET].records, 2);

    // A node that leaves disappears from the others' views
    let leaving = nodes.pop().unwrap();
    let gone = leaving.node.identity().to_string();
    leaving.shutdown().await;
    for node in &nodes {
        node.wait_view(|view| view.len() == 2 && !view.contains(&gone))
            .await;
    }

    for node in nodes {
        node.shutdown().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_coordination_restart_then_upgrade() {
    let service = MemoryCoordinator::new();
    let mut nodes = Vec::new();
    for _ in 0..2 {
        nodes.push(TestNode::join(&service, &["v1"]).await);
    }
    for node in &mut nodes {
        node.start();
    }
    for node in &nodes {
        node.wait_serving("v1").await;
    }

    service.restart();
    for node in &nodes {
        let mut states = node.node.coordination_state();
        let reconnected = tokio::time::timeout(
            WAIT,
            states.wait_for(|s| *s == ConnectionState::Connected { generation: 2 }),
        )
        .await;
        assert!(matches!(reconnected, Ok(Ok(_))));

        // Still serving through the outage
        assert_eq!(node.served(), Some(v("v1")));
        let path = format!("/cluster-test/{}/{}", DATASET, node.node.identity());
        assert_eq!(service.data(&path), Some(b"v1".to_vec()));
    }

    for node in &nodes {
        node.make_available("v2");
        node.node.reload();
    }
    let identities: Vec<String> = nodes
        .iter()
        .map(|n| n.node.identity().to_string())
        .collect();
    for node in &nodes {
        node.wait_serving("v2").await;
        node.wait_view(|view| {
            identities
                .iter()
                .all(|id| view.published(id) == Some(&v("v2")))
        })
        .await;
    }

    for node in nodes {
        assert_eq!(
            node.progression(),
            vec![
                ObservedState::Down,
                ObservedState::NoVersion,
                serving("v1"),
                serving("v2"),
            ]
        );
        node.shutdown().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_upgrade_during_short_outage_is_published() {
    let service = MemoryCoordinator::new();
    let mut node = TestNode::join(&service, &["v1"]).await;
    node.start();
    node.wait_serving("v1").await;
    let path = format!("/cluster-test/{}/{}", DATASET, node.node.identity());
    let identity = node.node.identity().to_string();

    // Publishing fails while the service is down, but the upgrade still lands
    service.stop();
    let mut states = node.node.coordination_state();
    let lost = tokio::time::timeout(
        WAIT,
        states.wait_for(|s| *s == ConnectionState::Disconnected),
    )
    .await;
    assert!(matches!(lost, Ok(Ok(_))));
    drop(lost);
    node.make_available("v2");
    assert_eq!(node.coordinator().converge().await.unwrap(), Some(v("v2")));
    assert_eq!(service.data(&path), Some(b"v1".to_vec()));

    // The session survives; the publication catches up on resume
    service.start();
    let resumed = tokio::time::timeout(
        WAIT,
        states.wait_for(|s| *s == ConnectionState::Connected { generation: 1 }),
    )
    .await;
    assert!(matches!(resumed, Ok(Ok(_))));
    drop(resumed);
    let published = tokio::time::timeout(WAIT, async {
        while service.data(&path) != Some(b"v2".to_vec()) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(published.is_ok(), "{} still advertises v1", identity);
    node.wait_view(|view| view.published(&identity) == Some(&v("v2")))
        .await;

    node.shutdown().await;
}
