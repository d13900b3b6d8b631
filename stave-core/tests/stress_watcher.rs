//! Stress tests for the coordination watcher under churn
//!
//! Run with: cargo test --release --test stress_watcher -- --nocapture

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use stave_core::coordination::{
    ConnectionState, CoordinationWatcher, MemoryCoordinator, WatcherConfig,
};

const WAIT: Duration = Duration::from_secs(20);

async fn connect(service: &MemoryCoordinator) -> CoordinationWatcher {
    CoordinationWatcher::connect(Arc::new(service.clone()), config())
        .await
        .unwrap()
}

fn config() -> WatcherConfig {
    WatcherConfig {
        namespace: "stress".into(),
        operation_timeout: Duration::from_secs(5),
        reconnect_backoff: Duration::from_millis(5),
        max_reconnect_attempts: 0,
    }
}

/// Many paths, each with several subscribers, through repeated restarts
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stress_subscriptions_across_restarts() {
    let num_paths = 50;
    let subscribers_per_path = 4;
    let restarts = 5u64;

    let service = MemoryCoordinator::new();
    let watcher = CoordinationWatcher::connect(Arc::new(service.clone()), config())
        .await
        .unwrap();

    let mut streams = Vec::new();
    for p in 0..num_paths {
        for _ in 0..subscribers_per_path {
            let (updates, _) = watcher.watch_children(&format!("/path-{}", p)).unwrap();
            streams.push((p, updates));
        }
    }
    assert_eq!(watcher.live_subscriptions(), num_paths);

    let start = Instant::now();
    for generation in 2..=restarts + 1 {
        service.restart();
        let mut states = watcher.state_changes();
        let reconnected = tokio::time::timeout(
            WAIT,
            states.wait_for(|s| *s == ConnectionState::Connected { generation }),
        )
        .await;
        assert!(matches!(reconnected, Ok(Ok(_))));
    }
    let restart_elapsed = start.elapsed();

    // Every path ends up with exactly one pending watch
    let settled = tokio::time::timeout(WAIT, async {
        while (0..num_paths)
            .any(|p| service.pending_watches(&format!("/stress/path-{}", p)) != 1)
        {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(settled.is_ok());

    let writer = CoordinationWatcher::connect(Arc::new(service.clone()), config())
        .await
        .unwrap();
    for p in 0..num_paths {
        writer
            .create_ephemeral(&format!("/path-{}/child", p), b"")
            .await
            .unwrap();
    }

    let expected: BTreeSet<String> = ["child".to_string()].into_iter().collect();
    let start = Instant::now();
    for (p, updates) in &mut streams {
        let delivered = tokio::time::timeout(WAIT, async {
            while let Some(snapshot) = updates.recv().await {
                if snapshot == expected {
                    return true;
                }
            }
            false
        })
        .await;
        assert!(matches!(delivered, Ok(true)), "path-{} never saw its child", p);
    }
    let delivery_elapsed = start.elapsed();

    println!("Watcher restart stress test:");
    println!("  Paths: {}", num_paths);
    println!("  Subscribers: {}", streams.len());
    println!("  Restarts: {}", restarts);
    println!("  Restart elapsed: {:?}", restart_elapsed);
    println!("  Delivery elapsed: {:?}", delivery_elapsed);

    writer.close().await;
    watcher.close().await;
}

/// Subscribe and remove repeatedly; nothing leaks
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stress_subscribe_remove_churn() {
    let rounds = 200;

    let service = MemoryCoordinator::new();
    let watcher = CoordinationWatcher::connect(Arc::new(service.clone()), config())
        .await
        .unwrap();

    let start = Instant::now();
    for round in 0..rounds {
        let path = format!("/churn-{}", round % 10);
        let (mut updates, _) = watcher.watch_children(&path).unwrap();
        let first = tokio::time::timeout(WAIT, updates.recv()).await.unwrap();
        assert!(first.is_some());
        assert!(watcher.remove_watch(&path).unwrap());
    }
    let elapsed = start.elapsed();

    assert_eq!(watcher.live_subscriptions(), 0);
    let drained = tokio::time::timeout(WAIT, async {
        while (0..10).any(|i| service.pending_watches(&format!("/stress/churn-{}", i)) > 0) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(drained.is_ok());

    println!("Watcher churn stress test:");
    println!("  Rounds: {}", rounds);
    println!("  Elapsed: {:?}", elapsed);
    println!("  Avg per round: {:?}", elapsed / rounds as u32);

    watcher.close().await;
}

/// Remove a watch from another task while a writer keeps changing the children
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stress_remove_watch_during_writes() {
    let rounds = 50u64;

    let service = MemoryCoordinator::new();
    let watcher = Arc::new(connect(&service).await);
    let writer = Arc::new(connect(&service).await);

    let writing = Arc::new(AtomicBool::new(true));
    let writes = tokio::spawn({
        let writer = writer.clone();
        let writing = writing.clone();
        async move {
            let mut count = 0u64;
            while writing.load(Ordering::Relaxed) {
                let path = format!("/busy/child-{}", count % 8);
                writer.create_ephemeral(&path, b"").await.unwrap();
                writer.remove_ephemeral(&path).await.unwrap();
                count += 1;
            }
            count
        }
    });

    let start = Instant::now();
    let mut delivered = 0usize;
    for round in 0..rounds {
        let (mut updates, mut disconnected) = watcher.watch_children("/busy").unwrap();
        let first = tokio::time::timeout(WAIT, updates.recv()).await.unwrap();
        assert!(first.is_some());

        let remover = tokio::spawn({
            let watcher = watcher.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(round % 5)).await;
                watcher.remove_watch("/busy")
            }
        });

        let drained = tokio::time::timeout(WAIT, async {
            let mut seen = 0usize;
            while updates.recv().await.is_some() {
                seen += 1;
            }
            seen
        })
        .await;
        assert!(drained.is_ok(), "round {} updates never ended", round);
        delivered += drained.unwrap_or(0);
        assert_eq!(
            tokio::time::timeout(WAIT, disconnected.recv()).await.unwrap(),
            None
        );

        assert!(remover.await.unwrap().unwrap());
        assert_eq!(watcher.live_subscriptions(), 0);
    }
    let elapsed = start.elapsed();

    writing.store(false, Ordering::Relaxed);
    let writes = writes.await.unwrap();

    let drained = tokio::time::timeout(WAIT, async {
        while service.pending_watches("/stress/busy") > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(drained.is_ok());
    assert_eq!(watcher.live_subscriptions(), 0);

    println!("Watcher remove-under-writes stress test:");
    println!("  Rounds: {}", rounds);
    println!("  Writes: {}", writes);
    println!("  Snapshots delivered after the first: {}", delivered);
    println!("  Elapsed: {:?}", elapsed);

    writer.close().await;
    watcher.close().await;
}
