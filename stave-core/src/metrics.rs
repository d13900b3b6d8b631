//! Prometheus metrics for monitoring
//!
//! Counters, gauges, and histograms rendered in the Prometheus text format.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Instant;

/// Counter metric (monotonically increasing)
pub struct Counter {
    value: AtomicU64,
    name: &'static str,
    help: &'static str,
}

impl Counter {
    /// Create a new counter
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            value: AtomicU64::new(0),
            name,
            help,
        }
    }

    /// Increment by 1
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment by delta
    pub fn inc_by(&self, delta: u64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    /// Get current value
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Format as Prometheus metric
    pub fn to_prometheus(&self) -> String {
        format!(
            "# HELP {} {}\n# TYPE {} counter\n{} {}\n",
            self.name, self.help, self.name, self.name, self.get()
        )
    }
}

/// Gauge metric (can go up or down)
pub struct Gauge {
    value: AtomicI64,
    name: &'static str,
    help: &'static str,
}

impl Gauge {
    /// Create a new gauge
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            value: AtomicI64::new(0),
            name,
            help,
        }
    }

    /// Set value
    pub fn set(&self, val: i64) {
        self.value.store(val, Ordering::Relaxed);
    }

    /// Increment by 1
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement by 1
    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    /// Get current value
    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Format as Prometheus metric
    pub fn to_prometheus(&self) -> String {
        format!(
            "# HELP {} {}\n# TYPE {} gauge\n{} {}\n",
            self.name, self.help, self.name, self.name, self.get()
        )
    }
}

/// Histogram for latency measurements
pub struct Histogram {
    buckets: Vec<(f64, AtomicU64)>,
    sum: AtomicU64,
    count: AtomicU64,
    name: &'static str,
    help: &'static str,
}

impl Histogram {
    /// Create with default buckets
    pub fn new(name: &'static str, help: &'static str) -> Self {
        Self::with_buckets(
            name,
            help,
            vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0],
        )
    }

    /// Create with custom buckets
    pub fn with_buckets(name: &'static str, help: &'static str, bounds: Vec<f64>) -> Self {
        let buckets = bounds
            .into_iter()
            .map(|b| (b, AtomicU64::new(0)))
            .collect();

        Self {
            buckets,
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
            name,
            help,
        }
    }

    /// Observe a value in seconds
    pub fn observe(&self, value: f64) {
        self.count.fetch_add(1, Ordering::Relaxed);

        // Sum kept in micros
        let micros = (value * 1_000_000.0) as u64;
        self.sum.fetch_add(micros, Ordering::Relaxed);

        for (bound, count) in &self.buckets {
            if value <= *bound {
                count.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Time a closure and record the duration
    pub fn time<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let start = Instant::now();
        let result = f();
        self.observe(start.elapsed().as_secs_f64());
        result
    }

    /// Number of observations
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Format as Prometheus metric
    pub fn to_prometheus(&self) -> String {
        let mut output = format!(
            "# HELP {} {}\n# TYPE {} histogram\n",
            self.name, self.help, self.name
        );

        for (bound, count) in &self.buckets {
            output.push_str(&format!(
                "{}_bucket{{le=\"{}\"}} {}\n",
                self.name,
                bound,
                count.load(Ordering::Relaxed)
            ));
        }
        output.push_str(&format!(
            "{}_bucket{{le=\"+Inf\"}} {}\n",
            self.name,
            self.count()
        ));

        let sum_secs = self.sum.load(Ordering::Relaxed) as f64 / 1_000_000.0;
        output.push_str(&format!("{}_sum {}\n", self.name, sum_secs));
        output.push_str(&format!("{}_count {}\n", self.name, self.count()));

        output
    }
}

/// Standard Stave metrics
pub mod standard {
    use super::*;
    use std::sync::LazyLock;

    pub static RESCANS: Counter =
        Counter::new("stave_rescans_total", "Total backend rescans");

    pub static RELOADS: Counter =
        Counter::new("stave_reloads_total", "Total reload triggers received");

    pub static VERSIONS_LOADED: Counter =
        Counter::new("stave_versions_loaded_total", "Total versions loaded into the local store");

    pub static BYTES_LOADED: Counter =
        Counter::new("stave_bytes_loaded_total", "Total bytes copied from the backend");

    pub static LOAD_FAILURES: Counter =
        Counter::new("stave_load_failures_total", "Candidate versions skipped after a load error");

    pub static VERSION_SWAPS: Counter =
        Counter::new("stave_version_swaps_total", "Total serving version swaps");

    pub static RECONNECTS: Counter =
        Counter::new("stave_coordination_reconnects_total", "Coordination sessions re-established");

    pub static SNAPSHOTS_DELIVERED: Counter =
        Counter::new("stave_watch_snapshots_total", "Child snapshots delivered to subscribers");

    pub static LIVE_SUBSCRIPTIONS: Gauge =
        Gauge::new("stave_watch_subscriptions", "Live watch subscriptions");

    pub static REQUESTS: Counter =
        Counter::new("stave_requests_total", "Total key lookups served");

    pub static LOAD_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
        Histogram::new("stave_load_duration_seconds", "Version load latency")
    });

    pub static CONVERGE_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
        Histogram::new("stave_converge_duration_seconds", "Convergence cycle latency")
    });
}

/// Helper to gather all standard metrics
pub fn gather_system_metrics() -> String {
    let mut output = String::new();

    // Counters
    output.push_str(&standard::RESCANS.to_prometheus());
    output.push_str(&standard::RELOADS.to_prometheus());
    output.push_str(&standard::VERSIONS_LOADED.to_prometheus());
    output.push_str(&standard::BYTES_LOADED.to_prometheus());
    output.push_str(&standard::LOAD_FAILURES.to_prometheus());
    output.push_str(&standard::VERSION_SWAPS.to_prometheus());
    output.push_str(&standard::RECONNECTS.to_prometheus());
    output.push_str(&standard::SNAPSHOTS_DELIVERED.to_prometheus());
    output.push_str(&standard::REQUESTS.to_prometheus());

    // Gauges
    output.push_str(&standard::LIVE_SUBSCRIPTIONS.to_prometheus());

    // Histograms
    output.push_str(&standard::LOAD_DURATION.to_prometheus());
    output.push_str(&standard::CONVERGE_DURATION.to_prometheus());

    output
}
