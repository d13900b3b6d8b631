//! Request-path probing
//!
//! Observes a node the way a client does and classifies it as down,
//! reachable with no version, or serving a version.

use serde::Serialize;
use std::time::Duration;
use tracing::debug;

use crate::config::NodeConfig;
use crate::error::{Result, StaveError};
use crate::version::Version;
use crate::VERSION_HEADER;

/// A node's state as seen through its request interface.
///
/// Ordered `Down < NoVersion < Serving(v)`, serving states by version.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum ObservedState {
    /// Unreachable or failing
    Down,
    /// Reachable, serving nothing
    NoVersion,
    /// Serving a version
    Serving(Version),
}

impl std::fmt::Display for ObservedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ObservedState::Down => write!(f, "down"),
            ObservedState::NoVersion => write!(f, "no-version"),
            ObservedState::Serving(v) => write!(f, "{}", v),
        }
    }
}

/// Result of a single probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// A definitive answer
    Observed(ObservedState),
    /// Timed out; the previous state stands
    Ambiguous,
}

/// Classify a response by status code and version header
pub fn classify(status: u16, version: Option<&str>) -> ObservedState {
    if status > 404 {
        return ObservedState::Down;
    }
    match version.map(str::trim) {
        None | Some("") => ObservedState::NoVersion,
        Some(v) => ObservedState::Serving(Version::new(v)),
    }
}

/// Probes one node's request interface
pub struct NodeProbe {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl NodeProbe {
    /// Probe `GET http://{addr}/{dataset}/{key}` with `timeout` per request
    pub fn new(addr: &str, dataset: &str, key: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StaveError::Internal {
                message: format!("building probe client: {}", e),
            })?;
        Ok(Self {
            client,
            url: format!("http://{}/{}/{}", addr, dataset, key),
            timeout,
        })
    }

    /// Probe a node bounded by the configured `proxy_timeout_ms`
    pub fn for_node(config: &NodeConfig, addr: &str, dataset: &str, key: &str) -> Result<Self> {
        Self::new(addr, dataset, key, config.proxy_timeout())
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Probe once
    pub async fn probe(&self) -> ProbeOutcome {
        match self.client.get(&self.url).send().await {
            Ok(resp) => {
                let version = resp
                    .headers()
                    .get(VERSION_HEADER)
                    .and_then(|v| v.to_str().ok());
                ProbeOutcome::Observed(classify(resp.status().as_u16(), version))
            }
            Err(e) if e.is_timeout() => {
                debug!("Probe of {} timed out", self.url);
                ProbeOutcome::Ambiguous
            }
            Err(e) => {
                debug!("Probe of {} failed: {}", self.url, e);
                ProbeOutcome::Observed(ObservedState::Down)
            }
        }
    }

    /// Probe once, treating a timeout as an error
    pub async fn check(&self) -> Result<ObservedState> {
        match self.probe().await {
            ProbeOutcome::Observed(state) => Ok(state),
            ProbeOutcome::Ambiguous => Err(StaveError::ProbeAmbiguous {
                target: self.url.clone(),
            }),
        }
    }
}

/// Deduplicated sequence of observed states, starting at `Down`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Progression {
    states: Vec<ObservedState>,
}

impl Progression {
    pub fn new() -> Self {
        Self {
            states: vec![ObservedState::Down],
        }
    }

    /// Record a probe outcome. Returns true if it extended the progression.
    pub fn record(&mut self, outcome: ProbeOutcome) -> bool {
        match outcome {
            ProbeOutcome::Observed(state) => self.observe(state),
            ProbeOutcome::Ambiguous => false,
        }
    }

    /// Record a state unless it repeats the last one
    pub fn observe(&mut self, state: ObservedState) -> bool {
        if self.states.last() == Some(&state) {
            return false;
        }
        self.states.push(state);
        true
    }

    pub fn states(&self) -> &[ObservedState] {
        &self.states
    }

    pub fn last(&self) -> &ObservedState {
        self.states.last().unwrap_or(&ObservedState::Down)
    }

    /// True if every step moves strictly forward
    pub fn is_monotonic(&self) -> bool {
        self.states.windows(2).all(|w| w[0] < w[1])
    }
}

impl Default for Progression {
    fn default() -> Self {
        Self::new()
    }
}
