//! Stave Core - Versioned dataset serving with coordinated rollouts
//!
//! This crate provides the pieces of a serving node:
//! - Session-resilient watches and ephemeral nodes over a coordination service
//! - Scanning and loading of complete dataset versions
//! - Per-dataset version convergence that never moves backwards
//! - Atomic swaps of the served version behind an HTTP surface

pub mod config;
pub mod convergence;
pub mod coordination;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod node;
pub mod probe;
pub mod runtime;
pub mod serving;
pub mod version;

pub use config::NodeConfig;
pub use error::{Result, StaveError};
pub use node::Node;
pub use version::Version;

/// Response header carrying the served version
pub const VERSION_HEADER: &str = "x-stave-version";

/// Completion marker written last into a version directory
pub const DEFAULT_SUCCESS_FILE: &str = "_SUCCESS";

/// Default coordination namespace
pub const DEFAULT_NAMESPACE: &str = "stave";

/// Default HTTP port
pub const DEFAULT_PORT: u16 = 9599;
