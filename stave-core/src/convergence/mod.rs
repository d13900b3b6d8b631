//! Version convergence
//!
//! Each node publishes its highest available version per dataset, watches
//! what its siblings publish, and adopts new versions without ever moving
//! backwards.

pub mod coordinator;
pub mod view;

pub use coordinator::{ConvergenceConfig, ConvergenceCoordinator, DatasetStatus};
pub use view::{join_candidates, upgrade_candidates, ClusterView};
