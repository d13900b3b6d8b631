//! Runtime signals
//!
//! Shutdown and reload broadcasts shared by the node's background tasks.

pub mod reload;
pub mod shutdown;

pub use reload::{ReloadListener, ReloadTrigger};
pub use shutdown::ShutdownSignal;
