//! Shared service plumbing for the meter services and tools
//!
//! - logging bootstrap
//! - shutdown signal handling

pub mod logging;
pub mod shutdown;

pub use logging::{init_logging, LogConfig};
pub use shutdown::{cancel_on_shutdown, wait_for_shutdown};
