//! Cooperative cancellation for batch runs.
//!
//! This module provides:
//! - [`CancellationToken`], the shared flag the executor polls between items
//! - [`ShutdownCoordinator`], which turns SIGINT/SIGTERM into a token cancel

mod shutdown;
mod token;

pub use shutdown::ShutdownCoordinator;
pub use token::CancellationToken;
