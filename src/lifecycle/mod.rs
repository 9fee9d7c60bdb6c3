//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Shutdown (shutdown.rs):
//!     Signal received → Stop accepting → Drain connections → Exit
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown
//!
//! Background work (tasks.rs):
//!     cache store / access log write / IP block
//!         → TaskQueue::submit (never blocks)
//!         → dispatcher → bounded concurrent execution
//! ```
//!
//! # Design Decisions
//! - Shutdown is broadcast so every long-running task observes it
//! - Fire-and-forget side effects go through one bounded queue so drops
//!   and failures are counted instead of lost

pub mod shutdown;
pub mod signals;
pub mod tasks;

pub use shutdown::Shutdown;
pub use tasks::{TaskError, TaskQueue, TaskStats};
