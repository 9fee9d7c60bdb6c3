//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured tracing events, text or JSON)
//!     → metrics.rs (counters and gauges behind the `metrics` facade)
//!
//! Response pipeline:
//!     → access_log.rs (Server header, per-vhost access lines)
//! ```
//!
//! # Design Decisions
//! - Request ID flows through logs, access lines and upstream requests
//! - Access lines are written by the background queue, never inline

pub mod access_log;
pub mod logging;
pub mod metrics;

pub use access_log::CommonLogger;
