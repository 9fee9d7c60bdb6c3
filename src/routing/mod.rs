//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming request (local addr, Host header)
//!     → router.rs (VhostRouter request filter)
//!     → registry.rs (four-tier lookup on the current snapshot)
//!     → matched VirtualHost attached to the request context, or 404
//!
//! Vhost compilation (startup and reload):
//!     VhostConfig[]
//!     → vhost.rs (parse binds, compile cache regexes, apply defaults)
//!     → registry.rs (index by ip/port/domain, atomic swap)
//! ```
//!
//! # Design Decisions
//! - Vhosts compiled up front, immutable at runtime
//! - Exact domain beats wildcard; exact IP beats 0.0.0.0 for the same domain
//! - Deterministic: same input always matches same vhost

pub mod matcher;
pub mod registry;
pub mod router;
pub mod vhost;

pub use registry::{VhostIndex, VhostRegistry};
pub use router::VhostRouter;
pub use vhost::{DdosPolicy, HostMapping, Limits, VhostDefaults, VirtualHost};
