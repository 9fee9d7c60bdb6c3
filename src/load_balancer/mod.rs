//! Upstream proxying and load balancing.
//!
//! # Data Flow
//! ```text
//! Request with vhost attached
//!     → filter.rs (domain → origin or upstream group)
//!     → pool.rs (weighted round robin over members that are up)
//!     → upstream.rs (throttle.rs admission, outbound request)
//!     → transport.rs (cached DNS, dial timeout, idle connection reuse)
//!     → response streamed back, or 502/504
//! ```
//!
//! # Design Decisions
//! - One transport per origin, shared by every request to it
//! - A proxied failure marks the pool member down; only a probe brings it
//!   back
//! - Concurrency limits park requests instead of rejecting them

pub mod filter;
pub mod pool;
pub mod round_robin;
pub mod throttle;
pub mod transport;
pub mod upstream;

pub use filter::UpstreamFilter;
pub use pool::{PoolState, UpstreamPool};
pub use transport::{TransportSettings, UpstreamError, UpstreamTransport};
pub use upstream::Upstream;
