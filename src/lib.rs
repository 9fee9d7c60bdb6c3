//! CDN edge proxy library.
//!
//! Virtual hosts, access policy, DDoS challenges, response caching and
//! upstream load balancing, composed as a filter pipeline behind axum.

pub mod cache;
pub mod config;
pub mod health;
pub mod http;
pub mod lifecycle;
pub mod load_balancer;
pub mod net;
pub mod observability;
pub mod pipeline;
pub mod routing;
pub mod security;

pub use config::schema::ProxyConfig;
pub use http::EdgeServer;
pub use lifecycle::{Shutdown, TaskQueue};
