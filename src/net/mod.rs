//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Vhost bind address
//!     → listener.rs (plain: bounded accept loop)
//!     → tls.rs (TLS: SNI certificate selection)
//!     → hand off to the HTTP layer
//! ```
//!
//! # Design Decisions
//! - One listener per distinct bind address, shared by every vhost on it
//! - A listener that fails to bind never takes the others down

pub mod listener;
pub mod tls;

pub use listener::{BoundedListener, ClientAddr, ListenerError};
pub use tls::{CertBinding, SniResolver, TlsError};
