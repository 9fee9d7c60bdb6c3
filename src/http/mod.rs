//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP/TLS connection
//!     → server.rs (axum wiring, body buffering, request ID)
//!     → request.rs (ProxyRequest: normalized host, URL helpers)
//!     → pipeline (filters answer the request)
//!     → response.rs (synthetic responses with consistent framing)
//!     → Send to client
//! ```

pub mod request;
pub mod response;
pub mod server;

pub use request::{ProxyRequest, Scheme, X_REQUEST_ID};
pub use response::ProxyResponse;
pub use server::{EdgeServer, ServerError};
