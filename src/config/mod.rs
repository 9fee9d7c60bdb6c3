//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config.toml (+ vhost_dir/*.toml)
//!     → loader.rs (parse & merge)
//!     → validation.rs (semantic checks)
//!     → ProxyConfig (validated, immutable)
//!     → routing::VhostRegistry::install (arc-swap snapshot)
//!
//! On file change:
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → new snapshot installed, old one dropped by its last reader
//! ```
//!
//! # Design Decisions
//! - Vhosts are never mutated in place; reload replaces them wholesale
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, ConfigError};
pub use schema::{CidrMode, ProxyConfig, VhostConfig, VhostStatus};
