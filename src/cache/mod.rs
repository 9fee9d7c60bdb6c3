//! Two-tier response cache.
//!
//! - `rules`: which requests are cacheable and under which key
//! - `record`: the serialized response
//! - `store`: memory LRU over disk files
//! - `filter`: the pipeline stages

pub mod filter;
pub mod record;
pub mod rules;
pub mod store;

pub use filter::ResponseCache;
pub use record::CachedResponse;
pub use store::{CacheError, DiskStore, Store};
