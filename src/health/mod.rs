//! Health checking for upstream pools.
//!
//! # Data Flow
//! ```text
//! Periodic timer (per pool)
//!     → active.rs pings every member
//!     → member weight restored (200) or zeroed (anything else)
//! ```
//!
//! Failures observed while proxying are handled by the pool itself; they
//! only ever take a member out of rotation.

pub mod active;
