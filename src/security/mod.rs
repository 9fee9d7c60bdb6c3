//! Security subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming request (vhost resolved):
//!     → access_control.rs (pause, http→https, black/white lists)
//!     → ddos.rs (rate window, challenge issuance and verification)
//!         → throttle.rs (per-vhost NORMAL/CHALLENGING state)
//!         → client_state.rs (per-client token, pass marker, failures)
//!         → captcha.rs (image sessions)
//!         → block.rs (firewall side channel, background)
//!     → continue to cache / upstream
//! ```
//!
//! # Design Decisions
//! - Whitelist beats blacklist; it also exempts requests from the rate count
//! - Side effects (IP blocks) never delay the response

pub mod access_control;
pub mod block;
pub mod captcha;
pub mod challenge;
pub mod client_state;
pub mod ddos;
pub mod throttle;

pub use access_control::StatusFilter;
pub use ddos::DdosFilter;
