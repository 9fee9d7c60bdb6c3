//! Request-scoped state shared between filters.

use std::ops::{BitOr, BitOrAssign};
use std::sync::Arc;

use crate::routing::VirtualHost;

/// Independent outcomes attached to one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct RequestStatus(u8);

impl RequestStatus {
    pub const NONE: Self = Self(0);
    /// Served a DDoS challenge.
    pub const DDOS: Self = Self(1);
    pub const BLACKLIST: Self = Self(1 << 1);
    pub const WHITELIST: Self = Self(1 << 2);
    /// Served from the response cache.
    pub const CACHE_HIT: Self = Self(1 << 3);
    /// The upstream round trip failed.
    pub const UPSTREAM_FAILED: Self = Self(1 << 4);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn bits(self) -> u8 {
        self.0
    }
}

impl BitOr for RequestStatus {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for RequestStatus {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Typed per-request context. Filters write it, later filters read it.
#[derive(Debug, Default, Clone)]
pub struct RequestContext {
    /// Resolved virtual host; `None` until the router filter runs.
    pub vhost: Option<Arc<VirtualHost>>,
    pub blacklisted: bool,
    pub whitelisted: bool,
    pub status: RequestStatus,
}

impl RequestContext {
    pub fn vhost_name(&self) -> &str {
        self.vhost.as_deref().map(|v| v.name.as_str()).unwrap_or("-")
    }
}
