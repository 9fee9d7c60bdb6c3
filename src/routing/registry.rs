//! Virtual host registry.
//!
//! # Responsibilities
//! - Index vhosts by (bind IP, bind port, domain)
//! - Resolve a request with the four-tier fallback
//! - Swap in a new snapshot on reload without blocking readers
//!
//! # Design Decisions
//! - The index is immutable; `install` builds a new one and stores it
//!   with `ArcSwap`, so an in-flight lookup always sees one consistent
//!   snapshot
//! - Duplicate site keys keep the first vhost and log a warning

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::config::schema::VhostConfig;
use crate::routing::matcher::wildcard_of;
use crate::routing::vhost::{VhostDefaults, VirtualHost};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SiteKey {
    ip: IpAddr,
    port: u16,
    domain: String,
}

/// One immutable generation of the vhost table.
#[derive(Debug, Default)]
pub struct VhostIndex {
    sites: HashMap<SiteKey, Arc<VirtualHost>>,
    vhosts: Vec<Arc<VirtualHost>>,
}

impl VhostIndex {
    pub fn build(vhosts: Vec<VirtualHost>) -> Self {
        let mut index = Self::default();

        for vhost in vhosts {
            let vhost = Arc::new(vhost);
            for bind in vhost.all_binds() {
                for mapping in &vhost.hosts {
                    let key = SiteKey {
                        ip: bind.ip().to_canonical(),
                        port: bind.port(),
                        domain: mapping.domain.clone(),
                    };
                    match index.sites.get(&key) {
                        Some(existing) if existing.name != vhost.name => {
                            tracing::warn!(
                                bind = %bind,
                                domain = %mapping.domain,
                                kept = %existing.name,
                                ignored = %vhost.name,
                                "Duplicate site, keeping first vhost"
                            );
                        }
                        Some(_) => {}
                        None => {
                            index.sites.insert(key, vhost.clone());
                        }
                    }
                }
            }
            index.vhosts.push(vhost);
        }

        index
    }

    /// Four-tier lookup: exact IP + exact domain, any IP + exact domain,
    /// exact IP + wildcard domain, any IP + wildcard domain.
    pub fn matching_vhost(&self, ip: IpAddr, port: u16, domain: &str) -> Option<Arc<VirtualHost>> {
        let ip = ip.to_canonical();
        let any = unspecified_for(ip);
        let wildcard = wildcard_of(domain);

        let tiers = [
            (ip, domain),
            (any, domain),
            (ip, wildcard.as_str()),
            (any, wildcard.as_str()),
        ];

        tiers.iter().find_map(|(ip, domain)| {
            self.sites
                .get(&SiteKey {
                    ip: *ip,
                    port,
                    domain: domain.to_string(),
                })
                .cloned()
        })
    }

    pub fn get(&self, name: &str) -> Option<Arc<VirtualHost>> {
        self.vhosts.iter().find(|v| v.name == name).cloned()
    }

    pub fn vhosts(&self) -> &[Arc<VirtualHost>] {
        &self.vhosts
    }
}

fn unspecified_for(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    }
}

/// Shared, atomically replaceable vhost table.
pub struct VhostRegistry {
    current: ArcSwap<VhostIndex>,
    defaults: VhostDefaults,
}

impl VhostRegistry {
    pub fn new(defaults: VhostDefaults) -> Self {
        Self {
            current: ArcSwap::from_pointee(VhostIndex::default()),
            defaults,
        }
    }

    /// Compile `configs` and make them the current generation.
    ///
    /// A vhost that fails to compile is skipped and logged. Returns the
    /// number of vhosts installed.
    pub fn install(&self, configs: &[VhostConfig]) -> usize {
        let compiled: Vec<VirtualHost> = configs
            .iter()
            .filter_map(|cfg| match VirtualHost::compile(cfg, &self.defaults) {
                Ok(vhost) => Some(vhost),
                Err(e) => {
                    tracing::error!(error = %e, "Skipping vhost");
                    None
                }
            })
            .collect();

        let count = compiled.len();
        self.current.store(Arc::new(VhostIndex::build(compiled)));
        tracing::info!(vhosts = count, "Vhost table installed");
        count
    }

    pub fn snapshot(&self) -> Arc<VhostIndex> {
        self.current.load_full()
    }

    pub fn matching_vhost(&self, ip: IpAddr, port: u16, domain: &str) -> Option<Arc<VirtualHost>> {
        self.current.load().matching_vhost(ip, port, domain)
    }

    pub fn get(&self, name: &str) -> Option<Arc<VirtualHost>> {
        self.current.load().get(name)
    }
}
