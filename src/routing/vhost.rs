//! Compiled virtual host.
//!
//! A `VirtualHost` is built once from its `VhostConfig` (addresses parsed,
//! regexes compiled, defaults applied) and then shared read-only behind an
//! `Arc`. Reload builds new ones; nothing mutates a live vhost.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::cache::rules::CacheRule;
use crate::config::schema::{
    CidrMode, LogConfig, ProxyConfig, UpstreamHostConfig, VhostConfig, VhostStatus,
};
use crate::routing::matcher::{normalize_domain, wildcard_of};
use crate::security::access_control::AccessList;
use crate::security::challenge::ChallengeMode;

const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(3);

/// Errors raised while compiling a vhost.
#[derive(Debug, Error)]
pub enum VhostError {
    #[error("vhost '{vhost}': invalid bind address '{addr}'")]
    InvalidBind { vhost: String, addr: String },

    #[error("vhost '{vhost}': cache rule #{index}: {source}")]
    InvalidRegex {
        vhost: String,
        index: usize,
        #[source]
        source: regex::Error,
    },
}

/// Process-wide values a vhost falls back to.
#[derive(Debug, Clone)]
pub struct VhostDefaults {
    pub max_cache_size: usize,
    pub cidr_mode: CidrMode,
}

impl VhostDefaults {
    pub fn from_config(config: &ProxyConfig) -> Self {
        Self {
            max_cache_size: config.cache.max_entry_size,
            cidr_mode: config.access.cidr_mode,
        }
    }
}

impl Default for VhostDefaults {
    fn default() -> Self {
        Self {
            max_cache_size: 1_000_000,
            cidr_mode: CidrMode::Legacy,
        }
    }
}

/// Domain -> origin mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostMapping {
    pub domain: String,
    pub origin_ip: String,
    /// 0 = same port the client connected to.
    pub origin_port: u16,
    pub group: Option<String>,
}

/// A TLS bind and its certificate pair.
#[derive(Debug, Clone)]
pub struct SslBinding {
    pub bind: SocketAddr,
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Limits {
    pub timeout: Duration,
    pub max_cache_size: usize,
    /// 0 = unbounded.
    pub max_concurrent: usize,
}

/// DDoS thresholds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DdosPolicy {
    pub request: u64,
    pub rtime: Duration,
    pub stime: Duration,
    pub mode: ChallengeMode,
    pub hits: u64,
    pub block_time: u64,
}

impl DdosPolicy {
    /// A zero window or zero threshold makes the DDoS filter inert.
    pub fn enabled(&self) -> bool {
        self.request > 0 && !self.rtime.is_zero()
    }
}

#[derive(Debug, Clone)]
pub struct VirtualHost {
    pub name: String,
    pub status: VhostStatus,
    pub binds: Vec<SocketAddr>,
    pub ssl: Vec<SslBinding>,
    pub hosts: Vec<HostMapping>,
    pub cache_rules: Vec<CacheRule>,
    pub limits: Limits,
    pub ddos: DdosPolicy,
    pub black_list: AccessList,
    pub white_list: AccessList,
    pub log: LogConfig,
    /// Lowercased hosts redirected from http to https.
    pub http2https: Vec<String>,
    pub upstream_groups: HashMap<String, Vec<UpstreamHostConfig>>,
}

impl VirtualHost {
    pub fn compile(config: &VhostConfig, defaults: &VhostDefaults) -> Result<Self, VhostError> {
        let parse_bind = |addr: &str| {
            addr.parse::<SocketAddr>().map_err(|_| VhostError::InvalidBind {
                vhost: config.name.clone(),
                addr: addr.to_string(),
            })
        };

        let binds = config
            .bind
            .iter()
            .map(|b| parse_bind(b))
            .collect::<Result<Vec<_>, _>>()?;

        let ssl = config
            .ssl
            .iter()
            .map(|s| {
                Ok(SslBinding {
                    bind: parse_bind(&s.bind)?,
                    cert_file: PathBuf::from(&s.cert_file),
                    key_file: PathBuf::from(&s.key_file),
                })
            })
            .collect::<Result<Vec<_>, VhostError>>()?;

        let hosts = config
            .host
            .iter()
            .map(|h| HostMapping {
                domain: normalize_domain(&h.domain),
                origin_ip: h.ip.clone(),
                origin_port: h.port,
                group: h.ups.clone().filter(|g| !g.is_empty()),
            })
            .collect();

        let cache_rules = config
            .cache
            .iter()
            .enumerate()
            .map(|(index, rule)| {
                CacheRule::compile(rule).map_err(|source| VhostError::InvalidRegex {
                    vhost: config.name.clone(),
                    index,
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let limit = &config.limit;
        let limits = Limits {
            timeout: if limit.timeout == 0 {
                DEFAULT_UPSTREAM_TIMEOUT
            } else {
                Duration::from_secs(limit.timeout)
            },
            max_cache_size: if limit.max_cache_size == 0 {
                defaults.max_cache_size
            } else {
                limit.max_cache_size
            },
            max_concurrent: limit.max_concurrent,
        };

        let ddos = DdosPolicy {
            request: config.ddos.request,
            rtime: Duration::from_secs(config.ddos.rtime),
            stime: Duration::from_secs(config.ddos.stime),
            mode: ChallengeMode::from_code(config.ddos.mode),
            hits: config.ddos.hits,
            block_time: config.ddos.block_time,
        };

        Ok(Self {
            name: config.name.clone(),
            status: config.status,
            binds,
            ssl,
            hosts,
            cache_rules,
            limits,
            ddos,
            black_list: AccessList::compile(&config.black_list, defaults.cidr_mode),
            white_list: AccessList::compile(&config.white_list, defaults.cidr_mode),
            log: config.log.clone(),
            http2https: config.request.http2https.iter().map(|h| normalize_domain(h)).collect(),
            upstream_groups: config
                .ups
                .iter()
                .map(|g| (g.name.clone(), g.host.clone()))
                .collect(),
        })
    }

    /// Every address this vhost listens on, plain first.
    pub fn all_binds(&self) -> impl Iterator<Item = SocketAddr> + '_ {
        self.binds.iter().copied().chain(self.ssl.iter().map(|s| s.bind))
    }

    /// Origin mapping for a request domain: exact entry, else wildcard entry.
    pub fn origin_for(&self, domain: &str) -> Option<&HostMapping> {
        let wildcard = wildcard_of(domain);
        let mut found = None;
        for mapping in &self.hosts {
            if mapping.domain == domain {
                return Some(mapping);
            }
            if found.is_none() && mapping.domain == wildcard {
                found = Some(mapping);
            }
        }
        found
    }
}
