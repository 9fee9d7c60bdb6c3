//! Per-vhost access policy.
//!
//! # Responsibilities
//! - Answer for paused vhosts
//! - Redirect plain-HTTP hosts listed in `http2https`
//! - Evaluate black and white lists (IP, URL substring, User-Agent substring)
//!
//! # Design Decisions
//! - Whitelist always overrides blacklist
//! - Empty patterns never match
//! - CIDR entries follow `access.cidr_mode`; `legacy` takes the prefix
//!   length from the checked address, which a client IP never carries,
//!   so CIDR entries only match in `strict` mode

use std::net::IpAddr;

use async_trait::async_trait;
use axum::http::StatusCode;

use crate::config::schema::{AccessListConfig, CidrMode, VhostStatus};
use crate::http::request::{ProxyRequest, Scheme};
use crate::http::response::{self, ProxyResponse};
use crate::pipeline::{RequestFilter, RequestStatus};

pub const PAUSED_BODY: &str = "the site was paused!\n";
pub const BLOCKED_BODY: &str = "you has been blocked!\n";

/// One IP list entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpRule {
    Exact(IpAddr),
    Cidr { network: IpAddr, prefix: u8 },
}

impl IpRule {
    /// Parse `a.b.c.d` or `a.b.c.d/n` (IPv6 too). Blank or malformed
    /// entries yield `None`.
    pub fn parse(entry: &str) -> Option<Self> {
        let entry = entry.trim();
        if entry.is_empty() {
            return None;
        }
        match entry.split_once('/') {
            Some((addr, prefix)) => {
                let network: IpAddr = addr.parse().ok()?;
                let prefix: u8 = prefix.parse().ok()?;
                let max = if network.is_ipv4() { 32 } else { 128 };
                (prefix <= max).then_some(IpRule::Cidr { network, prefix })
            }
            None => entry.parse().ok().map(IpRule::Exact),
        }
    }

    pub fn matches(&self, ip: IpAddr, mode: CidrMode) -> bool {
        match self {
            IpRule::Exact(addr) => addr.to_canonical() == ip.to_canonical(),
            IpRule::Cidr { network, prefix } => match mode {
                CidrMode::Legacy => false,
                CidrMode::Strict => cidr_contains(*network, *prefix, ip.to_canonical()),
            },
        }
    }
}

fn cidr_contains(network: IpAddr, prefix: u8, ip: IpAddr) -> bool {
    match (network, ip) {
        (IpAddr::V4(net), IpAddr::V4(addr)) => {
            let mask = u32::MAX.checked_shl(32 - prefix as u32).unwrap_or(0);
            let start = u32::from(net) & mask;
            let end = start | !mask;
            (start..=end).contains(&u32::from(addr))
        }
        (IpAddr::V6(net), IpAddr::V6(addr)) => {
            let mask = u128::MAX.checked_shl(128 - prefix as u32).unwrap_or(0);
            u128::from(net) & mask == u128::from(addr) & mask
        }
        _ => false,
    }
}

/// Compiled black or white list.
#[derive(Debug, Clone, Default)]
pub struct AccessList {
    ips: Vec<IpRule>,
    urls: Vec<String>,
    user_agents: Vec<String>,
    mode: CidrMode,
}

impl AccessList {
    pub fn compile(config: &AccessListConfig, mode: CidrMode) -> Self {
        let keep = |patterns: &[String]| -> Vec<String> {
            patterns
                .iter()
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect()
        };

        Self {
            ips: config
                .ip
                .iter()
                .filter_map(|entry| {
                    let rule = IpRule::parse(entry);
                    if rule.is_none() && !entry.trim().is_empty() {
                        tracing::warn!(entry = %entry, "Ignoring malformed IP list entry");
                    }
                    rule
                })
                .collect(),
            urls: keep(&config.url),
            user_agents: keep(&config.user_agent),
            mode,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ips.is_empty() && self.urls.is_empty() && self.user_agents.is_empty()
    }

    /// Any predicate hit counts.
    pub fn matches(&self, ip: IpAddr, url: &str, user_agent: &str) -> bool {
        self.ips.iter().any(|rule| rule.matches(ip, self.mode))
            || self.urls.iter().any(|u| url.contains(u.as_str()))
            || self.user_agents.iter().any(|ua| user_agent.contains(ua.as_str()))
    }
}

/// Pause, redirect and black/white list filter.
#[derive(Debug, Default)]
pub struct StatusFilter;

impl StatusFilter {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl RequestFilter for StatusFilter {
    fn name(&self) -> &'static str {
        "access"
    }

    async fn filter_request(&self, req: &mut ProxyRequest) -> Option<ProxyResponse> {
        let vhost = req.ctx.vhost.clone()?;

        if vhost.status == VhostStatus::Paused {
            return Some(response::text(StatusCode::OK, PAUSED_BODY));
        }

        if req.scheme == Scheme::Http && vhost.http2https.iter().any(|h| h == req.host()) {
            let location = format!("https://{}{}", req.host(), req.url());
            return Some(response::redirect(&location));
        }

        let ip = req.client_ip();
        let url = req.url().to_string();
        let ua = req.user_agent().to_string();

        req.ctx.blacklisted = vhost.black_list.matches(ip, &url, &ua);
        req.ctx.whitelisted = vhost.white_list.matches(ip, &url, &ua);

        if req.ctx.whitelisted {
            req.ctx.blacklisted = false;
            req.ctx.status |= RequestStatus::WHITELIST;
        } else if req.ctx.blacklisted {
            req.ctx.status |= RequestStatus::BLACKLIST;
            tracing::info!(
                request_id = %req.id,
                vhost = %vhost.name,
                client = %ip,
                "Blacklisted request rejected"
            );
            return Some(response::text(StatusCode::FORBIDDEN, BLOCKED_BODY));
        }

        None
    }
}
