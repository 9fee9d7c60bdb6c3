//! Upstream request filter.
//!
//! Last request filter: maps the request domain to an origin (or a pool)
//! and proxies to it.
//!
//! # Design Decisions
//! - Origins are cached per vhost and address; a changed timeout rebuilds
//!   the transport, a changed concurrency limit is applied in place
//! - Pools are cached per vhost and group; changed members or limits build
//!   a new pool and shut the old one down
//! - The client port is part of a pool's key only when a member inherits
//!   it (port 0); otherwise every client port shares one pool

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::header;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::config::schema::{UpstreamConfig, UpstreamHostConfig};
use crate::http::request::ProxyRequest;
use crate::http::response::{self, ProxyResponse};
use crate::load_balancer::pool::{PoolState, UpstreamPool};
use crate::load_balancer::transport::{TransportSettings, UpstreamTransport};
use crate::load_balancer::upstream::Upstream;
use crate::pipeline::RequestFilter;
use crate::routing::matcher::split_host_port;
use crate::routing::vhost::{Limits, VirtualHost};

struct PoolEntry {
    hosts: Vec<UpstreamHostConfig>,
    timeout: Duration,
    max_concurrent: usize,
    pool: UpstreamPool,
}

impl PoolEntry {
    fn matches(&self, hosts: &[UpstreamHostConfig], limits: &Limits) -> bool {
        self.hosts == hosts
            && self.timeout == limits.timeout
            && self.max_concurrent == limits.max_concurrent
    }
}

/// Vhost, group and the client port inherited by port-0 members (0 if none).
type PoolKey = (String, String, u16);

pub struct UpstreamFilter {
    settings: UpstreamConfig,
    origins: DashMap<String, Arc<Upstream>>,
    pools: DashMap<PoolKey, Arc<PoolEntry>>,
}

impl UpstreamFilter {
    pub fn new(settings: UpstreamConfig) -> Self {
        Self {
            settings,
            origins: DashMap::new(),
            pools: DashMap::new(),
        }
    }

    fn transport_settings(&self, limits: &Limits) -> TransportSettings {
        TransportSettings::new(&self.settings, limits.timeout)
    }

    /// Single origin for `ip:port`, reused across requests of the vhost.
    fn origin(&self, vhost: &VirtualHost, ip: &str, port: u16) -> Arc<Upstream> {
        let key = format!("{}|{}:{}", vhost.name, ip, port);
        let limits = &vhost.limits;

        match self.origins.entry(key) {
            Entry::Occupied(mut slot) => {
                if slot.get().transport().settings().timeout == limits.timeout {
                    slot.get().set_max_concurrent(limits.max_concurrent);
                    return slot.get().clone();
                }
                let upstream = Arc::new(self.build_upstream(ip, port, limits));
                slot.insert(upstream.clone());
                upstream
            }
            Entry::Vacant(slot) => {
                tracing::debug!(vhost = %vhost.name, origin = %format!("{ip}:{port}"), "New origin");
                slot.insert(Arc::new(self.build_upstream(ip, port, limits)))
                    .value()
                    .clone()
            }
        }
    }

    fn build_upstream(&self, ip: &str, port: u16, limits: &Limits) -> Upstream {
        let transport = UpstreamTransport::new(ip, port, self.transport_settings(limits));
        Upstream::new(transport, limits.max_concurrent)
    }

    /// Pool for `group`, rebuilt when its definition changed.
    fn pool(
        &self,
        vhost: &VirtualHost,
        group: &str,
        hosts: &[UpstreamHostConfig],
        domain: &str,
        port: u16,
    ) -> Arc<PoolEntry> {
        let inherited = if hosts.iter().any(|h| h.port == 0) { port } else { 0 };
        let key = (vhost.name.clone(), group.to_string(), inherited);
        match self.pools.entry(key) {
            Entry::Occupied(mut slot) => {
                if slot.get().matches(hosts, &vhost.limits) {
                    return slot.get().clone();
                }
                tracing::info!(vhost = %vhost.name, group, "Upstream group changed, rebuilding pool");
                let entry = Arc::new(self.build_pool(vhost, hosts, domain, port));
                let old = slot.insert(entry.clone());
                old.pool.shutdown();
                entry
            }
            Entry::Vacant(slot) => {
                tracing::info!(vhost = %vhost.name, group, members = hosts.len(), "Creating upstream pool");
                slot.insert(Arc::new(self.build_pool(vhost, hosts, domain, port)))
                    .value()
                    .clone()
            }
        }
    }

    fn build_pool(
        &self,
        vhost: &VirtualHost,
        hosts: &[UpstreamHostConfig],
        domain: &str,
        port: u16,
    ) -> PoolEntry {
        let members = hosts
            .iter()
            .map(|h| {
                let member_port = if h.port == 0 { port } else { h.port };
                (self.build_upstream(&h.ip, member_port, &vhost.limits), h.weight)
            })
            .collect();
        let state = PoolState::new(domain, members);
        PoolEntry {
            hosts: hosts.to_vec(),
            timeout: vhost.limits.timeout,
            max_concurrent: vhost.limits.max_concurrent,
            pool: UpstreamPool::new(state, Duration::from_secs(self.settings.probe_interval_secs)),
        }
    }

    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    pub fn origin_count(&self) -> usize {
        self.origins.len()
    }

    /// Stop every pool and fail requests parked on origin throttles.
    pub fn shutdown(&self) {
        for entry in self.pools.iter() {
            entry.pool.shutdown();
        }
        for origin in self.origins.iter() {
            origin.close();
        }
    }
}

/// Port the client connected to: from `Host`, else the local socket.
fn client_port(req: &ProxyRequest) -> u16 {
    req.header_str(header::HOST)
        .and_then(|h| split_host_port(h).1)
        .unwrap_or(req.local_addr.port())
}

#[async_trait]
impl RequestFilter for UpstreamFilter {
    fn name(&self) -> &'static str {
        "upstream"
    }

    async fn filter_request(&self, req: &mut ProxyRequest) -> Option<ProxyResponse> {
        let vhost = req.ctx.vhost.clone()?;
        let domain = req.host().to_string();
        let Some(mapping) = vhost.origin_for(&domain) else {
            tracing::warn!(
                request_id = %req.id,
                vhost = %vhost.name,
                domain = %domain,
                "No origin for domain"
            );
            return Some(response::bad_gateway());
        };

        let port = client_port(req);
        if let Some(group) = mapping.group.as_deref() {
            match vhost.upstream_groups.get(group) {
                Some(hosts) => {
                    let entry = self.pool(&vhost, group, hosts, &domain, port);
                    return Some(entry.pool.forward(req).await);
                }
                None => tracing::warn!(
                    vhost = %vhost.name,
                    group,
                    "Unknown upstream group, using host origin"
                ),
            }
        }

        let origin_port = if mapping.origin_port == 0 {
            port
        } else {
            mapping.origin_port
        };
        let upstream = self.origin(&vhost, &mapping.origin_ip, origin_port);
        Some(upstream.forward(req).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::{HostConfig, UpstreamGroupConfig, VhostConfig};
    use crate::routing::vhost::VhostDefaults;
    use axum::http::{HeaderValue, StatusCode};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn origin(reply: &'static [u8]) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 8192];
                    while let Ok(n) = socket.read(&mut buf).await {
                        if n == 0 || socket.write_all(reply).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });
        port
    }

    fn vhost(hosts: Vec<HostConfig>, ups: Vec<UpstreamGroupConfig>) -> Arc<VirtualHost> {
        let config = VhostConfig {
            name: "example".to_string(),
            host: hosts,
            ups,
            ..Default::default()
        };
        Arc::new(VirtualHost::compile(&config, &VhostDefaults::default()).unwrap())
    }

    fn host(domain: &str, port: u16, ups: Option<&str>) -> HostConfig {
        HostConfig {
            ip: "127.0.0.1".to_string(),
            port,
            domain: domain.to_string(),
            ups: ups.map(str::to_string),
        }
    }

    fn request(vhost: &Arc<VirtualHost>, domain: &str) -> ProxyRequest {
        let mut req = ProxyRequest::for_test("GET", "/", domain);
        req.ctx.vhost = Some(vhost.clone());
        req
    }

    fn filter() -> UpstreamFilter {
        UpstreamFilter::new(UpstreamConfig {
            probe_interval_secs: 0,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn proxies_to_mapped_origin() {
        let port = origin(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok").await;
        let vhost = vhost(vec![host("*.example.com", port, None)], Vec::new());
        let filter = filter();

        let mut req = request(&vhost, "img.example.com");
        let resp = filter.filter_request(&mut req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"ok");

        let mut again = request(&vhost, "www.example.com");
        filter.filter_request(&mut again).await.unwrap();
        assert_eq!(filter.origin_count(), 1);
    }

    #[tokio::test]
    async fn unmapped_domain_is_502() {
        let vhost = vhost(vec![host("example.com", 80, None)], Vec::new());
        let mut req = request(&vhost, "other.org");
        let resp = filter().filter_request(&mut req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn no_vhost_passes_through() {
        let mut req = ProxyRequest::for_test("GET", "/", "example.com");
        assert!(filter().filter_request(&mut req).await.is_none());
    }

    #[test]
    fn client_port_prefers_host_header() {
        let mut req = ProxyRequest::for_test("GET", "/", "example.com");
        assert_eq!(client_port(&req), 8080);
        req.headers
            .insert(header::HOST, HeaderValue::from_static("example.com:8443"));
        assert_eq!(client_port(&req), 8443);
    }

    #[tokio::test]
    async fn group_goes_through_pool_and_is_reused() {
        let a = origin(b"HTTP/1.1 200 OK\r\nContent-Length: 1\r\n\r\na").await;
        let b = origin(b"HTTP/1.1 200 OK\r\nContent-Length: 1\r\n\r\nb").await;
        let group = UpstreamGroupConfig {
            name: "web".to_string(),
            host: vec![
                UpstreamHostConfig {
                    ip: "127.0.0.1".to_string(),
                    port: a,
                    weight: 1,
                },
                UpstreamHostConfig {
                    ip: "127.0.0.1".to_string(),
                    port: b,
                    weight: 1,
                },
            ],
        };
        let vhost = vhost(vec![host("example.com", 1, Some("web"))], vec![group]);
        let filter = filter();

        let mut bodies = Vec::new();
        for _ in 0..4 {
            let mut req = request(&vhost, "example.com");
            let resp = filter.filter_request(&mut req).await.unwrap();
            assert_eq!(resp.status(), StatusCode::OK);
            let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
            bodies.push(String::from_utf8(body.to_vec()).unwrap());
        }
        assert_eq!(bodies, vec!["a", "b", "a", "b"]);
        assert_eq!(filter.pool_count(), 1);
        assert_eq!(filter.origin_count(), 0);
        filter.shutdown();
    }

    #[tokio::test]
    async fn changed_limits_rebuild_pool() {
        let group = UpstreamGroupConfig {
            name: "web".to_string(),
            host: vec![UpstreamHostConfig {
                ip: "127.0.0.1".to_string(),
                port: 1,
                weight: 1,
            }],
        };
        let first = vhost(vec![host("example.com", 1, Some("web"))], vec![group]);
        let mut second = (*first).clone();
        second.limits.max_concurrent = 4;

        let filter = filter();
        let hosts = &first.upstream_groups["web"];
        let old = filter.pool(&first, "web", hosts, "example.com", 80);
        let same = filter.pool(&first, "web", hosts, "example.com", 80);
        assert!(Arc::ptr_eq(&old, &same));

        let new = filter.pool(&second, "web", hosts, "example.com", 80);
        assert!(!Arc::ptr_eq(&old, &new));
        assert_eq!(filter.pool_count(), 1);
        tokio::time::timeout(Duration::from_secs(1), async {
            while old.pool.next().await.is_some() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    fn group(ports: &[u16]) -> UpstreamGroupConfig {
        UpstreamGroupConfig {
            name: "web".to_string(),
            host: ports
                .iter()
                .map(|&port| UpstreamHostConfig {
                    ip: "127.0.0.1".to_string(),
                    port,
                    weight: 1,
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn client_port_does_not_rebuild_fixed_pool() {
        let vhost = vhost(vec![host("example.com", 1, Some("web"))], vec![group(&[1, 2])]);
        let filter = filter();
        let hosts = &vhost.upstream_groups["web"];

        let a = filter.pool(&vhost, "web", hosts, "example.com", 80);
        let b = filter.pool(&vhost, "web", hosts, "example.com", 443);
        let c = filter.pool(&vhost, "web", hosts, "example.com", 80);
        assert!(Arc::ptr_eq(&a, &b));
        assert!(Arc::ptr_eq(&a, &c));
        assert_eq!(filter.pool_count(), 1);
        assert!(a.pool.next().await.is_some());
        filter.shutdown();
    }

    #[tokio::test]
    async fn inherited_port_keeps_one_pool_per_client_port() {
        let vhost = vhost(vec![host("example.com", 1, Some("web"))], vec![group(&[0, 2])]);
        let filter = filter();
        let hosts = &vhost.upstream_groups["web"];

        let plain = filter.pool(&vhost, "web", hosts, "example.com", 80);
        let secure = filter.pool(&vhost, "web", hosts, "example.com", 443);
        let plain_again = filter.pool(&vhost, "web", hosts, "example.com", 80);
        assert!(!Arc::ptr_eq(&plain, &secure));
        assert!(Arc::ptr_eq(&plain, &plain_again));
        assert_eq!(filter.pool_count(), 2);
        assert!(plain.pool.next().await.is_some());
        filter.shutdown();
    }
}
