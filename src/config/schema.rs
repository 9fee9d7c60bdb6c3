//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the edge.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

/// Root configuration for the edge server.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ProxyConfig {
    /// Hostname reported in `X-Cache` headers.
    pub hostname: String,

    /// Value of the `Server` response header.
    pub server_name: String,

    /// Optional directory whose `*.toml` files contribute more vhosts.
    pub vhost_dir: Option<String>,

    /// Virtual host definitions.
    #[serde(rename = "vhost")]
    pub vhosts: Vec<VhostConfig>,

    /// Listener limits shared by every bind address.
    pub listener: ListenerConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Filter order.
    pub pipeline: PipelineConfig,

    /// Response cache storage.
    pub cache: CacheConfig,

    /// Process-wide DDoS challenge settings.
    pub ddos: DdosGlobalConfig,

    /// Black/white list evaluation settings.
    pub access: AccessConfig,

    /// Upstream transport and pool settings.
    pub upstream: UpstreamConfig,

    /// Background task queue.
    pub background: BackgroundConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// Request hardening.
    pub security: SecurityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Maximum concurrent connections per listener (backpressure).
    pub max_connections: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            max_connections: 10_000,
        }
    }
}

/// Timeout configuration for client-facing requests.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Request timeout (total time for request/response) in seconds.
    pub request_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self { request_secs: 60 }
    }
}

/// Ordered filter names for both pipeline stages.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Request filters: `vhost`, `access`, `ddos`, `cache`, `upstream`.
    pub request_filters: Vec<String>,

    /// Response filters: `cache`, `access_log`.
    pub response_filters: Vec<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            request_filters: ["vhost", "access", "ddos", "cache", "upstream"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            response_filters: ["cache", "access_log"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// Response cache storage configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Directory for cache files. Defaults to the system temp dir.
    pub directory: Option<String>,

    /// Capacity of the in-memory LRU tier (entries).
    pub mem_items: usize,

    /// Default ceiling for a serialized cache record in bytes.
    pub max_entry_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            directory: None,
            mem_items: 100_000,
            max_entry_size: 1_000_000,
        }
    }
}

/// DDoS settings shared by all vhosts.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DdosGlobalConfig {
    /// Address of the firewall control port (`add <ip> <secs>\n`).
    pub block_service_addr: String,

    /// Directory holding `1.png..N.png` captcha images.
    pub captcha_dir: String,

    /// Code shown in each captcha image, index `i` -> `captcha_codes[i - 1]`.
    pub captcha_codes: Vec<String>,

    /// Capacity of the client -> captcha code LRU.
    pub captcha_sessions: usize,
}

impl Default for DdosGlobalConfig {
    fn default() -> Self {
        Self {
            block_service_addr: "127.0.0.1:9999".to_string(),
            captcha_dir: "captcha".to_string(),
            captcha_codes: Vec::new(),
            captcha_sessions: 5000,
        }
    }
}

/// How CIDR entries in black/white lists are evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CidrMode {
    /// Prefix bits come from the checked address string.
    #[default]
    Legacy,
    /// True network containment.
    Strict,
}

/// Access list settings.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct AccessConfig {
    pub cidr_mode: CidrMode,
}

/// Upstream transport and pool configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Health probe interval for pools in seconds.
    pub probe_interval_secs: u64,

    /// How long a resolved origin address is reused (0 = forever).
    pub dns_cache_secs: u64,

    /// Dial timeout in milliseconds.
    pub connect_timeout_ms: u64,

    /// Idle connections kept per origin.
    pub max_idle_per_host: usize,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            probe_interval_secs: 7,
            dns_cache_secs: 15 * 60,
            connect_timeout_ms: 2000,
            max_idle_per_host: 15,
        }
    }
}

/// Background queue configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BackgroundConfig {
    /// Jobs buffered before new submissions are dropped.
    pub queue_capacity: usize,

    /// Jobs executed concurrently.
    pub concurrency: usize,
}

impl Default for BackgroundConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 4096,
            concurrency: 64,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// `text` or `json`.
    pub log_format: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "text".to_string(),
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}

/// Security hardening configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Maximum buffered request body size in bytes.
    pub max_body_size: usize,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            max_body_size: 2 * 1024 * 1024, // 2MB
        }
    }
}

/// Whether a vhost is serving traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VhostStatus {
    #[default]
    Active,
    Paused,
}

/// A virtual host as written in the config file.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct VhostConfig {
    /// Unique vhost name.
    pub name: String,

    pub status: VhostStatus,

    /// Plain HTTP bind addresses (`ip:port`).
    pub bind: Vec<String>,

    /// Domains served and the origin each maps to.
    pub host: Vec<HostConfig>,

    /// Cache rules, evaluated in order (last match wins).
    pub cache: Vec<CacheRuleConfig>,

    pub limit: LimitConfig,

    /// TLS binds with their certificate pairs.
    pub ssl: Vec<SslConfig>,

    pub ddos: DdosConfig,

    pub white_list: AccessListConfig,

    pub black_list: AccessListConfig,

    pub log: LogConfig,

    pub request: RequestRulesConfig,

    /// Upstream groups referenced by `host.ups`.
    pub ups: Vec<UpstreamGroupConfig>,
}

/// Domain -> origin mapping.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct HostConfig {
    /// Origin address.
    pub ip: String,

    /// Origin port; 0 reuses the client-facing port.
    pub port: u16,

    /// Exact (`www.example.com`) or wildcard (`*.example.com`) domain.
    pub domain: String,

    /// Upstream group to balance across instead of `ip`.
    pub ups: Option<String>,
}

/// A cache rule.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct CacheRuleConfig {
    /// Path prefix the rule applies to.
    pub base: Option<String>,

    /// Freshness in seconds.
    pub time: u64,

    /// Extension list, e.g. `"jpg|png|css"`.
    pub file_ext: String,

    /// Ignore client `Cache-Control`.
    #[serde(rename = "static")]
    pub is_static: bool,

    /// Matching requests are never cached.
    pub nocache: bool,

    /// URL substring (or pattern when `regex`).
    pub url: String,

    pub regex: bool,

    /// Drop the query string from the cache key.
    pub ignore_param: bool,
}

/// Per-vhost limits.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct LimitConfig {
    /// Upstream round-trip timeout in seconds (0 = 3s default).
    pub timeout: u64,

    /// Serialized cache record ceiling in bytes (0 = global default).
    pub max_cache_size: usize,

    /// Concurrent upstream requests per origin (0 = unbounded).
    pub max_concurrent: usize,
}

/// A TLS bind with its certificate pair.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct SslConfig {
    pub bind: String,
    pub cert_file: String,
    pub key_file: String,
}

/// DDoS thresholds for a vhost.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct DdosConfig {
    /// Requests per window that trigger challenging.
    pub request: u64,

    /// Window length in seconds.
    pub rtime: u64,

    /// Challenge hold interval in seconds.
    pub stime: u64,

    /// Challenge presentation.
    pub mode: i32,

    /// Failed challenges before the client IP is blocked (0 = never).
    pub hits: u64,

    /// Block duration requested from the firewall, in seconds.
    pub block_time: u64,
}

/// Black or white list predicates.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct AccessListConfig {
    pub ip: Vec<String>,
    pub url: Vec<String>,
    pub user_agent: Vec<String>,
}

/// Access log sink kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogSinkKind {
    #[default]
    File,
    Tcp,
    Udp,
}

/// Per-vhost access log.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct LogConfig {
    /// Enable access logging.
    pub status: bool,

    #[serde(rename = "type")]
    pub kind: LogSinkKind,

    pub rotate_daily: bool,

    /// File path or `host:port`.
    pub addr: String,

    /// `combined` (default) or `json`.
    pub format: String,
}

/// Request rewriting rules.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct RequestRulesConfig {
    /// Hosts whose plain-HTTP requests are redirected to HTTPS.
    pub http2https: Vec<String>,
}

/// A named group of origins balanced by an upstream pool.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct UpstreamGroupConfig {
    pub name: String,
    pub host: Vec<UpstreamHostConfig>,
}

/// One pool member.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct UpstreamHostConfig {
    pub ip: String,

    /// 0 reuses the client-facing port.
    pub port: u16,

    /// Round-robin weight; 0 starts the member disabled.
    pub weight: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_vhost() {
        let raw = r#"
            hostname = "edge-1"

            [[vhost]]
            name = "example"
            bind = ["0.0.0.0:8080"]

            [[vhost.host]]
            ip = "10.0.0.5"
            port = 80
            domain = "www.example.com"

            [[vhost.cache]]
            file_ext = "json|css"
            time = 60
            static = true

            [vhost.ddos]
            request = 100
            rtime = 1
            stime = 30
            mode = 10
        "#;
        let config: ProxyConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.hostname, "edge-1");
        assert_eq!(config.vhosts.len(), 1);
        let vhost = &config.vhosts[0];
        assert_eq!(vhost.status, VhostStatus::Active);
        assert_eq!(vhost.host[0].domain, "www.example.com");
        assert!(vhost.cache[0].is_static);
        assert_eq!(vhost.ddos.mode, 10);
        assert_eq!(config.cache.mem_items, 100_000);
        assert_eq!(config.pipeline.request_filters.len(), 5);
    }

    #[test]
    fn parses_status_and_log_kind() {
        let raw = r#"
            [[vhost]]
            name = "paused"
            status = "paused"

            [vhost.log]
            status = true
            type = "udp"
            addr = "127.0.0.1:514"
        "#;
        let config: ProxyConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.vhosts[0].status, VhostStatus::Paused);
        assert_eq!(config.vhosts[0].log.kind, LogSinkKind::Udp);
    }
}
