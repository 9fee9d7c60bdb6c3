//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check referential integrity (hosts reference existing upstream groups)
//! - Validate value ranges (ports, DDoS intervals)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ProxyConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;

use thiserror::Error;

use crate::config::schema::{ProxyConfig, VhostConfig};

const REQUEST_FILTERS: &[&str] = &["vhost", "access", "ddos", "cache", "upstream"];
const RESPONSE_FILTERS: &[&str] = &["cache", "access_log"];

/// A single semantic problem found in the configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("vhost #{0} has an empty name")]
    EmptyName(usize),

    #[error("duplicate vhost name '{0}'")]
    DuplicateName(String),

    #[error("vhost '{vhost}': invalid bind address '{addr}'")]
    InvalidBind { vhost: String, addr: String },

    #[error("vhost '{vhost}': host '{domain}' references unknown upstream group '{group}'")]
    UnknownUpstreamGroup {
        vhost: String,
        domain: String,
        group: String,
    },

    #[error("vhost '{vhost}': ddos.stime must be > 0 when ddos is enabled")]
    ZeroHoldInterval { vhost: String },

    #[error("vhost '{vhost}': cache rule #{index} has invalid regex: {reason}")]
    InvalidRegex {
        vhost: String,
        index: usize,
        reason: String,
    },

    #[error("vhost '{vhost}': missing certificate file '{path}'")]
    MissingCertificate { vhost: String, path: String },

    #[error("unknown {stage} filter '{name}'")]
    UnknownFilter { stage: &'static str, name: String },

    #[error("invalid metrics address '{0}'")]
    InvalidMetricsAddress(String),
}

/// Validate the whole configuration, collecting every error.
pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    for name in &config.pipeline.request_filters {
        if !REQUEST_FILTERS.contains(&name.as_str()) {
            errors.push(ValidationError::UnknownFilter {
                stage: "request",
                name: name.clone(),
            });
        }
    }
    for name in &config.pipeline.response_filters {
        if !RESPONSE_FILTERS.contains(&name.as_str()) {
            errors.push(ValidationError::UnknownFilter {
                stage: "response",
                name: name.clone(),
            });
        }
    }

    if config.observability.metrics_enabled
        && config
            .observability
            .metrics_address
            .parse::<SocketAddr>()
            .is_err()
    {
        errors.push(ValidationError::InvalidMetricsAddress(
            config.observability.metrics_address.clone(),
        ));
    }

    let mut names = HashSet::new();
    for (i, vhost) in config.vhosts.iter().enumerate() {
        if vhost.name.is_empty() {
            errors.push(ValidationError::EmptyName(i));
        } else if !names.insert(vhost.name.as_str()) {
            errors.push(ValidationError::DuplicateName(vhost.name.clone()));
        }
        validate_vhost(vhost, &mut errors);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_vhost(vhost: &VhostConfig, errors: &mut Vec<ValidationError>) {
    let binds = vhost
        .bind
        .iter()
        .chain(vhost.ssl.iter().map(|s| &s.bind));
    for addr in binds {
        if addr.parse::<SocketAddr>().is_err() {
            errors.push(ValidationError::InvalidBind {
                vhost: vhost.name.clone(),
                addr: addr.clone(),
            });
        }
    }

    let groups: HashSet<&str> = vhost.ups.iter().map(|g| g.name.as_str()).collect();
    for host in &vhost.host {
        if let Some(group) = host.ups.as_deref().filter(|g| !g.is_empty()) {
            if !groups.contains(group) {
                errors.push(ValidationError::UnknownUpstreamGroup {
                    vhost: vhost.name.clone(),
                    domain: host.domain.clone(),
                    group: group.to_string(),
                });
            }
        }
    }

    if vhost.ddos.request > 0 && vhost.ddos.rtime > 0 && vhost.ddos.stime == 0 {
        errors.push(ValidationError::ZeroHoldInterval {
            vhost: vhost.name.clone(),
        });
    }

    for (index, rule) in vhost.cache.iter().enumerate() {
        if rule.regex {
            if let Err(e) = regex::Regex::new(&rule.url) {
                errors.push(ValidationError::InvalidRegex {
                    vhost: vhost.name.clone(),
                    index,
                    reason: e.to_string(),
                });
            }
        }
    }

    for ssl in &vhost.ssl {
        for path in [&ssl.cert_file, &ssl.key_file] {
            if !Path::new(path).is_file() {
                errors.push(ValidationError::MissingCertificate {
                    vhost: vhost.name.clone(),
                    path: path.clone(),
                });
            }
        }
    }
}
