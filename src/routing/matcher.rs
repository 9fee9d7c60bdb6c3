//! Domain and address matching helpers.
//!
//! # Design Decisions
//! - Domains are compared lowercased, without a trailing dot
//! - A wildcard is derived by replacing the leftmost label; two-label
//!   domains get a `*.` prefix instead so `example.com` maps to
//!   `*.example.com`

/// Split a `Host` header into domain and optional port.
///
/// Handles bracketed IPv6 literals (`[::1]:8080`).
pub fn split_host_port(host: &str) -> (&str, Option<u16>) {
    if let Some(rest) = host.strip_prefix('[') {
        if let Some((addr, tail)) = rest.split_once(']') {
            let port = tail.strip_prefix(':').and_then(|p| p.parse().ok());
            return (addr, port);
        }
        return (host, None);
    }

    match host.rsplit_once(':') {
        // Bare IPv6 without brackets has several colons and no port.
        Some((name, port)) if !name.contains(':') => match port.parse() {
            Ok(p) => (name, Some(p)),
            Err(_) => (host, None),
        },
        _ => (host, None),
    }
}

/// Lowercase and strip a trailing dot.
pub fn normalize_domain(domain: &str) -> String {
    domain.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// The wildcard domain that covers `domain`.
pub fn wildcard_of(domain: &str) -> String {
    let labels: Vec<&str> = domain.split('.').collect();
    if labels.len() < 3 {
        format!("*.{domain}")
    } else {
        format!("*.{}", labels[1..].join("."))
    }
}
