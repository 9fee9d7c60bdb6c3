//! Cache rule evaluation and cache keys.
//!
//! A rule applies when its `base` prefix (if any) matches the path and
//! either its URL predicate or its extension list matches. Unless the rule
//! is `static`, a request `Cache-Control` of `no-cache`, `no-store` or
//! `private` disqualifies it. The last qualifying rule wins; a winning
//! `nocache` rule makes the request uncacheable.

use std::sync::OnceLock;
use std::time::Duration;

use axum::http::{header, HeaderMap};
use regex::Regex;

use crate::config::schema::CacheRuleConfig;
use crate::http::request::ProxyRequest;
use crate::routing::VirtualHost;

/// Request headers that make a request uncacheable when present.
const UNCACHEABLE_HEADERS: &[&str] = &[
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "upgrade",
];

fn client_no_cache() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new("no-cache|no-store|private").expect("static regex"))
}

#[derive(Debug, Clone)]
enum UrlPattern {
    Substring(String),
    Regex(Regex),
}

impl UrlPattern {
    fn matches(&self, url: &str) -> bool {
        match self {
            UrlPattern::Substring(s) => url.contains(s.as_str()),
            UrlPattern::Regex(re) => re.is_match(url),
        }
    }
}

/// Compiled cache rule.
#[derive(Debug, Clone)]
pub struct CacheRule {
    base: Option<String>,
    url: Option<UrlPattern>,
    extensions: Vec<String>,
    pub is_static: bool,
    pub nocache: bool,
    pub ttl: Duration,
    pub ignore_param: bool,
}

impl CacheRule {
    pub fn compile(config: &CacheRuleConfig) -> Result<Self, regex::Error> {
        let url = match (config.url.is_empty(), config.regex) {
            (true, _) => None,
            (false, true) => Some(UrlPattern::Regex(Regex::new(&config.url)?)),
            (false, false) => Some(UrlPattern::Substring(config.url.clone())),
        };

        Ok(Self {
            base: config.base.clone().filter(|b| !b.is_empty()),
            url,
            extensions: config
                .file_ext
                .split(|c: char| c == '|' || c == ',' || c.is_whitespace())
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .filter(|e| !e.is_empty())
                .collect(),
            is_static: config.is_static,
            nocache: config.nocache,
            ttl: Duration::from_secs(config.time),
            ignore_param: config.ignore_param,
        })
    }

    /// Predicate part of the rule, ignoring request cache directives.
    fn applies_to(&self, path: &str, url: &str, extension: Option<&str>) -> bool {
        if let Some(base) = &self.base {
            if !path.starts_with(base.as_str()) {
                return false;
            }
        }
        let url_hit = self.url.as_ref().is_some_and(|p| p.matches(url));
        let ext_hit = extension.is_some_and(|ext| {
            self.extensions
                .iter()
                .any(|e| e.eq_ignore_ascii_case(ext))
        });
        url_hit || ext_hit
    }
}

/// What the cache filter should do for a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachePlan {
    pub key: String,
    pub ttl: Duration,
}

/// `caching:<method>:<host>:<url>`, optionally without the query string.
pub fn cache_key(method: &str, host: &str, url: &str, ignore_param: bool) -> String {
    let url = if ignore_param {
        url.split_once('?').map(|(path, _)| path).unwrap_or(url)
    } else {
        url
    };
    format!("caching:{method}:{host}:{url}")
}

fn has_uncacheable_header(headers: &HeaderMap) -> bool {
    UNCACHEABLE_HEADERS
        .iter()
        .any(|name| headers.get(*name).is_some_and(|v| !v.is_empty()))
}

/// Evaluate `vhost`'s rules for `req`.
pub fn plan(req: &ProxyRequest, vhost: &VirtualHost) -> Option<CachePlan> {
    if vhost.cache_rules.is_empty() || has_uncacheable_header(&req.headers) {
        return None;
    }

    let client_refuses = req
        .header_str(header::CACHE_CONTROL)
        .is_some_and(|cc| client_no_cache().is_match(cc));
    let url = req.url();
    let extension = req.extension();

    let winner = vhost
        .cache_rules
        .iter()
        .filter(|rule| rule.applies_to(req.path(), url, extension))
        .filter(|rule| rule.is_static || !client_refuses)
        .last()?;

    if winner.nocache || winner.ttl.is_zero() {
        return None;
    }

    Some(CachePlan {
        key: cache_key(req.method.as_str(), req.host(), url, winner.ignore_param),
        ttl: winner.ttl,
    })
}
