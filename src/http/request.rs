//! Request handling and transformation.
//!
//! # Responsibilities
//! - Assign a request ID (client supplied `X-Request-ID` or UUID v4)
//! - Hold the buffered request the filters operate on
//! - Extract routing-relevant information (host, path, extension, query)
//!
//! # Design Decisions
//! - The body is buffered once at the transport edge; filters and the
//!   upstream transport share it as `Bytes`
//! - Host is normalized (lowercase, no port) once, on construction

use std::net::{IpAddr, SocketAddr};

use axum::http::{header, HeaderMap, HeaderValue, Method, Uri, Version};
use bytes::Bytes;
use tokio::time::Instant;
use uuid::Uuid;

use crate::pipeline::RequestContext;
use crate::routing::matcher::split_host_port;

/// Header carrying the request correlation ID.
pub const X_REQUEST_ID: &str = "x-request-id";

/// Which listener kind accepted the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

/// A fully buffered client request moving through the pipeline.
#[derive(Debug)]
pub struct ProxyRequest {
    pub id: String,
    pub method: Method,
    /// Origin-form URI (`/path?query`).
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub client_addr: SocketAddr,
    pub local_addr: SocketAddr,
    pub scheme: Scheme,
    pub started: Instant,
    /// Lowercased `Host` header without the port.
    host: String,
    pub ctx: RequestContext,
}

impl ProxyRequest {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        method: Method,
        uri: Uri,
        version: Version,
        mut headers: HeaderMap,
        body: Bytes,
        client_addr: SocketAddr,
        local_addr: SocketAddr,
        scheme: Scheme,
    ) -> Self {
        let id = headers
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        if let Ok(value) = HeaderValue::from_str(&id) {
            headers.insert(X_REQUEST_ID, value);
        }

        let raw_host = headers
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .or_else(|| uri.host().map(str::to_string))
            .unwrap_or_default();
        let host = split_host_port(&raw_host).0.to_ascii_lowercase();

        Self {
            id,
            method,
            uri,
            version,
            headers,
            body,
            client_addr,
            local_addr,
            scheme,
            started: Instant::now(),
            host,
            ctx: RequestContext::default(),
        }
    }

    /// Request domain, lowercased, without port.
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn path(&self) -> &str {
        self.uri.path()
    }

    /// Path plus query string as sent by the client.
    pub fn url(&self) -> &str {
        self.uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
    }

    pub fn query(&self) -> Option<&str> {
        self.uri.query()
    }

    /// First value of a query parameter, percent-decoded.
    pub fn query_param(&self, name: &str) -> Option<String> {
        let query = self.uri.query()?;
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
    }

    /// Extension of the last path segment, without the dot.
    pub fn extension(&self) -> Option<&str> {
        let last = self.path().rsplit('/').next()?;
        last.rsplit_once('.')
            .map(|(_, ext)| ext)
            .filter(|ext| !ext.is_empty())
    }

    pub fn header_str(&self, name: impl header::AsHeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn user_agent(&self) -> &str {
        self.header_str(header::USER_AGENT).unwrap_or("")
    }

    pub fn client_ip(&self) -> IpAddr {
        self.client_addr.ip().to_canonical()
    }

    #[cfg(test)]
    pub(crate) fn for_test(method: &str, uri: &str, host: &str) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_str(host).unwrap());
        Self::new(
            method.parse().unwrap(),
            uri.parse().unwrap(),
            Version::HTTP_11,
            headers,
            Bytes::new(),
            "203.0.113.7:51000".parse().unwrap(),
            "127.0.0.1:8080".parse().unwrap(),
            Scheme::Http,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_host_and_assigns_id() {
        let req = ProxyRequest::for_test("GET", "/a/b.JSON?x=1&_l1O0=abc", "WWW.Example.com:8080");
        assert_eq!(req.host(), "www.example.com");
        assert_eq!(req.url(), "/a/b.JSON?x=1&_l1O0=abc");
        assert_eq!(req.extension(), Some("JSON"));
        assert_eq!(req.query_param("_l1O0").as_deref(), Some("abc"));
        assert_eq!(req.query_param("missing"), None);
        assert!(Uuid::parse_str(&req.id).is_ok());
        assert_eq!(req.header_str(X_REQUEST_ID), Some(req.id.as_str()));
    }

    #[test]
    fn keeps_client_request_id() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("example.com"));
        headers.insert(X_REQUEST_ID, HeaderValue::from_static("abc-123"));
        let req = ProxyRequest::new(
            Method::GET,
            Uri::from_static("/"),
            Version::HTTP_11,
            headers,
            Bytes::new(),
            "10.0.0.1:1000".parse().unwrap(),
            "10.0.0.2:80".parse().unwrap(),
            Scheme::Http,
        );
        assert_eq!(req.id, "abc-123");
    }

    #[test]
    fn extension_edge_cases() {
        assert_eq!(ProxyRequest::for_test("GET", "/", "a").extension(), None);
        assert_eq!(ProxyRequest::for_test("GET", "/dir.v2/file", "a").extension(), None);
        assert_eq!(ProxyRequest::for_test("GET", "/x.", "a").extension(), None);
        assert_eq!(ProxyRequest::for_test("GET", "/.css", "a").extension(), Some("css"));
    }
}
