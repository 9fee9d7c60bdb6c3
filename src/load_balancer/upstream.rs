//! Proxying one request to one origin.
//!
//! # Data Flow
//! ```text
//! ProxyRequest
//!     → Throttle::acquire (parks while max_concurrent are in flight)
//!     → outbound request (hop-by-hop headers dropped, X-Forwarded-For added)
//!     → UpstreamTransport::round_trip
//!     → rehomed response (framing headers dropped, body streamed)
//!        or 504 (timeout) / 502 (anything else), request marked failed
//! ```

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, Request, Response};
use hyper::body::Incoming;
use tokio::time::Instant;

use crate::http::request::ProxyRequest;
use crate::http::response::{self, ProxyResponse};
use crate::load_balancer::throttle::Throttle;
use crate::load_balancer::transport::{UpstreamError, UpstreamTransport};
use crate::observability::metrics;
use crate::pipeline::RequestStatus;

pub const PING_USER_AGENT: &str = "cdn-edge pinger";

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

/// Request headers that belong to the client connection only.
static HOP_BY_HOP: [HeaderName; 7] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    HeaderName::from_static("proxy-connection"),
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Response headers re-derived when the body is sent to the client.
static FRAMING: [HeaderName; 3] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::TRANSFER_ENCODING,
];

#[derive(Debug)]
pub struct Upstream {
    transport: UpstreamTransport,
    throttle: Throttle,
}

impl Upstream {
    pub fn new(transport: UpstreamTransport, max_concurrent: usize) -> Self {
        Self {
            transport,
            throttle: Throttle::new(max_concurrent),
        }
    }

    pub fn transport(&self) -> &UpstreamTransport {
        &self.transport
    }

    pub fn throttle(&self) -> &Throttle {
        &self.throttle
    }

    pub fn set_max_concurrent(&self, max: usize) {
        self.throttle.set_max(max);
    }

    /// Fail all requests waiting for admission.
    pub fn close(&self) {
        self.throttle.close();
    }

    /// Proxy `req` and translate failures into 502/504.
    ///
    /// A failure also sets [`RequestStatus::UPSTREAM_FAILED`] on the request.
    pub async fn forward(&self, req: &mut ProxyRequest) -> ProxyResponse {
        let started = Instant::now();
        match self.try_forward(req).await {
            Ok(resp) => {
                tracing::debug!(
                    request_id = %req.id,
                    method = %req.method,
                    origin = %self.transport.authority(),
                    url = %req.url(),
                    status = resp.status().as_u16(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Upstream responded"
                );
                resp
            }
            Err(e) => {
                req.ctx.status |= RequestStatus::UPSTREAM_FAILED;
                metrics::record_upstream_error(e.kind());
                tracing::error!(
                    request_id = %req.id,
                    origin = %self.transport.authority(),
                    url = %req.url(),
                    error = %e,
                    "Upstream request failed"
                );
                if e.is_timeout() {
                    response::gateway_timeout()
                } else {
                    response::bad_gateway()
                }
            }
        }
    }

    async fn try_forward(&self, req: &ProxyRequest) -> Result<ProxyResponse, UpstreamError> {
        let _permit = self.throttle.acquire().await?;
        let outbound = self.outbound_request(req)?;
        let resp = self.transport.round_trip(outbound).await?;
        Ok(rehome(resp, req.method == Method::HEAD))
    }

    fn outbound_request(&self, req: &ProxyRequest) -> Result<Request<Body>, UpstreamError> {
        let uri = format!("http://{}{}", self.transport.authority(), req.url());
        let mut outbound = Request::builder()
            .method(req.method.clone())
            .uri(uri)
            .body(Body::from(req.body.clone()))?;

        let headers = outbound.headers_mut();
        copy_end_to_end(&req.headers, headers);
        if !headers.contains_key(header::HOST) {
            if let Ok(host) = HeaderValue::from_str(req.host()) {
                headers.insert(header::HOST, host);
            }
        }

        let client = req.client_ip().to_string();
        let forwarded = match req.header_str(X_FORWARDED_FOR).filter(|v| !v.is_empty()) {
            Some(prior) => format!("{prior}, {client}"),
            None => client,
        };
        if let Ok(value) = HeaderValue::from_str(&forwarded) {
            headers.insert(X_FORWARDED_FOR, value);
        }
        Ok(outbound)
    }

    /// `GET /` with `Host: host`; up means status 200.
    pub async fn ping(&self, host: &str) -> bool {
        let request = Request::builder()
            .uri(format!("http://{}/", self.transport.authority()))
            .header(header::HOST, host)
            .header(header::USER_AGENT, PING_USER_AGENT)
            .body(Body::empty());
        let request = match request {
            Ok(r) => r,
            Err(e) => {
                tracing::error!(host, error = %e, "Bad ping request");
                return false;
            }
        };

        match self.transport.round_trip(request).await {
            Ok(resp) => {
                let status = resp.status();
                // Drain so the connection can be reused.
                let _ = axum::body::to_bytes(Body::new(resp.into_body()), 64 * 1024).await;
                if status.as_u16() != 200 {
                    tracing::warn!(origin = %self.transport.authority(), %status, "Ping failed");
                }
                status.as_u16() == 200
            }
            Err(e) => {
                tracing::warn!(origin = %self.transport.authority(), error = %e, "Ping failed");
                false
            }
        }
    }
}

fn copy_end_to_end(from: &HeaderMap, to: &mut HeaderMap) {
    // Headers named by the client's Connection header are hop-by-hop too.
    let listed: Vec<String> = from
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();

    for (name, value) in from {
        if HOP_BY_HOP.contains(name) || listed.iter().any(|l| l == name.as_str()) {
            continue;
        }
        to.append(name.clone(), value.clone());
    }
}

/// Re-wrap an origin response for the client connection.
fn rehome(resp: Response<Incoming>, head: bool) -> ProxyResponse {
    let (mut parts, body) = resp.into_parts();
    for name in &FRAMING {
        parts.headers.remove(name);
    }
    // The body's own length decides framing, except for HEAD where there
    // is no body to measure.
    if !head {
        parts.headers.remove(header::CONTENT_LENGTH);
    }
    Response::from_parts(parts, Body::new(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_balancer::transport::TransportSettings;
    use axum::http::StatusCode;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    /// Origin that answers every request with `reply` and reports the
    /// raw request head it saw.
    async fn origin(reply: &'static [u8]) -> (u16, mpsc::UnboundedReceiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let tx = tx.clone();
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 8192];
                    while let Ok(n) = socket.read(&mut buf).await {
                        if n == 0 {
                            return;
                        }
                        let _ = tx.send(String::from_utf8_lossy(&buf[..n]).to_string());
                        if socket.write_all(reply).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });
        (port, rx)
    }

    fn upstream(port: u16, timeout_ms: u64) -> Upstream {
        let settings = TransportSettings {
            timeout: Duration::from_millis(timeout_ms),
            ..Default::default()
        };
        Upstream::new(UpstreamTransport::new("127.0.0.1", port, settings), 0)
    }

    #[tokio::test]
    async fn forwards_and_rehomes() {
        let (port, mut seen) =
            origin(b"HTTP/1.1 200 OK\r\nContent-Length: 7\r\nX-Origin: yes\r\n\r\n{\"a\":1}").await;
        let upstream = upstream(port, 2000);

        let mut req = ProxyRequest::for_test("GET", "/foo.json?x=1", "www.example.com");
        req.headers
            .insert(header::CONNECTION, HeaderValue::from_static("keep-alive, x-secret"));
        req.headers
            .insert("x-secret", HeaderValue::from_static("hop"));
        req.headers
            .insert(X_FORWARDED_FOR, HeaderValue::from_static("198.51.100.1"));

        let resp = upstream.forward(&mut req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()["x-origin"], "yes");
        assert!(resp.headers().get(header::CONTENT_LENGTH).is_none());
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"{\"a\":1}");

        let head = seen.recv().await.unwrap().to_ascii_lowercase();
        assert!(head.starts_with("get /foo.json?x=1 http/1.1"));
        assert!(head.contains("host: www.example.com"));
        assert!(head.contains("x-forwarded-for: 198.51.100.1, 203.0.113.7"));
        assert!(head.contains(&format!("x-request-id: {}", req.id.to_ascii_lowercase())));
        assert!(!head.contains("x-secret"));
        assert!(!req.ctx.status.contains(RequestStatus::UPSTREAM_FAILED));
    }

    #[tokio::test]
    async fn refused_is_502_and_marks_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut req = ProxyRequest::for_test("GET", "/", "a.com");
        let resp = upstream(port, 2000).forward(&mut req).await;
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        assert!(req.ctx.status.contains(RequestStatus::UPSTREAM_FAILED));
    }

    #[tokio::test]
    async fn slow_origin_is_504() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let mut req = ProxyRequest::for_test("GET", "/", "a.com");
        let resp = upstream(port, 150).forward(&mut req).await;
        assert_eq!(resp.status(), StatusCode::GATEWAY_TIMEOUT);
        assert!(req.ctx.status.contains(RequestStatus::UPSTREAM_FAILED));
    }

    #[tokio::test]
    async fn ping_requires_200() {
        let (up_port, mut seen) = origin(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n").await;
        assert!(upstream(up_port, 2000).ping("pool.example.com").await);
        let head = seen.recv().await.unwrap().to_ascii_lowercase();
        assert!(head.contains("user-agent: cdn-edge pinger"));
        assert!(head.contains("host: pool.example.com"));

        let (down_port, _seen) =
            origin(b"HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\n\r\n").await;
        assert!(!upstream(down_port, 2000).ping("pool.example.com").await);
    }
}
