//! Connection handling for one origin `host:port`.
//!
//! # Responsibilities
//! - Resolve the origin once and reuse the address for `dns_cache`
//! - Dial with a bounded connect timeout
//! - Wrap connections with a per-operation idle deadline
//! - Keep a small pool of idle HTTP/1.1 connections
//! - Bound each round trip (until response headers) by a timeout

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, Response, Uri};
use hyper::body::Incoming;
use hyper::rt::{Read, ReadBufCursor, Write};
use hyper_util::client::legacy::connect::{Connected, Connection};
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::{Instant, Sleep};

use crate::config::schema::UpstreamConfig;

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("DNS lookup for {host} failed: {source}")]
    Dns {
        host: String,
        #[source]
        source: io::Error,
    },

    #[error("no address found for {0}")]
    NoAddress(String),

    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("connect to {0} timed out")]
    ConnectTimeout(SocketAddr),

    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("upstream request failed: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),

    #[error("invalid upstream request: {0}")]
    Request(#[from] axum::http::Error),

    #[error("upstream throttle closed")]
    ThrottleClosed,
}

impl UpstreamError {
    /// Whether the failure should surface as 504 rather than 502.
    pub fn is_timeout(&self) -> bool {
        match self {
            UpstreamError::ConnectTimeout(_) | UpstreamError::Timeout(_) => true,
            UpstreamError::Client(e) => {
                let mut source = std::error::Error::source(e);
                while let Some(err) = source {
                    if let Some(io) = err.downcast_ref::<io::Error>() {
                        if io.kind() == io::ErrorKind::TimedOut {
                            return true;
                        }
                    }
                    if let Some(upstream) = err.downcast_ref::<UpstreamError>() {
                        return upstream.is_timeout();
                    }
                    source = err.source();
                }
                false
            }
            _ => false,
        }
    }

    /// Low-cardinality label for metrics.
    pub fn kind(&self) -> &'static str {
        if self.is_timeout() {
            return "timeout";
        }
        match self {
            UpstreamError::Dns { .. } | UpstreamError::NoAddress(_) => "dns",
            UpstreamError::Connect { .. } => "connect",
            UpstreamError::ThrottleClosed => "closed",
            _ => "protocol",
        }
    }
}

/// Knobs shared by every transport.
#[derive(Debug, Clone)]
pub struct TransportSettings {
    /// 0 = resolve once and keep the address forever.
    pub dns_cache: Duration,
    pub connect_timeout: Duration,
    /// Per read/write deadline on origin connections; also the round-trip
    /// timeout. 0 disables both.
    pub timeout: Duration,
    pub max_idle: usize,
}

impl TransportSettings {
    pub fn new(config: &UpstreamConfig, timeout: Duration) -> Self {
        Self {
            dns_cache: Duration::from_secs(config.dns_cache_secs),
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            timeout,
            max_idle: config.max_idle_per_host,
        }
    }
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self::new(&UpstreamConfig::default(), Duration::from_secs(3))
    }
}

#[derive(Debug)]
struct Resolved {
    addr: SocketAddr,
    at: Instant,
}

#[derive(Debug)]
struct Origin {
    host: String,
    port: u16,
    settings: TransportSettings,
    resolved: Mutex<Option<Resolved>>,
}

impl Origin {
    async fn lookup(&self) -> Result<SocketAddr, UpstreamError> {
        {
            let cached = self.resolved.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(r) = cached.as_ref() {
                if self.settings.dns_cache.is_zero() || r.at.elapsed() < self.settings.dns_cache {
                    return Ok(r.addr);
                }
            }
        }

        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((self.host.as_str(), self.port))
            .await
            .map_err(|source| UpstreamError::Dns {
                host: self.host.clone(),
                source,
            })?
            .collect();
        // IPv4 first.
        let addr = addrs
            .iter()
            .find(|a| a.is_ipv4())
            .or_else(|| addrs.first())
            .copied()
            .ok_or_else(|| UpstreamError::NoAddress(self.host.clone()))?;

        *self.resolved.lock().unwrap_or_else(PoisonError::into_inner) = Some(Resolved {
            addr,
            at: Instant::now(),
        });
        Ok(addr)
    }

    async fn connect(&self) -> Result<IdleStream, UpstreamError> {
        let addr = self.lookup().await?;
        tracing::trace!(%addr, "Dialing origin");
        let stream = tokio::time::timeout(self.settings.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| UpstreamError::ConnectTimeout(addr))?
            .map_err(|source| UpstreamError::Connect { addr, source })?;
        let _ = stream.set_nodelay(true);
        Ok(IdleStream::new(stream, self.settings.timeout))
    }
}

/// TCP stream whose every read and write must make progress within
/// `timeout`.
pub struct IdleStream {
    inner: TokioIo<TcpStream>,
    timeout: Duration,
    deadline: Option<Pin<Box<Sleep>>>,
}

impl IdleStream {
    fn new(stream: TcpStream, timeout: Duration) -> Self {
        let deadline = (!timeout.is_zero()).then(|| Box::pin(tokio::time::sleep(timeout)));
        Self {
            inner: TokioIo::new(stream),
            timeout,
            deadline,
        }
    }

    fn refresh(&mut self) {
        let timeout = self.timeout;
        if let Some(deadline) = self.deadline.as_mut() {
            deadline.as_mut().reset(Instant::now() + timeout);
        }
    }

    fn expired(&mut self, cx: &mut Context<'_>) -> bool {
        self.deadline
            .as_mut()
            .is_some_and(|d| d.as_mut().poll(cx).is_ready())
    }

    fn finish<T>(&mut self, cx: &mut Context<'_>, poll: Poll<io::Result<T>>) -> Poll<io::Result<T>> {
        match poll {
            Poll::Ready(result) => {
                self.refresh();
                Poll::Ready(result)
            }
            Poll::Pending if self.expired(cx) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "origin connection idle timeout",
            ))),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Read for IdleStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);
        this.finish(cx, poll)
    }
}

impl Write for IdleStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_write(cx, buf);
        this.finish(cx, poll)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_flush(cx);
        this.finish(cx, poll)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

impl Connection for IdleStream {
    fn connected(&self) -> Connected {
        Connected::new()
    }
}

/// Connector that always dials the transport's origin, whatever the URI.
#[derive(Clone)]
struct OriginConnector {
    origin: Arc<Origin>,
}

impl tower::Service<Uri> for OriginConnector {
    type Response = IdleStream;
    type Error = UpstreamError;
    type Future = Pin<Box<dyn Future<Output = Result<IdleStream, UpstreamError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _dst: Uri) -> Self::Future {
        let origin = self.origin.clone();
        Box::pin(async move { origin.connect().await })
    }
}

/// HTTP/1.1 client bound to one origin.
#[derive(Clone)]
pub struct UpstreamTransport {
    origin: Arc<Origin>,
    client: Client<OriginConnector, Body>,
}

impl UpstreamTransport {
    pub fn new(host: impl Into<String>, port: u16, settings: TransportSettings) -> Self {
        let origin = Arc::new(Origin {
            host: host.into(),
            port,
            settings,
            resolved: Mutex::new(None),
        });
        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(origin.settings.max_idle)
            .pool_timer(TokioTimer::new())
            .build(OriginConnector {
                origin: origin.clone(),
            });
        Self { origin, client }
    }

    pub fn host(&self) -> &str {
        &self.origin.host
    }

    pub fn port(&self) -> u16 {
        self.origin.port
    }

    /// `host:port`, bracketed for IPv6 literals.
    pub fn authority(&self) -> String {
        if self.origin.host.contains(':') {
            format!("[{}]:{}", self.origin.host, self.origin.port)
        } else {
            format!("{}:{}", self.origin.host, self.origin.port)
        }
    }

    pub fn settings(&self) -> &TransportSettings {
        &self.origin.settings
    }

    /// Send `req` and wait for the response head.
    pub async fn round_trip(&self, req: Request<Body>) -> Result<Response<Incoming>, UpstreamError> {
        let timeout = self.origin.settings.timeout;
        if timeout.is_zero() {
            return Ok(self.client.request(req).await?);
        }
        match tokio::time::timeout(timeout, self.client.request(req)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(UpstreamError::Timeout(timeout)),
        }
    }
}

impl std::fmt::Debug for UpstreamTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamTransport")
            .field("host", &self.origin.host)
            .field("port", &self.origin.port)
            .finish()
    }
}
