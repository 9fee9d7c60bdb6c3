//! TCP listener with backpressure.
//!
//! # Responsibilities
//! - Bind one vhost address
//! - Enforce `max_connections` via a semaphore held by each connection
//! - Survive accept errors (logged, retried after a short pause)

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::extract::connect_info::Connected;
use axum::serve::IncomingStream;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

/// A TCP listener that holds at most `max_connections` open connections.
///
/// When the limit is reached, accepting pauses until a connection closes.
#[derive(Debug)]
pub struct BoundedListener {
    inner: TcpListener,
    connection_limit: Arc<Semaphore>,
    max_connections: usize,
}

impl BoundedListener {
    pub async fn bind(addr: SocketAddr, max_connections: usize) -> Result<Self, ListenerError> {
        let inner = TcpListener::bind(addr)
            .await
            .map_err(|source| ListenerError::Bind { addr, source })?;
        let max_connections = max_connections.max(1);

        tracing::info!(address = %addr, max_connections, "Listener bound");

        Ok(Self {
            inner,
            connection_limit: Arc::new(Semaphore::new(max_connections)),
            max_connections,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    pub fn available_permits(&self) -> usize {
        self.connection_limit.available_permits()
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Wait for a free slot, then for a connection.
    pub async fn accept_limited(&mut self) -> (LimitedStream, SocketAddr) {
        loop {
            let permit = match self.connection_limit.clone().acquire_owned().await {
                Ok(permit) => permit,
                // Never closed.
                Err(_) => std::future::pending().await,
            };

            match self.inner.accept().await {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
                    }
                    tracing::trace!(
                        peer = %peer,
                        available_permits = self.connection_limit.available_permits(),
                        "Connection accepted"
                    );
                    return (
                        LimitedStream {
                            inner: stream,
                            _permit: permit,
                        },
                        peer,
                    );
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Accept failed");
                    drop(permit);
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                }
            }
        }
    }
}

impl axum::serve::Listener for BoundedListener {
    type Io = LimitedStream;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        self.accept_limited().await
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        self.inner.local_addr()
    }
}

/// Peer address of an accepted connection, as seen by handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientAddr(pub SocketAddr);

impl Connected<IncomingStream<'_, BoundedListener>> for ClientAddr {
    fn connect_info(stream: IncomingStream<'_, BoundedListener>) -> Self {
        ClientAddr(*stream.remote_addr())
    }
}

impl Connected<SocketAddr> for ClientAddr {
    fn connect_info(addr: SocketAddr) -> Self {
        ClientAddr(addr)
    }
}

/// An accepted connection. Its slot is released when it is dropped.
#[derive(Debug)]
pub struct LimitedStream {
    inner: TcpStream,
    _permit: OwnedSemaphorePermit,
}

impl AsyncRead for LimitedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for LimitedStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn bind_failure_names_the_address() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap();
        let err = BoundedListener::bind(addr, 10).await.unwrap_err();
        assert!(err.to_string().contains(&addr.to_string()));
    }

    #[tokio::test]
    async fn slots_are_released_on_close() {
        let mut listener = BoundedListener::bind("127.0.0.1:0".parse().unwrap(), 1)
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        let (mut conn, _) = listener.accept_limited().await;
        assert_eq!(listener.available_permits(), 0);

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        drop(conn);
        assert_eq!(listener.available_permits(), 1);
    }

    #[tokio::test]
    async fn full_listener_waits_for_a_slot() {
        let mut listener = BoundedListener::bind("127.0.0.1:0".parse().unwrap(), 1)
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();

        let _a = TcpStream::connect(addr).await.unwrap();
        let _b = TcpStream::connect(addr).await.unwrap();
        let (first, _) = listener.accept_limited().await;

        let second = tokio::time::timeout(Duration::from_millis(50), listener.accept_limited()).await;
        assert!(second.is_err());

        drop(first);
        let second = tokio::time::timeout(Duration::from_secs(1), listener.accept_limited()).await;
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn serve_exposes_the_peer_address() {
        use axum::extract::ConnectInfo;
        use axum::routing::get;

        let listener = BoundedListener::bind("127.0.0.1:0".parse().unwrap(), 4)
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        let app = axum::Router::new()
            .route(
                "/",
                get(|ConnectInfo(ClientAddr(peer)): ConnectInfo<ClientAddr>| async move {
                    peer.ip().to_string()
                }),
            )
            .into_make_service_with_connect_info::<ClientAddr>();
        tokio::spawn(async move { axum::serve(listener, app).await });

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"GET / HTTP/1.1\r\nHost: a\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut reply = String::new();
        client.read_to_string(&mut reply).await.unwrap();
        assert!(reply.starts_with("HTTP/1.1 200"));
        assert!(reply.ends_with("127.0.0.1"));
    }

    #[test]
    fn tls_peer_address_converts() {
        let addr: SocketAddr = "203.0.113.7:51000".parse().unwrap();
        assert_eq!(<ClientAddr as Connected<SocketAddr>>::connect_info(addr), ClientAddr(addr));
    }
}
