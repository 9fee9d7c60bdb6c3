//! Shared utilities for integration tests: raw-TCP mock origins and an
//! edge server bound to a free local port.

#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use cdn_edge::config::schema::{HostConfig, VhostConfig};
use cdn_edge::routing::{VhostDefaults, VhostRegistry};
use cdn_edge::{EdgeServer, ProxyConfig, Shutdown, TaskQueue};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub const DOMAIN: &str = "www.example.com";

/// An unused local address.
pub fn free_addr() -> SocketAddr {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
}

fn status_line(status: u16) -> &'static str {
    match status {
        200 => "200 OK",
        404 => "404 Not Found",
        500 => "500 Internal Server Error",
        502 => "502 Bad Gateway",
        503 => "503 Service Unavailable",
        _ => "200 OK",
    }
}

/// Read until the end of the request head.
async fn read_head(socket: &mut TcpStream) -> Option<String> {
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = socket.read(&mut buf).await.ok()?;
        if n == 0 {
            return None;
        }
        head.extend_from_slice(&buf[..n]);
    }
    Some(String::from_utf8_lossy(&head).to_string())
}

async fn respond(socket: &mut TcpStream, status: u16, body: &str) {
    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status_line(status),
        body.len(),
        body
    );
    let _ = socket.write_all(response.as_bytes()).await;
    let _ = socket.shutdown().await;
}

/// Start a mock origin that returns a fixed 200 response.
pub async fn start_origin(body: &'static str) -> SocketAddr {
    start_programmable_origin(move || async move { (200, body.to_string()) }).await
}

/// Start a mock origin whose answer comes from `f`, called once per request.
pub async fn start_programmable_origin<F, Fut>(f: F) -> SocketAddr
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = (u16, String)> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let f = Arc::new(f);

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let f = f.clone();
            tokio::spawn(async move {
                if read_head(&mut socket).await.is_none() {
                    return;
                }
                let (status, body) = f().await;
                respond(&mut socket, status, &body).await;
            });
        }
    });
    addr
}

/// Start a mock origin that counts the requests it answered.
pub async fn start_counting_origin(body: &'static str) -> (SocketAddr, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    let addr = start_programmable_origin(move || {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            (200, body.to_string())
        }
    })
    .await;
    (addr, hits)
}

/// Start a mock origin that answers with the value of request header `name`.
pub async fn start_header_echo_origin(name: &'static str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let Some(head) = read_head(&mut socket).await else {
                    return;
                };
                let value = head
                    .lines()
                    .filter_map(|line| line.split_once(':'))
                    .find(|(key, _)| key.trim().eq_ignore_ascii_case(name))
                    .map(|(_, value)| value.trim().to_string())
                    .unwrap_or_default();
                respond(&mut socket, 200, &value).await;
            });
        }
    });
    addr
}

/// A vhost on `bind` mapping [`DOMAIN`] to `origin`.
pub fn vhost(bind: SocketAddr, origin: SocketAddr) -> VhostConfig {
    VhostConfig {
        name: "example".to_string(),
        bind: vec![bind.to_string()],
        host: vec![HostConfig {
            ip: origin.ip().to_string(),
            port: origin.port(),
            domain: DOMAIN.to_string(),
            ups: None,
        }],
        ..Default::default()
    }
}

/// A running edge server and the handles a test needs.
pub struct Edge {
    pub addr: SocketAddr,
    pub server: EdgeServer,
    pub shutdown: Arc<Shutdown>,
    pub tasks: TaskQueue,
    _cache_dir: tempfile::TempDir,
}

impl Edge {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub async fn get(&self, path: &str) -> reqwest::Response {
        reqwest::Client::new()
            .get(self.url(path))
            .header(reqwest::header::HOST, DOMAIN)
            .send()
            .await
            .unwrap()
    }

    pub async fn get_owned(&self, path: String) -> reqwest::Response {
        self.get(&path).await
    }

    pub async fn stop(self) {
        self.shutdown.trigger();
        self.server.drain().await;
    }
}

/// Start an edge server for `vhost` with a private cache directory.
pub async fn start_edge(vhost: VhostConfig) -> Edge {
    let cache_dir = tempfile::tempdir().unwrap();
    let mut config = ProxyConfig {
        hostname: "edge-test".to_string(),
        server_name: "cdn-edge".to_string(),
        vhosts: vec![vhost],
        ..Default::default()
    };
    config.cache.directory = Some(cache_dir.path().display().to_string());
    config.upstream.probe_interval_secs = 1;

    let registry = Arc::new(VhostRegistry::new(VhostDefaults::from_config(&config)));
    assert_eq!(registry.install(&config.vhosts), 1);

    let shutdown = Arc::new(Shutdown::new());
    let tasks = TaskQueue::new(64, 4);
    let server = EdgeServer::new(config, registry, tasks.clone(), shutdown.clone()).unwrap();
    let bound = server.start().await.unwrap();

    Edge {
        addr: bound[0],
        server,
        shutdown,
        tasks,
        _cache_dir: cache_dir,
    }
}
