//! HTTP server setup.
//!
//! # Responsibilities
//! - Build the filter pipeline in the configured order
//! - Bind one listener per distinct vhost address (plain or TLS)
//! - Turn each axum request into a [`ProxyRequest`] and run the pipeline
//! - Drain listeners, pools and background jobs on shutdown

use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::Request,
    response::Response,
    Extension, Router,
};
use futures_util::future::join_all;
use thiserror::Error;
use tokio::task::JoinHandle;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use crate::cache::{CacheError, DiskStore, ResponseCache};
use crate::config::ProxyConfig;
use crate::http::request::{ProxyRequest, Scheme};
use crate::http::response;
use crate::lifecycle::{Shutdown, TaskQueue};
use crate::load_balancer::UpstreamFilter;
use crate::net::{tls, BoundedListener, CertBinding, ClientAddr};
use crate::observability::{metrics, CommonLogger};
use crate::pipeline::{Pipeline, RequestFilter, ResponseFilter};
use crate::routing::{VhostRegistry, VhostRouter};
use crate::security::block::BlockNotifier;
use crate::security::captcha::CaptchaBook;
use crate::security::{DdosFilter, StatusFilter};

const CHALLENGE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("cache store unavailable: {0}")]
    Cache(#[from] CacheError),

    #[error("no listener could be bound")]
    NoListeners,
}

/// Application state injected into the handler.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Pipeline,
    pub max_body_size: usize,
}

/// Which listener accepted the connection.
#[derive(Debug, Clone, Copy)]
struct Listening {
    addr: SocketAddr,
    scheme: Scheme,
}

/// The edge server: pipeline plus every listener the vhosts ask for.
pub struct EdgeServer {
    config: ProxyConfig,
    registry: Arc<VhostRegistry>,
    pipeline: Pipeline,
    upstream: Arc<UpstreamFilter>,
    ddos: Arc<DdosFilter>,
    tasks: TaskQueue,
    shutdown: Arc<Shutdown>,
    servers: Mutex<Vec<JoinHandle<()>>>,
}

impl EdgeServer {
    pub fn new(
        config: ProxyConfig,
        registry: Arc<VhostRegistry>,
        tasks: TaskQueue,
        shutdown: Arc<Shutdown>,
    ) -> Result<Self, ServerError> {
        let cache_dir = config
            .cache
            .directory
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::temp_dir().join("cdn-edge-cache"));
        let store = Arc::new(DiskStore::open(cache_dir, config.cache.mem_items)?);
        let hostname = if config.hostname.is_empty() {
            "cdn-edge".to_string()
        } else {
            config.hostname.clone()
        };

        let ddos_config = &config.ddos;
        let ddos = Arc::new(DdosFilter::new(
            CaptchaBook::new(
                &ddos_config.captcha_dir,
                ddos_config.captcha_codes.clone(),
                ddos_config.captcha_sessions,
            ),
            BlockNotifier::new(&ddos_config.block_service_addr, tasks.clone()),
        ));
        let upstream = Arc::new(UpstreamFilter::new(config.upstream.clone()));
        let cache = Arc::new(ResponseCache::new(store, hostname, tasks.clone()));
        let logger = Arc::new(CommonLogger::new(&config.server_name, tasks.clone()));

        let mut pipeline = Pipeline::new();
        for name in &config.pipeline.request_filters {
            let filter: Arc<dyn RequestFilter> = match name.as_str() {
                "vhost" => Arc::new(VhostRouter::new(registry.clone())),
                "access" => Arc::new(StatusFilter::new()),
                "ddos" => ddos.clone(),
                "cache" => cache.clone(),
                "upstream" => upstream.clone(),
                other => {
                    tracing::warn!(filter = other, "Unknown request filter ignored");
                    continue;
                }
            };
            pipeline = pipeline.with_request_filter(filter);
        }
        for name in &config.pipeline.response_filters {
            let filter: Arc<dyn ResponseFilter> = match name.as_str() {
                "cache" => cache.clone(),
                "access_log" => logger.clone(),
                other => {
                    tracing::warn!(filter = other, "Unknown response filter ignored");
                    continue;
                }
            };
            pipeline = pipeline.with_response_filter(filter);
        }

        tracing::info!(
            request_filters = ?pipeline.request_filter_names(),
            response_filters = ?pipeline.response_filter_names(),
            "Pipeline built"
        );

        Ok(Self {
            config,
            registry,
            pipeline,
            upstream,
            ddos,
            tasks,
            shutdown,
            servers: Mutex::new(Vec::new()),
        })
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Build the axum router for one listener.
    #[allow(deprecated)]
    fn build_router(&self, listening: Listening) -> Router {
        let state = AppState {
            pipeline: self.pipeline.clone(),
            max_body_size: self.config.security.max_body_size,
        };
        Router::new()
            .fallback(edge_handler)
            .with_state(state)
            .layer(Extension(listening))
            .layer(TimeoutLayer::new(Duration::from_secs(
                self.config.timeouts.request_secs,
            )))
            .layer(TraceLayer::new_for_http())
    }

    /// Bind every vhost address and start serving. Returns the addresses
    /// that were bound; fails only when none could be.
    pub async fn start(&self) -> Result<Vec<SocketAddr>, ServerError> {
        let snapshot = self.registry.snapshot();
        let mut plain = BTreeSet::new();
        let mut secure: BTreeMap<SocketAddr, Vec<CertBinding>> = BTreeMap::new();
        for vhost in snapshot.vhosts() {
            plain.extend(vhost.binds.iter().copied());
            for ssl in &vhost.ssl {
                secure.entry(ssl.bind).or_default().push(CertBinding {
                    cert_file: ssl.cert_file.clone(),
                    key_file: ssl.key_file.clone(),
                    domains: vhost.hosts.iter().map(|h| h.domain.clone()).collect(),
                });
            }
        }

        let mut bound = Vec::new();
        for addr in plain {
            if secure.contains_key(&addr) {
                tracing::error!(address = %addr, "Address declared both plain and TLS, serving plain");
            }
            if let Some(local) = self.serve_plain(addr).await {
                bound.push(local);
            }
        }
        for (addr, certs) in secure {
            if bound.contains(&addr) {
                continue;
            }
            if let Some(local) = self.serve_tls(addr, &certs) {
                bound.push(local);
            }
        }

        if bound.is_empty() {
            return Err(ServerError::NoListeners);
        }
        self.spawn_sweeper();
        Ok(bound)
    }

    async fn serve_plain(&self, addr: SocketAddr) -> Option<SocketAddr> {
        let listener =
            match BoundedListener::bind(addr, self.config.listener.max_connections).await {
                Ok(listener) => listener,
                Err(e) => {
                    tracing::error!(error = %e, "Listener disabled");
                    return None;
                }
            };
        let local = listener.local_addr().unwrap_or(addr);
        let app = self
            .build_router(Listening {
                addr: local,
                scheme: Scheme::Http,
            })
            .into_make_service_with_connect_info::<ClientAddr>();

        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.wait().await })
                .await;
            match result {
                Ok(()) => tracing::info!(address = %local, "Listener stopped"),
                Err(e) => tracing::error!(address = %local, error = %e, "Listener failed"),
            }
        });
        self.track(handle);
        Some(local)
    }

    fn serve_tls(&self, addr: SocketAddr, certs: &[CertBinding]) -> Option<SocketAddr> {
        let tls_config = match tls::server_config(certs) {
            Ok(config) => config,
            Err(e) => {
                tracing::error!(address = %addr, error = %e, "TLS listener disabled");
                return None;
            }
        };
        let listener = match std::net::TcpListener::bind(addr).and_then(|l| {
            l.set_nonblocking(true)?;
            Ok(l)
        }) {
            Ok(listener) => listener,
            Err(e) => {
                tracing::error!(address = %addr, error = %e, "TLS listener disabled");
                return None;
            }
        };
        let local = listener.local_addr().unwrap_or(addr);
        tracing::info!(address = %local, certificates = certs.len(), "TLS listener bound");

        let app = self
            .build_router(Listening {
                addr: local,
                scheme: Scheme::Https,
            })
            .into_make_service_with_connect_info::<ClientAddr>();

        let handle = axum_server::Handle::new();
        let drain = handle.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            shutdown.wait().await;
            drain.graceful_shutdown(Some(DRAIN_TIMEOUT));
        });

        let server = tokio::spawn(async move {
            let result = axum_server::from_tcp_rustls(listener, tls_config)
                .handle(handle)
                .serve(app)
                .await;
            match result {
                Ok(()) => tracing::info!(address = %local, "TLS listener stopped"),
                Err(e) => tracing::error!(address = %local, error = %e, "TLS listener failed"),
            }
        });
        self.track(server);
        Some(local)
    }

    /// Periodically drop expired challenge state.
    fn spawn_sweeper(&self) {
        let ddos = self.ddos.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CHALLENGE_SWEEP_INTERVAL);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let purged = ddos.clients().purge_expired();
                        if purged > 0 {
                            tracing::debug!(purged, "Expired challenge state dropped");
                        }
                    }
                    _ = shutdown.wait() => break,
                }
            }
        });
    }

    fn track(&self, handle: JoinHandle<()>) {
        self.servers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
    }

    /// Wait for listeners to drain, then stop pools and flush background
    /// jobs.
    pub async fn drain(&self) {
        let handles: Vec<_> = self
            .servers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        if tokio::time::timeout(DRAIN_TIMEOUT, join_all(handles))
            .await
            .is_err()
        {
            tracing::warn!("Listeners did not drain in time");
        }

        self.upstream.shutdown();
        if tokio::time::timeout(DRAIN_TIMEOUT, self.tasks.wait_idle())
            .await
            .is_err()
        {
            tracing::warn!("Background jobs did not finish in time");
        }
    }

    /// Serve until shutdown is triggered.
    pub async fn run(self) -> Result<(), ServerError> {
        let bound = self.start().await?;
        tracing::info!(listeners = bound.len(), "Edge server started");

        self.shutdown.wait().await;
        tracing::info!("Shutting down");
        self.drain().await;
        tracing::info!("Edge server stopped");
        Ok(())
    }
}

async fn edge_handler(
    State(state): State<AppState>,
    Extension(listening): Extension<Listening>,
    ConnectInfo(ClientAddr(client)): ConnectInfo<ClientAddr>,
    request: Request<Body>,
) -> Response<Body> {
    let (parts, body) = request.into_parts();
    let body = match axum::body::to_bytes(body, state.max_body_size).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!(client = %client, error = %e, "Request body rejected");
            return response::payload_too_large();
        }
    };

    // Absolute-form targets are reduced to origin-form.
    let origin_form = match parts.uri.scheme() {
        Some(_) => parts
            .uri
            .path_and_query()
            .and_then(|pq| pq.as_str().parse().ok()),
        None => None,
    };
    let uri = origin_form.unwrap_or(parts.uri);

    let mut req = ProxyRequest::new(
        parts.method,
        uri,
        parts.version,
        parts.headers,
        body,
        client,
        listening.addr,
        listening.scheme,
    );

    let resp = match state.pipeline.execute(&mut req).await {
        Some(resp) => resp,
        None => state.pipeline.finish(&req, response::not_found()).await,
    };

    metrics::record_request(
        req.ctx.vhost_name(),
        resp.status().as_u16(),
        req.started.elapsed(),
    );
    tracing::debug!(
        request_id = %req.id,
        vhost = req.ctx.vhost_name(),
        method = %req.method,
        host = req.host(),
        url = req.url(),
        status = resp.status().as_u16(),
        elapsed_ms = req.started.elapsed().as_millis() as u64,
        "Request served"
    );
    resp
}
