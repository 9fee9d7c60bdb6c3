//! Response cache as a request/response filter pair.
//!
//! # Data Flow
//! ```text
//! request filter:  plan → Store::get (blocking pool) → decode → serve hit
//!                  miss → strip client validators → continue
//! response filter: plan → 2xx? → buffer body → encode → TaskQueue store
//! ```
//!
//! Entries are namespaced by vhost name. Cache I/O failures are misses.

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, HeaderValue, Method, StatusCode};
use bytes::Bytes;
use chrono::DateTime;

use crate::cache::record::CachedResponse;
use crate::cache::rules::{self, CachePlan};
use crate::cache::store::{CacheError, Store};
use crate::http::request::ProxyRequest;
use crate::http::response::{self, ProxyResponse};
use crate::lifecycle::{TaskError, TaskQueue};
use crate::observability::metrics;
use crate::pipeline::{RequestFilter, RequestStatus, ResponseFilter};

pub const X_CACHE: &str = "x-cache";

pub struct ResponseCache {
    store: Arc<dyn Store>,
    hostname: String,
    tasks: TaskQueue,
}

impl ResponseCache {
    pub fn new(store: Arc<dyn Store>, hostname: impl Into<String>, tasks: TaskQueue) -> Self {
        Self {
            store,
            hostname: hostname.into(),
            tasks,
        }
    }

    async fn lookup(&self, namespace: &str, plan: &CachePlan) -> Result<Option<Bytes>, CacheError> {
        let store = self.store.clone();
        let namespace = namespace.to_string();
        let key = plan.key.clone();
        let ttl = plan.ttl;
        tokio::task::spawn_blocking(move || store.get(&namespace, &key, ttl))
            .await
            .map_err(|e| CacheError::Panicked(e.to_string()))?
    }

    fn tag(&self, resp: &mut ProxyResponse, outcome: &str) {
        if let Ok(value) = HeaderValue::from_str(&format!("{outcome} from {}", self.hostname)) {
            resp.headers_mut().insert(X_CACHE, value);
        }
    }

    fn serve_hit(&self, req: &ProxyRequest, record: CachedResponse) -> ProxyResponse {
        let not_modified = is_not_modified(req, &record);
        let head = req.method == Method::HEAD;
        let mut resp = record.into_response(head);
        self.tag(&mut resp, "Hit");

        if not_modified {
            *resp.status_mut() = StatusCode::NOT_MODIFIED;
            *resp.body_mut() = Body::empty();
            resp.headers_mut()
                .insert(header::CONTENT_LENGTH, HeaderValue::from(0));
            return resp;
        }

        if req.method == Method::HEAD || req.method == Method::OPTIONS {
            *resp.body_mut() = Body::empty();
            resp.headers_mut()
                .insert(header::CONNECTION, HeaderValue::from_static("close"));
            if req.method == Method::OPTIONS {
                resp.headers_mut()
                    .insert(header::CONTENT_LENGTH, HeaderValue::from(0));
            }
        }
        resp
    }
}

/// Whether the client's validators match the cached record.
fn is_not_modified(req: &ProxyRequest, record: &CachedResponse) -> bool {
    if let Some(tag) = req.header_str(header::IF_NONE_MATCH).filter(|v| !v.is_empty()) {
        if record.header("etag") == Some(tag) {
            return true;
        }
    }

    let since = req
        .header_str(header::IF_MODIFIED_SINCE)
        .and_then(|v| DateTime::parse_from_rfc2822(v).ok());
    let modified = record
        .header("last-modified")
        .and_then(|v| DateTime::parse_from_rfc2822(v).ok());
    matches!((since, modified), (Some(since), Some(modified)) if modified <= since)
}

#[async_trait]
impl RequestFilter for ResponseCache {
    fn name(&self) -> &'static str {
        "cache"
    }

    async fn filter_request(&self, req: &mut ProxyRequest) -> Option<ProxyResponse> {
        let vhost = req.ctx.vhost.clone()?;
        let plan = rules::plan(req, &vhost)?;

        match self.lookup(&vhost.name, &plan).await {
            Ok(Some(data)) => match CachedResponse::decode(&data) {
                Ok(record) => {
                    req.ctx.status |= RequestStatus::CACHE_HIT;
                    metrics::record_cache("hit");
                    tracing::debug!(request_id = %req.id, key = %plan.key, "Cache hit");
                    return Some(self.serve_hit(req, record));
                }
                Err(e) => tracing::warn!(key = %plan.key, error = %e, "Discarding cache entry"),
            },
            Ok(None) => {}
            Err(e) => tracing::warn!(key = %plan.key, error = %e, "Cache lookup failed"),
        }

        metrics::record_cache("miss");
        req.headers.remove(header::IF_NONE_MATCH);
        req.headers.remove(header::IF_MODIFIED_SINCE);
        None
    }
}

#[async_trait]
impl ResponseFilter for ResponseCache {
    fn name(&self) -> &'static str {
        "cache"
    }

    async fn filter_response(&self, req: &ProxyRequest, resp: ProxyResponse) -> ProxyResponse {
        if req.ctx.status.contains(RequestStatus::CACHE_HIT)
            || req.ctx.status.contains(RequestStatus::DDOS)
        {
            return resp;
        }
        let Some(vhost) = req.ctx.vhost.clone() else {
            return resp;
        };
        let Some(plan) = rules::plan(req, &vhost) else {
            return resp;
        };
        if !resp.status().is_success() {
            return resp;
        }

        let (parts, body) = resp.into_parts();
        let body = match axum::body::to_bytes(body, usize::MAX).await {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(request_id = %req.id, error = %e, "Failed to buffer upstream body");
                return response::bad_gateway();
            }
        };

        let record = CachedResponse::from_parts(parts.status, &parts.headers, &body);
        match record.encode() {
            Ok(encoded) if encoded.len() <= vhost.limits.max_cache_size => {
                let store = self.store.clone();
                let namespace = vhost.name.clone();
                let key = plan.key.clone();
                self.tasks.submit("cache_store", async move {
                    let result = tokio::task::spawn_blocking(move || {
                        store.set(&namespace, &key, Bytes::from(encoded))
                    })
                    .await;
                    match result {
                        Ok(Ok(())) => {
                            metrics::record_cache("store");
                            Ok(())
                        }
                        Ok(Err(e)) => Err(TaskError::Failed(e.to_string())),
                        Err(e) => Err(TaskError::Failed(CacheError::Panicked(e.to_string()).to_string())),
                    }
                });
            }
            Ok(encoded) => {
                tracing::debug!(key = %plan.key, size = encoded.len(), "Response too large to cache");
            }
            Err(e) => tracing::warn!(key = %plan.key, error = %e, "Failed to encode response"),
        }

        let mut resp = ProxyResponse::from_parts(parts, Body::from(body));
        self.tag(&mut resp, "Miss");
        resp
    }
}


#[cfg(test)]
mod tests {
    use super::memory::MemoryStore;
    use super::*;
    use crate::config::schema::{CacheRuleConfig, VhostConfig};
    use crate::routing::vhost::{VhostDefaults, VirtualHost};
    use axum::http::HeaderMap;
    use std::time::Duration;

    struct Broken;

    impl Store for Broken {
        fn get(&self, _: &str, _: &str, _: Duration) -> Result<Option<Bytes>, CacheError> {
            panic!("disk on fire");
        }

        fn set(&self, _: &str, _: &str, _: Bytes) -> Result<(), CacheError> {
            Err(CacheError::Io(std::io::Error::other("read-only")))
        }
    }

    fn vhost(max_cache_size: usize) -> Arc<VirtualHost> {
        let mut config = VhostConfig {
            name: "example".to_string(),
            cache: vec![CacheRuleConfig {
                file_ext: "json".into(),
                time: 60,
                ..Default::default()
            }],
            ..Default::default()
        };
        config.limit.max_cache_size = max_cache_size;
        Arc::new(VirtualHost::compile(&config, &VhostDefaults::default()).unwrap())
    }

    fn request(vhost: &Arc<VirtualHost>, method: &str, uri: &str) -> ProxyRequest {
        let mut req = ProxyRequest::for_test(method, uri, "example.com");
        req.ctx.vhost = Some(vhost.clone());
        req
    }

    fn origin_response() -> ProxyResponse {
        let mut resp = response::bytes(StatusCode::OK, "application/json", &b"{\"a\":1}"[..]);
        resp.headers_mut()
            .insert(header::ETAG, HeaderValue::from_static("\"v1\""));
        resp.headers_mut().insert(
            header::LAST_MODIFIED,
            HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"),
        );
        resp
    }

    async fn body_of(resp: ProxyResponse) -> Bytes {
        axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap()
    }

    async fn warm(cache: &ResponseCache, vhost: &Arc<VirtualHost>) {
        let mut req = request(vhost, "GET", "/foo.json");
        assert!(cache.filter_request(&mut req).await.is_none());
        let resp = cache.filter_response(&req, origin_response()).await;
        assert_eq!(resp.headers()[X_CACHE], "Miss from edge-1");
        assert_eq!(&body_of(resp).await[..], b"{\"a\":1}");
        cache.tasks.wait_idle().await;
    }

    #[tokio::test]
    async fn miss_then_hit() {
        let store = Arc::new(MemoryStore::default());
        let cache = ResponseCache::new(store.clone(), "edge-1", TaskQueue::new(16, 2));
        let vhost = vhost(0);
        warm(&cache, &vhost).await;
        assert_eq!(store.entries.lock().unwrap().len(), 1);

        let mut req = request(&vhost, "GET", "/foo.json");
        let resp = cache.filter_request(&mut req).await.unwrap();
        assert!(req.ctx.status.contains(RequestStatus::CACHE_HIT));
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[X_CACHE], "Hit from edge-1");
        assert_eq!(resp.headers()[header::ETAG], "\"v1\"");
        assert_eq!(&body_of(resp).await[..], b"{\"a\":1}");

        // The response filter leaves hits alone.
        let passthrough = cache
            .filter_response(&req, response::text(StatusCode::OK, "x"))
            .await;
        assert!(passthrough.headers().get(X_CACHE).is_none());
    }

    #[tokio::test]
    async fn matching_etag_yields_304() {
        let cache = ResponseCache::new(Arc::new(MemoryStore::default()), "edge-1", TaskQueue::new(16, 2));
        let vhost = vhost(0);
        warm(&cache, &vhost).await;

        let mut req = request(&vhost, "GET", "/foo.json");
        req.headers
            .insert(header::IF_NONE_MATCH, HeaderValue::from_static("\"v1\""));
        let resp = cache.filter_request(&mut req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_MODIFIED);
        assert_eq!(resp.headers()[header::CONTENT_LENGTH], "0");
        assert!(body_of(resp).await.is_empty());
    }

    #[tokio::test]
    async fn if_modified_since_yields_304() {
        let cache = ResponseCache::new(Arc::new(MemoryStore::default()), "edge-1", TaskQueue::new(16, 2));
        let vhost = vhost(0);
        warm(&cache, &vhost).await;

        let mut req = request(&vhost, "GET", "/foo.json");
        req.headers.insert(
            header::IF_MODIFIED_SINCE,
            HeaderValue::from_static("Thu, 22 Oct 2015 07:28:00 GMT"),
        );
        let resp = cache.filter_request(&mut req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_MODIFIED);

        let mut req = request(&vhost, "GET", "/foo.json");
        req.headers.insert(
            header::IF_MODIFIED_SINCE,
            HeaderValue::from_static("Tue, 20 Oct 2015 07:28:00 GMT"),
        );
        let resp = cache.filter_request(&mut req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn miss_strips_client_validators() {
        let cache = ResponseCache::new(Arc::new(MemoryStore::default()), "edge-1", TaskQueue::new(16, 2));
        let vhost = vhost(0);
        let mut req = request(&vhost, "GET", "/foo.json");
        req.headers
            .insert(header::IF_NONE_MATCH, HeaderValue::from_static("\"v0\""));
        req.headers.insert(
            header::IF_MODIFIED_SINCE,
            HeaderValue::from_static("Tue, 20 Oct 2015 07:28:00 GMT"),
        );
        assert!(cache.filter_request(&mut req).await.is_none());
        assert!(req.headers.get(header::IF_NONE_MATCH).is_none());
        assert!(req.headers.get(header::IF_MODIFIED_SINCE).is_none());
    }

    #[tokio::test]
    async fn oversized_and_error_responses_are_not_stored() {
        let store = Arc::new(MemoryStore::default());
        let cache = ResponseCache::new(store.clone(), "edge-1", TaskQueue::new(16, 2));

        let small = vhost(10);
        let req = request(&small, "GET", "/foo.json");
        let resp = cache.filter_response(&req, origin_response()).await;
        assert_eq!(resp.headers()[X_CACHE], "Miss from edge-1");

        let roomy = vhost(0);
        let req = request(&roomy, "GET", "/foo.json");
        let resp = cache
            .filter_response(&req, response::text(StatusCode::NOT_FOUND, "nope"))
            .await;
        assert!(resp.headers().get(X_CACHE).is_none());

        cache.tasks.wait_idle().await;
        assert!(store.entries.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn head_hit_has_no_body() {
        let cache = ResponseCache::new(Arc::new(MemoryStore::default()), "edge-1", TaskQueue::new(16, 2));
        let vhost = vhost(0);

        let req = request(&vhost, "HEAD", "/foo.json");
        cache.filter_response(&req, origin_response()).await;
        cache.tasks.wait_idle().await;

        let mut req = request(&vhost, "HEAD", "/foo.json");
        let resp = cache.filter_request(&mut req).await.unwrap();
        assert_eq!(resp.headers()[header::CONNECTION], "close");
        assert!(body_of(resp).await.is_empty());
    }

    #[tokio::test]
    async fn store_failures_are_misses() {
        let tasks = TaskQueue::new(16, 2);
        let cache = ResponseCache::new(Arc::new(Broken), "edge-1", tasks.clone());
        let vhost = vhost(0);

        let mut req = request(&vhost, "GET", "/foo.json");
        assert!(cache.filter_request(&mut req).await.is_none());

        let resp = cache.filter_response(&req, origin_response()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        tasks.wait_idle().await;
        assert_eq!(tasks.stats().failed.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn validators_need_both_dates() {
        let record = CachedResponse::from_parts(StatusCode::OK, &HeaderMap::new(), b"");
        let mut req = ProxyRequest::for_test("GET", "/", "a");
        req.headers.insert(
            header::IF_MODIFIED_SINCE,
            HeaderValue::from_static("Tue, 20 Oct 2015 07:28:00 GMT"),
        );
        assert!(!is_not_modified(&req, &record));
    }

    #[tokio::test]
    async fn head_hit_announces_stored_length() {
        let cache = ResponseCache::new(Arc::new(MemoryStore::default()), "edge-1", TaskQueue::new(16, 2));
        let vhost = vhost(0);

        let mut req = request(&vhost, "HEAD", "/foo.json");
        assert!(cache.filter_request(&mut req).await.is_none());
        let mut origin = ProxyResponse::new(Body::empty());
        origin
            .headers_mut()
            .insert(header::CONTENT_LENGTH, HeaderValue::from_static("7"));
        cache.filter_response(&req, origin).await;
        cache.tasks.wait_idle().await;

        let mut req = request(&vhost, "HEAD", "/foo.json");
        let resp = cache.filter_request(&mut req).await.unwrap();
        assert_eq!(resp.headers()[X_CACHE], "Hit from edge-1");
        assert_eq!(resp.headers()[header::CONTENT_LENGTH], "7");
        assert!(body_of(resp).await.is_empty());
    }
}
