//! Filter pipeline.
//!
//! # Data Flow
//! ```text
//! ProxyRequest
//!     → request filters, in order, until one returns a response
//!         (vhost → access → ddos → cache → upstream)
//!     → response filters, in order, all of them
//!         (cache store → access log)
//!     → transport serializes the response
//! ```
//!
//! # Design Decisions
//! - First response wins: no request filter runs after one answered
//! - Response filters never short-circuit each other; each may replace
//!   the response (the cache filter re-buffers the body)
//! - Filters are trait objects built once per server; per-vhost state
//!   lives inside the filters, keyed by vhost name

pub mod context;

use std::sync::Arc;

use async_trait::async_trait;

use crate::http::request::ProxyRequest;
use crate::http::response::ProxyResponse;

pub use context::{RequestContext, RequestStatus};

/// A stage that may answer the request.
#[async_trait]
pub trait RequestFilter: Send + Sync {
    fn name(&self) -> &'static str;

    /// `None` lets the next filter run.
    async fn filter_request(&self, req: &mut ProxyRequest) -> Option<ProxyResponse>;
}

/// A stage that observes (and may rewrite) the outgoing response.
#[async_trait]
pub trait ResponseFilter: Send + Sync {
    fn name(&self) -> &'static str;

    async fn filter_response(&self, req: &ProxyRequest, resp: ProxyResponse) -> ProxyResponse;
}

/// Ordered request and response filters.
#[derive(Default, Clone)]
pub struct Pipeline {
    request_filters: Vec<Arc<dyn RequestFilter>>,
    response_filters: Vec<Arc<dyn ResponseFilter>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_request_filter(mut self, filter: Arc<dyn RequestFilter>) -> Self {
        self.request_filters.push(filter);
        self
    }

    pub fn with_response_filter(mut self, filter: Arc<dyn ResponseFilter>) -> Self {
        self.response_filters.push(filter);
        self
    }

    pub fn request_filter_names(&self) -> Vec<&'static str> {
        self.request_filters.iter().map(|f| f.name()).collect()
    }

    pub fn response_filter_names(&self) -> Vec<&'static str> {
        self.response_filters.iter().map(|f| f.name()).collect()
    }

    /// Run the request through the pipeline.
    ///
    /// Returns `None` when no request filter produced a response; the caller
    /// decides what to send (see [`Pipeline::finish`]).
    pub async fn execute(&self, req: &mut ProxyRequest) -> Option<ProxyResponse> {
        let mut produced = None;
        for filter in &self.request_filters {
            if let Some(resp) = filter.filter_request(req).await {
                tracing::trace!(request_id = %req.id, filter = filter.name(), "Request answered");
                produced = Some(resp);
                break;
            }
        }

        let resp = produced?;
        Some(self.finish(req, resp).await)
    }

    /// Run a response through every response filter.
    pub async fn finish(&self, req: &ProxyRequest, mut resp: ProxyResponse) -> ProxyResponse {
        for filter in &self.response_filters {
            resp = filter.filter_response(req, resp).await;
        }
        resp
    }
}
