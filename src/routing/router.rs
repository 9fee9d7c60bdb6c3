//! Vhost resolution filter.
//!
//! First request filter: attaches the matched vhost to the request
//! context or answers 404.

use std::sync::Arc;

use async_trait::async_trait;

use crate::http::request::ProxyRequest;
use crate::http::response::{self, ProxyResponse};
use crate::pipeline::RequestFilter;
use crate::routing::registry::VhostRegistry;

pub struct VhostRouter {
    registry: Arc<VhostRegistry>,
}

impl VhostRouter {
    pub fn new(registry: Arc<VhostRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl RequestFilter for VhostRouter {
    fn name(&self) -> &'static str {
        "vhost"
    }

    async fn filter_request(&self, req: &mut ProxyRequest) -> Option<ProxyResponse> {
        let local = req.local_addr;
        match self
            .registry
            .matching_vhost(local.ip(), local.port(), req.host())
        {
            Some(vhost) => {
                req.ctx.vhost = Some(vhost);
                None
            }
            None => {
                tracing::debug!(
                    request_id = %req.id,
                    host = %req.host(),
                    local = %local,
                    "No vhost matched"
                );
                Some(response::not_found())
            }
        }
    }
}
