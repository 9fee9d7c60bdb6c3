//! DDoS challenge filter.
//!
//! # Data Flow
//! ```text
//! request (vhost resolved, access flags set)
//!     → Throttler::advance (lazy window / hold bookkeeping)
//!     → NORMAL: count if not whitelisted, continue
//!     → CHALLENGING:
//!         captcha image path     → PNG
//!         client passed          → continue
//!         answer matches token   → store pass (24h), continue
//!         otherwise              → count failure, maybe block, challenge page
//! ```
//!
//! # Design Decisions
//! - One throttler per vhost name, created on first request and kept for
//!   the process lifetime; a reloaded policy restarts its clocks
//! - Challenge state is per `vhost:ip`; CAPTCHA sessions are per
//!   `sha256(ip + User-Agent)`

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::{header, HeaderValue, StatusCode};
use dashmap::DashMap;

use crate::http::request::ProxyRequest;
use crate::http::response::{self, ProxyResponse};
use crate::observability::metrics;
use crate::pipeline::{RequestFilter, RequestStatus};
use crate::security::block::BlockNotifier;
use crate::security::captcha::{self, CaptchaBook};
use crate::security::challenge::{self, ChallengeMode, CAPTCHA_PATH, TOKEN_PARAM};
use crate::security::client_state::{self, ChallengeStore, ClientState};
use crate::security::throttle::Throttler;

const TOKEN_TTL: Duration = Duration::from_secs(5);
const PASS_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const FAILURE_TTL: Duration = Duration::from_secs(600);

pub struct DdosFilter {
    throttlers: DashMap<String, Arc<Throttler>>,
    clients: ChallengeStore,
    captcha: CaptchaBook,
    blocker: BlockNotifier,
}

impl DdosFilter {
    pub fn new(captcha: CaptchaBook, blocker: BlockNotifier) -> Self {
        Self {
            throttlers: DashMap::new(),
            clients: ChallengeStore::new(),
            captcha,
            blocker,
        }
    }

    pub fn throttler(&self, vhost: &str) -> Option<Arc<Throttler>> {
        self.throttlers.get(vhost).map(|t| t.clone())
    }

    pub fn clients(&self) -> &ChallengeStore {
        &self.clients
    }

    async fn captcha_image(&self, session: &str) -> ProxyResponse {
        match self.captcha.image(session).await {
            Ok(png) => {
                let mut resp = response::bytes(StatusCode::OK, "image/png", png);
                resp.headers_mut()
                    .insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
                resp
            }
            Err(e) => {
                tracing::warn!(error = %e, "Captcha image unavailable");
                response::not_found()
            }
        }
    }
}

#[async_trait]
impl RequestFilter for DdosFilter {
    fn name(&self) -> &'static str {
        "ddos"
    }

    async fn filter_request(&self, req: &mut ProxyRequest) -> Option<ProxyResponse> {
        let vhost = req.ctx.vhost.clone()?;
        let policy = &vhost.ddos;
        if !policy.enabled() {
            return None;
        }

        let throttler = self
            .throttlers
            .entry(vhost.name.clone())
            .or_insert_with(|| Arc::new(Throttler::new(policy)))
            .clone();
        throttler.advance(policy);

        if !throttler.is_active() {
            if !req.ctx.whitelisted {
                throttler.record();
            }
            return None;
        }

        let ip = req.client_ip().to_string();
        let session = captcha::session_key(&ip, req.user_agent());

        if policy.mode == ChallengeMode::Captcha && req.path() == CAPTCHA_PATH {
            return Some(self.captcha_image(&session).await);
        }

        let token_key = client_state::token_key(&vhost.name, &ip);
        let mut expected = match self.clients.state(&token_key) {
            Some(ClientState::Passed) => return None,
            Some(ClientState::Pending(token)) => token,
            None => {
                let token = challenge::generate_token();
                self.clients
                    .set_state(&token_key, ClientState::Pending(token.clone()), TOKEN_TTL);
                metrics::record_challenge(&vhost.name, "issued");
                token
            }
        };
        if policy.mode == ChallengeMode::Captcha {
            if let Some(code) = self.captcha.expected_code(&session) {
                expected = code;
            }
        }

        let failure_key = client_state::failure_key(&vhost.name, &ip);
        let answer = req.query_param(TOKEN_PARAM).unwrap_or_default();
        if challenge::token_matches(&answer, &expected) {
            self.clients.remove(&failure_key);
            self.clients
                .set_state(&token_key, ClientState::Passed, PASS_TTL);
            self.captcha.forget(&session);
            metrics::record_challenge(&vhost.name, "passed");
            tracing::debug!(vhost = %vhost.name, client = %ip, "Challenge passed");
            return None;
        }

        let failures = self.clients.record_failure(&failure_key, FAILURE_TTL);
        if policy.hits > 0 && failures >= policy.hits {
            tracing::info!(vhost = %vhost.name, client = %ip, failures, "Blocking client");
            self.blocker.block(req.client_ip(), policy.block_time);
        }

        req.ctx.status |= RequestStatus::DDOS;
        let body = challenge::challenge_body(policy.mode, req.url(), &expected);
        Some(match policy.mode {
            ChallengeMode::Text => response::text(StatusCode::OK, body),
            _ => response::html(StatusCode::OK, body),
        })
    }
}
