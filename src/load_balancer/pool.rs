//! Upstream pools.
//!
//! # Responsibilities
//! - Hand out members in weighted round-robin order from one scheduler task
//! - Take a member out of rotation when a proxied request fails through it
//! - Run the health prober that brings members back
//!
//! # Design Decisions
//! - The weight table has its own `RwLock`; the scheduler only reads it
//! - Callers ask the scheduler over a channel and wait on a oneshot reply
//! - Shutting the pool down (or dropping it) stops both background tasks
//!   and fails requests parked in member throttles

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::health::active::PoolProber;
use crate::http::request::ProxyRequest;
use crate::http::response::{self, ProxyResponse};
use crate::lifecycle::Shutdown;
use crate::load_balancer::round_robin::RoundRobin;
use crate::load_balancer::upstream::Upstream;
use crate::pipeline::RequestStatus;

const SCHEDULER_QUEUE: usize = 256;

/// Members and weights shared by the pool, its scheduler and its prober.
#[derive(Debug)]
pub struct PoolState {
    host: String,
    members: Vec<Arc<Upstream>>,
    configured: Vec<u32>,
    weights: RwLock<Vec<u32>>,
}

impl PoolState {
    pub fn new(host: impl Into<String>, members: Vec<(Upstream, u32)>) -> Self {
        let (members, configured): (Vec<_>, Vec<_>) = members
            .into_iter()
            .map(|(upstream, weight)| (Arc::new(upstream), weight))
            .unzip();
        Self {
            host: host.into(),
            weights: RwLock::new(configured.clone()),
            members,
            configured,
        }
    }

    /// `Host` used for health probes.
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn members(&self) -> &[Arc<Upstream>] {
        &self.members
    }

    pub fn weights(&self) -> Vec<u32> {
        self.weights.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn is_up(&self, index: usize) -> bool {
        self.weights
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(index)
            .is_some_and(|w| *w > 0)
    }

    /// Record a probe result. Returns `true` if the member flipped.
    pub fn set_up(&self, index: usize, up: bool) -> bool {
        let mut weights = self.weights.write().unwrap_or_else(PoisonError::into_inner);
        let Some(weight) = weights.get_mut(index) else {
            return false;
        };
        if (*weight > 0) == up {
            return false;
        }
        *weight = if up {
            self.configured[index].max(1)
        } else {
            0
        };
        true
    }

    pub fn mark_down(&self, index: usize) {
        self.set_up(index, false);
    }

    pub fn log_status(&self) {
        let weights = self.weights();
        for (member, weight) in self.members.iter().zip(weights) {
            tracing::info!(
                pool = %self.host,
                origin = %member.transport().authority(),
                weight,
                "Upstream pool member"
            );
        }
    }
}

/// Functionally equivalent origins behind one name.
pub struct UpstreamPool {
    state: Arc<PoolState>,
    next_tx: mpsc::Sender<oneshot::Sender<usize>>,
    stop: Arc<Shutdown>,
}

impl UpstreamPool {
    /// Start the scheduler and, with a non-zero interval, the prober.
    pub fn new(state: PoolState, probe_interval: Duration) -> Self {
        let state = Arc::new(state);
        let stop = Arc::new(Shutdown::new());
        let (next_tx, next_rx) = mpsc::channel(SCHEDULER_QUEUE);

        tokio::spawn(schedule(state.clone(), next_rx, stop.clone()));
        if !probe_interval.is_zero() {
            let prober = PoolProber::new(state.clone(), probe_interval);
            tokio::spawn(prober.run(stop.clone()));
        }

        Self {
            state,
            next_tx,
            stop,
        }
    }

    pub fn state(&self) -> &Arc<PoolState> {
        &self.state
    }

    /// Next member to use, or `None` once the pool is shut down.
    pub async fn next(&self) -> Option<(usize, Arc<Upstream>)> {
        let (reply, rx) = oneshot::channel();
        self.next_tx.send(reply).await.ok()?;
        let index = rx.await.ok()?;
        Some((index, self.state.members[index].clone()))
    }

    /// Proxy through the next member; a failure takes that member out of
    /// rotation until the prober sees it up again.
    pub async fn forward(&self, req: &mut ProxyRequest) -> ProxyResponse {
        let Some((index, upstream)) = self.next().await else {
            tracing::error!(pool = %self.state.host, "Upstream pool is shut down");
            return response::bad_gateway();
        };

        let resp = upstream.forward(req).await;
        if req.ctx.status.contains(RequestStatus::UPSTREAM_FAILED) {
            tracing::error!(
                pool = %self.state.host,
                origin = %upstream.transport().authority(),
                "Marking upstream down"
            );
            self.state.mark_down(index);
            self.state.log_status();
        }
        resp
    }

    pub fn shutdown(&self) {
        if self.stop.is_triggered() {
            return;
        }
        self.stop.trigger();
        for member in &self.state.members {
            member.close();
        }
    }
}

impl Drop for UpstreamPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn schedule(
    state: Arc<PoolState>,
    mut requests: mpsc::Receiver<oneshot::Sender<usize>>,
    stop: Arc<Shutdown>,
) {
    let mut rr = RoundRobin::new();
    loop {
        tokio::select! {
            _ = stop.wait() => break,
            reply = requests.recv() => {
                let Some(reply) = reply else { break };
                if let Some(index) = rr.next(&state.weights()) {
                    let _ = reply.send(index);
                }
            }
        }
    }
    tracing::debug!(pool = %state.host, "Pool scheduler stopped");
}
