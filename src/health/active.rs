//! Active health checking for upstream pools.
//!
//! # Responsibilities
//! - Periodically ping every pool member (`GET /`, pool host as `Host`)
//! - Flip member weights when the result changes and log the pool status

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::lifecycle::Shutdown;
use crate::load_balancer::pool::PoolState;
use crate::observability::metrics;

pub struct PoolProber {
    pool: Arc<PoolState>,
    interval: Duration,
}

impl PoolProber {
    pub fn new(pool: Arc<PoolState>, interval: Duration) -> Self {
        Self { pool, interval }
    }

    /// Probe every `interval` (first round after one interval) until `stop`.
    pub async fn run(self, stop: Arc<Shutdown>) {
        tracing::debug!(
            pool = %self.pool.host(),
            interval_secs = self.interval.as_secs(),
            "Pool prober starting"
        );

        let mut ticker = time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.probe_all().await,
                _ = stop.wait() => break,
            }
        }
        tracing::info!(pool = %self.pool.host(), "Stopping pings");
    }

    /// Ping all members concurrently and apply the results.
    pub async fn probe_all(&self) {
        let host = self.pool.host();
        let results = join_all(self.pool.members().iter().map(|m| m.ping(host))).await;

        let mut changed = false;
        for (index, up) in results.into_iter().enumerate() {
            if self.pool.set_up(index, up) {
                changed = true;
                let origin = self.pool.members()[index].transport().authority();
                metrics::record_upstream_health(&origin, up);
                if up {
                    tracing::info!(pool = %host, %origin, "Upstream is back up");
                } else {
                    tracing::warn!(pool = %host, %origin, "Upstream is down");
                }
            }
        }
        if changed {
            self.pool.log_status();
        }
    }
}
