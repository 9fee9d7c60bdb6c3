//! Per-client challenge state with lazy expiry.
//!
//! Keys are `ddos:<vhost>:<ip>` for the issued token (or the pass marker)
//! and `ccbl:<vhost>:<ip>` for the failure counter.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

const SWEEP_EVERY: usize = 1024;

/// What a client currently holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientState {
    /// Challenge issued; the client must echo this token.
    Pending(String),
    /// Challenge solved.
    Passed,
}

#[derive(Debug, Clone)]
enum Value {
    State(ClientState),
    Failures(u64),
}

#[derive(Debug, Clone)]
struct Slot {
    value: Value,
    expires_at: Instant,
}

/// Concurrent TTL map for challenge bookkeeping.
#[derive(Debug, Default)]
pub struct ChallengeStore {
    slots: DashMap<String, Slot>,
    writes: AtomicUsize,
}

pub fn token_key(vhost: &str, ip: &str) -> String {
    format!("ddos:{vhost}:{ip}")
}

pub fn failure_key(vhost: &str, ip: &str) -> String {
    format!("ccbl:{vhost}:{ip}")
}

impl ChallengeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, key: &str) -> Option<ClientState> {
        let now = Instant::now();
        let slot = self.live(key, now)?;
        match slot.value {
            Value::State(state) => Some(state),
            Value::Failures(_) => None,
        }
    }

    pub fn set_state(&self, key: &str, state: ClientState, ttl: Duration) {
        self.put(key, Value::State(state), ttl);
    }

    /// Count one failure. The TTL starts with the first failure and is
    /// not extended by later ones.
    pub fn record_failure(&self, key: &str, ttl: Duration) -> u64 {
        let now = Instant::now();
        let mut slot = self.slots.entry(key.to_string()).or_insert_with(|| Slot {
            value: Value::Failures(0),
            expires_at: now + ttl,
        });
        if slot.expires_at <= now || !matches!(slot.value, Value::Failures(_)) {
            *slot = Slot {
                value: Value::Failures(0),
                expires_at: now + ttl,
            };
        }
        let count = match &mut slot.value {
            Value::Failures(n) => {
                *n += 1;
                *n
            }
            Value::State(_) => 1,
        };
        drop(slot);
        self.maybe_sweep(now);
        count
    }

    pub fn failures(&self, key: &str) -> u64 {
        match self.live(key, Instant::now()) {
            Some(Slot {
                value: Value::Failures(n),
                ..
            }) => n,
            _ => 0,
        }
    }

    pub fn remove(&self, key: &str) {
        self.slots.remove(key);
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Drop every expired slot. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.slots.len();
        self.slots.retain(|_, slot| slot.expires_at > now);
        before.saturating_sub(self.slots.len())
    }

    fn live(&self, key: &str, now: Instant) -> Option<Slot> {
        let slot = self.slots.get(key)?.clone();
        if slot.expires_at <= now {
            self.slots.remove_if(key, |_, s| s.expires_at <= now);
            return None;
        }
        Some(slot)
    }

    fn put(&self, key: &str, value: Value, ttl: Duration) {
        let now = Instant::now();
        self.slots.insert(
            key.to_string(),
            Slot {
                value,
                expires_at: now + ttl,
            },
        );
        self.maybe_sweep(now);
    }

    fn maybe_sweep(&self, now: Instant) {
        if self.writes.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY == SWEEP_EVERY - 1 {
            self.slots.retain(|_, slot| slot.expires_at > now);
        }
    }
}
