//! Per-vhost request-rate state machine.
//!
//! Two clocks drive it: the rate window (`rtime`) and the challenge hold
//! (`stime`). Both tick from the moment the throttler is created and are
//! advanced lazily by the requests themselves, so no timer task exists.
//!
//! ```text
//!   NORMAL ──(window closes with count >= request)──▶ CHALLENGING
//!   CHALLENGING ──(hold boundary passes)──▶ NORMAL
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use crate::routing::DdosPolicy;

fn nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Thresholds {
    request: u64,
    rtime: u64,
    stime: u64,
}

impl Thresholds {
    fn of(policy: &DdosPolicy) -> Self {
        Self {
            request: policy.request,
            rtime: nanos(policy.rtime),
            stime: nanos(policy.stime),
        }
    }
}

/// Rate window and challenge flag for one vhost.
///
/// Boundaries are nanosecond offsets from `base`. Requests inside the
/// current window only touch atomics; the `roll` lock is taken to close a
/// window, pass a hold boundary or restart after a policy change.
#[derive(Debug)]
pub struct Throttler {
    base: Instant,
    count: AtomicU64,
    active: AtomicBool,
    request: AtomicU64,
    rtime: AtomicU64,
    stime: AtomicU64,
    next_check: AtomicU64,
    next_hold: AtomicU64,
    roll: Mutex<()>,
}

/// Last boundary of `interval` that is `<= now`, starting at `first`, and
/// the next one after `now`. `None` if `first > now`.
fn elapsed_boundaries(first: u64, interval: u64, now: u64) -> Option<(u64, u64)> {
    if now < first {
        return None;
    }
    if interval == 0 {
        return Some((now, now));
    }
    let last = first + (now - first) / interval * interval;
    Some((last, last.saturating_add(interval)))
}

impl Throttler {
    pub fn new(policy: &DdosPolicy) -> Self {
        Self::starting_at(policy, Instant::now())
    }

    fn starting_at(policy: &DdosPolicy, now: Instant) -> Self {
        let thresholds = Thresholds::of(policy);
        Self {
            base: now,
            count: AtomicU64::new(0),
            active: AtomicBool::new(false),
            request: AtomicU64::new(thresholds.request),
            rtime: AtomicU64::new(thresholds.rtime),
            stime: AtomicU64::new(thresholds.stime),
            next_check: AtomicU64::new(thresholds.rtime),
            next_hold: AtomicU64::new(thresholds.stime),
            roll: Mutex::new(()),
        }
    }

    fn thresholds(&self) -> Thresholds {
        Thresholds {
            request: self.request.load(Ordering::Acquire),
            rtime: self.rtime.load(Ordering::Acquire),
            stime: self.stime.load(Ordering::Acquire),
        }
    }

    fn offset(&self, now: Instant) -> u64 {
        nanos(now.saturating_duration_since(self.base))
    }

    /// Bring the state up to date with `Instant::now()`.
    pub fn advance(&self, policy: &DdosPolicy) {
        self.advance_to(policy, Instant::now());
    }

    fn advance_to(&self, policy: &DdosPolicy, now: Instant) {
        let thresholds = Thresholds::of(policy);
        let now = self.offset(now);
        if self.is_current(thresholds, now) {
            return;
        }

        let _roll = self
            .roll
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if self.is_current(thresholds, now) {
            return;
        }

        if self.thresholds() != thresholds {
            // Reloaded policy: restart both clocks.
            self.request.store(thresholds.request, Ordering::Release);
            self.rtime.store(thresholds.rtime, Ordering::Release);
            self.stime.store(thresholds.stime, Ordering::Release);
            self.next_check
                .store(now.saturating_add(thresholds.rtime), Ordering::Release);
            self.next_hold
                .store(now.saturating_add(thresholds.stime), Ordering::Release);
            self.count.store(0, Ordering::SeqCst);
            self.active.store(false, Ordering::SeqCst);
            return;
        }

        let next_check = self.next_check.load(Ordering::Acquire);
        let mut activated_at = None;
        if let Some((_, next)) = elapsed_boundaries(next_check, thresholds.rtime, now) {
            // Requests are only counted after an advance, so everything in
            // the counter belongs to the first elapsed window.
            let seen = self.count.swap(0, Ordering::SeqCst);
            if seen >= thresholds.request {
                activated_at = Some(next_check);
            }
            self.next_check.store(next, Ordering::Release);
        }

        let mut released_at = None;
        let next_hold = self.next_hold.load(Ordering::Acquire);
        if let Some((last, next)) = elapsed_boundaries(next_hold, thresholds.stime, now) {
            released_at = Some(last);
            self.next_hold.store(next, Ordering::Release);
        }

        match (activated_at, released_at) {
            (Some(on), Some(off)) => self.active.store(on > off, Ordering::SeqCst),
            (Some(_), None) => self.active.store(true, Ordering::SeqCst),
            (None, Some(_)) => self.active.store(false, Ordering::SeqCst),
            (None, None) => {}
        }
    }

    /// Same thresholds and no boundary reached yet.
    fn is_current(&self, thresholds: Thresholds, now: u64) -> bool {
        self.thresholds() == thresholds
            && now < self.next_check.load(Ordering::Acquire)
            && now < self.next_hold.load(Ordering::Acquire)
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Count one request in the current window.
    pub fn record(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::SeqCst)
    }
}
