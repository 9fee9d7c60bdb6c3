//! Admission control for requests sent to one origin.
//!
//! `max = 0` admits everything. Waiters park on a `Notify` until a permit is
//! released, the limit is raised, or the throttle is closed.

use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

use crate::load_balancer::transport::UpstreamError;

#[derive(Debug, Default)]
struct State {
    max: usize,
    in_flight: usize,
    queued: usize,
    closed: bool,
}

#[derive(Debug, Default)]
pub struct Throttle {
    state: Mutex<State>,
    released: Notify,
}

/// One admitted request. Dropping it frees the slot.
#[derive(Debug)]
pub struct Permit<'a> {
    throttle: &'a Throttle,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        {
            let mut state = self.throttle.lock();
            state.in_flight = state.in_flight.saturating_sub(1);
        }
        self.throttle.released.notify_one();
    }
}

/// Counts a parked waiter until it is admitted or cancelled.
struct Waiting<'a>(&'a Throttle);

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        let mut state = self.0.lock();
        state.queued = state.queued.saturating_sub(1);
    }
}

impl Throttle {
    pub fn new(max: usize) -> Self {
        Self {
            state: Mutex::new(State {
                max,
                ..Default::default()
            }),
            released: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait for a slot.
    pub async fn acquire(&self) -> Result<Permit<'_>, UpstreamError> {
        let mut waiting: Option<Waiting<'_>> = None;
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if state.closed {
                    drop(state);
                    drop(waiting);
                    return Err(UpstreamError::ThrottleClosed);
                }
                if state.max == 0 || state.in_flight < state.max {
                    state.in_flight += 1;
                    drop(state);
                    drop(waiting);
                    return Ok(Permit { throttle: self });
                }
                if waiting.is_none() {
                    state.queued += 1;
                    drop(state);
                    waiting = Some(Waiting(self));
                }
            }

            notified.await;
        }
    }

    /// Change the limit; waiters re-check immediately.
    pub fn set_max(&self, max: usize) {
        let changed = {
            let mut state = self.lock();
            let changed = state.max != max;
            state.max = max;
            changed
        };
        if changed {
            self.released.notify_waiters();
        }
    }

    pub fn max(&self) -> usize {
        self.lock().max
    }

    pub fn in_flight(&self) -> usize {
        self.lock().in_flight
    }

    /// Requests parked waiting for a slot.
    pub fn queue_len(&self) -> usize {
        self.lock().queued
    }

    /// Fail every current and future waiter.
    pub fn close(&self) {
        self.lock().closed = true;
        self.released.notify_waiters();
    }
}
