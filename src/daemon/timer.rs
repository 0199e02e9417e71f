//! Deferred-work timers for the write-back engine.
//!
//! Both timer populations (per-directory store timers and per-file encryptor
//! teardown timers) share the runtime's worker pool: arming spawns a task
//! that sleeps and then runs the callback unless the fire was cancelled
//! first.
//!
//! The cancelled-count returned by `rearm`/`cancel` is load-bearing for
//! callers: 1 means a pending fire was revoked, 0 means there was nothing
//! pending or the callback already won the race. Cancel-vs-fire is decided by
//! a single atomic transition, so a callback never starts after a successful
//! cancel and a cancel never interrupts a callback that has started.

use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;

const WAITING: u8 = 0;
const FIRING: u8 = 1;
const CANCELLED: u8 = 2;

pub struct DelayTimer {
    pending: Mutex<Option<PendingFire>>,
}

struct PendingFire {
    state: Arc<AtomicU8>,
    handle: JoinHandle<()>,
}

impl DelayTimer {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(None),
        }
    }

    /// Arms the timer, revoking any pending fire. Returns how many pending
    /// fires were cancelled (0 or 1).
    pub fn rearm<F>(&self, delay: Duration, callback: F) -> usize
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut slot = self.pending.lock();
        let cancelled = cancel_slot(&mut slot);

        let state = Arc::new(AtomicU8::new(WAITING));
        let fire_state = state.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if fire_state
                .compare_exchange(WAITING, FIRING, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                callback.await;
            }
        });
        *slot = Some(PendingFire { state, handle });
        cancelled
    }

    /// Revokes the pending fire if the callback has not started yet. Returns
    /// how many fires were cancelled (0 or 1).
    pub fn cancel(&self) -> usize {
        cancel_slot(&mut self.pending.lock())
    }
}

impl Default for DelayTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DelayTimer {
    fn drop(&mut self) {
        cancel_slot(&mut self.pending.lock());
    }
}

fn cancel_slot(slot: &mut Option<PendingFire>) -> usize {
    match slot.take() {
        None => 0,
        Some(pending) => {
            if pending
                .state
                .compare_exchange(WAITING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                pending.handle.abort();
                1
            } else {
                0
            }
        }
    }
}
