//! Shared primitives: wall-clock helpers, cache keys, the shutdown signal
//! threaded into every background loop and the latch its stoppers wait on.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{watch, Notify};

/// Milliseconds since UNIX epoch.
#[inline]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Converts a duration to whole milliseconds, saturating at `u64::MAX`.
#[inline]
pub fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

// ================================================================================================
// BEACON KEY
// ================================================================================================

/// Cache key of one (possibly split) session.
///
/// Sessions split by a [`SessionProxy`](crate::session::SessionProxy) keep
/// their session number and bump the sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BeaconKey {
    pub session_number: u32,
    pub session_sequence: u32,
}

impl BeaconKey {
    pub fn new(session_number: u32, session_sequence: u32) -> Self {
        Self {
            session_number,
            session_sequence,
        }
    }
}

impl fmt::Display for BeaconKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[sn={}, seq={}]", self.session_number, self.session_sequence)
    }
}

// ================================================================================================
// SHUTDOWN SIGNAL
// ================================================================================================

/// Monotone cancellation flag for a background worker.
///
/// The flag is set once and never cleared. Reads are a plain atomic load;
/// sleepers are woken through a [`Notify`] so an interruptible sleep returns
/// as soon as shutdown is requested instead of waiting out its duration.
#[derive(Debug, Default)]
pub struct ShutdownSignal {
    requested: AtomicBool,
    notify: Notify,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the flag and wakes all current waiters. Later calls are no-ops.
    pub fn request(&self) {
        if !self.requested.swap(true, Ordering::AcqRel) {
            self.notify.notify_waiters();
        }
    }

    #[inline]
    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    /// Resolves once shutdown has been requested.
    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // register before checking the flag so a concurrent request cannot be missed
            notified.as_mut().enable();
            if self.is_requested() {
                return;
            }
            notified.await;
        }
    }

    /// Sleeps for `duration` unless shutdown is requested first.
    ///
    /// Returns `true` when the sleep was cut short by shutdown.
    pub async fn sleep(&self, duration: Duration) -> bool {
        if self.is_requested() {
            return true;
        }
        tokio::select! {
            _ = self.wait() => true,
            _ = tokio::time::sleep(duration) => self.is_requested(),
        }
    }
}

// ================================================================================================
// COMPLETION LATCH
// ================================================================================================

/// One-way flag marking that a background worker has fully stopped.
///
/// Whoever finishes the stop work completes the latch; every other caller
/// of a blocking stop waits on it, so no caller returns while the worker is
/// still running. Completing twice is a no-op.
#[derive(Debug)]
pub struct CompletionLatch {
    done: watch::Sender<bool>,
}

impl Default for CompletionLatch {
    fn default() -> Self {
        Self::new()
    }
}

impl CompletionLatch {
    pub fn new() -> Self {
        let (done, _) = watch::channel(false);
        Self { done }
    }

    pub fn complete(&self) {
        self.done.send_if_modified(|done| !std::mem::replace(done, true));
    }

    #[inline]
    pub fn is_complete(&self) -> bool {
        *self.done.borrow()
    }

    /// Resolves once [`complete`](Self::complete) was called.
    pub async fn wait(&self) {
        let mut receiver = self.done.subscribe();
        // the sender lives in `self`, so the channel cannot close while waiting
        let _ = receiver.wait_for(|done| *done).await;
    }
}
