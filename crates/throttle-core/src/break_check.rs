//! Cancellation for blocking throttler waits.
//!
//! Every wait in a bin takes an optional [`BreakCheck`]. Before each
//! condition-variable wait the bin asks the check how long it may sleep; the
//! check either answers with a duration (the wait is capped to it, so the
//! check is consulted again promptly) or with an error, which the bin
//! propagates after the caller has rolled back any partial reservations.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{Result, ThrottleError};

/// How often an [`AbortFlag`] is re-examined while a thread is parked.
const ABORT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Decides whether a blocked throttler call may keep waiting.
pub trait BreakCheck: Send + Sync {
    /// Return the longest the caller may wait before checking again, or an
    /// error if the wait must stop now.
    fn abort_check(&self) -> Result<Duration>;
}

/// Shared abort token. Clone it into the worker; call [`AbortFlag::abort`]
/// from anywhere to break every wait that was given this flag.
#[derive(Debug, Clone, Default)]
pub struct AbortFlag {
    aborted: Arc<AtomicBool>,
}

impl AbortFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Parked waiters notice within the poll interval.
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Relaxed);
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Relaxed)
    }
}

impl BreakCheck for AbortFlag {
    fn abort_check(&self) -> Result<Duration> {
        if self.is_aborted() {
            return Err(ThrottleError::Interrupted);
        }
        Ok(ABORT_POLL_INTERVAL)
    }
}

/// Breaks waits once a fixed point in time has passed.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    pub fn at(at: Instant) -> Self {
        Self { at }
    }

    pub fn after(timeout: Duration) -> Self {
        Self {
            at: Instant::now() + timeout,
        }
    }
}

impl BreakCheck for Deadline {
    fn abort_check(&self) -> Result<Duration> {
        let now = Instant::now();
        if now >= self.at {
            return Err(ThrottleError::TimedOut);
        }
        Ok(self.at - now)
    }
}
