//! Monitor helpers shared by the three bin kinds.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::break_check::BreakCheck;
use crate::error::Result;

/// Lock a bin's state. A poisoned lock only means another thread panicked on
/// a contract violation; the counters themselves are still coherent.
pub(crate) fn lock<T>(state: &Mutex<T>) -> MutexGuard<'_, T> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Park on `condvar` for at most `limit` (forever if `None`), further capped
/// by whatever the break check allows. Callers always re-check their
/// predicate afterwards: wake-ups may be spurious or meant for someone else.
pub(crate) fn wait<'a, T>(
    condvar: &Condvar,
    guard: MutexGuard<'a, T>,
    limit: Option<Duration>,
    break_check: Option<&dyn BreakCheck>,
) -> Result<MutexGuard<'a, T>> {
    let allowed = match break_check {
        Some(check) => Some(check.abort_check()?),
        None => None,
    };
    let timeout = match (limit, allowed) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    };
    let guard = match timeout {
        Some(t) => {
            condvar
                .wait_timeout(guard, t)
                .unwrap_or_else(PoisonError::into_inner)
                .0
        }
        None => condvar.wait(guard).unwrap_or_else(PoisonError::into_inner),
    };
    Ok(guard)
}

/// Wall-clock milliseconds since the epoch. Fetch times are compared across
/// processes through the service registry, so they cannot be `Instant`s.
pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Convert a positive millisecond count into a wait duration.
pub(crate) fn millis(ms: i64) -> Duration {
    Duration::from_millis(ms.max(0) as u64)
}
