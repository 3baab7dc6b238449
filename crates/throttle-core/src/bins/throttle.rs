//! Byte-rate throttling for one bin.
//!
//! A *series* is a run of overlapping fetches on the bin. The first read of a
//! series goes through unthrottled and its observed speed becomes the per-byte
//! estimate; every later read waits just long enough that, given that
//! estimate, the series as a whole stays under the configured rate.

use std::sync::{Arc, Condvar, Mutex};

use super::wait;
use crate::break_check::BreakCheck;
use crate::error::Result;
use crate::registry::{
    interval_from_share, rate_share, service_type_name, ServiceRegistration, ServiceRegistry,
    ServiceReport,
};

const SERVICE_PREFIX: &str = "_THROTTLEBIN_";

#[derive(Debug)]
struct ThrottleState {
    alive: bool,
    ref_count: u32,
    /// Milliseconds per byte seen on the estimating read.
    rate_estimate: f64,
    estimate_valid: bool,
    estimate_in_progress: bool,
    series_start_time: i64,
    total_bytes_read: i64,
    minimum_milliseconds_per_byte: f64,
    /// Share of the byte rate granted to this process; `None` until one is.
    local_minimum: Option<f64>,
}

#[derive(Debug)]
pub struct ThrottleBin {
    bin_name: String,
    state: Mutex<ThrottleState>,
    changed: Condvar,
    service: ServiceRegistration,
}

impl ThrottleBin {
    pub fn new(
        registry: Arc<dyn ServiceRegistry>,
        group_name: &str,
        bin_name: &str,
        minimum_milliseconds_per_byte: f64,
    ) -> Result<Self> {
        let service = ServiceRegistration::register(
            registry,
            service_type_name(SERVICE_PREFIX, group_name, bin_name),
        )?;
        Ok(Self {
            bin_name: bin_name.to_string(),
            state: Mutex::new(ThrottleState {
                alive: true,
                ref_count: 0,
                rate_estimate: 0.0,
                estimate_valid: false,
                estimate_in_progress: false,
                series_start_time: -1,
                total_bytes_read: 0,
                minimum_milliseconds_per_byte,
                local_minimum: Some(minimum_milliseconds_per_byte),
            }),
            changed: Condvar::new(),
            service,
        })
    }

    pub fn bin_name(&self) -> &str {
        &self.bin_name
    }

    pub fn update_minimum_milliseconds_per_byte(&self, minimum: f64) {
        let mut state = wait::lock(&self.state);
        if state.minimum_milliseconds_per_byte != minimum {
            tracing::debug!(
                bin = %self.bin_name,
                from = state.minimum_milliseconds_per_byte,
                to = minimum,
                "byte rate changed"
            );
            state.minimum_milliseconds_per_byte = minimum;
            state.local_minimum = Some(minimum);
        }
        self.changed.notify_all();
    }

    /// Join (or start) the current series.
    pub fn begin_fetch(&self) {
        let mut state = wait::lock(&self.state);
        if state.ref_count == 0 {
            state.estimate_valid = false;
            state.rate_estimate = 0.0;
            state.total_bytes_read = 0;
            state.estimate_in_progress = false;
            state.series_start_time = -1;
        }
        state.ref_count += 1;
    }

    /// Leave the series without having read.
    pub fn abort_fetch(&self) {
        let mut state = wait::lock(&self.state);
        if state.ref_count == 0 {
            panic!("throttle bin {}: aborting a fetch that never began", self.bin_name);
        }
        state.ref_count -= 1;
    }

    /// Wait until `byte_count` more bytes may be read. Returns false if the
    /// bin is shut down.
    pub fn begin_read(&self, byte_count: u64, break_check: Option<&dyn BreakCheck>) -> Result<bool> {
        let byte_count = i64::try_from(byte_count).unwrap_or(i64::MAX);
        let mut state = wait::lock(&self.state);
        loop {
            if !state.alive {
                return Ok(false);
            }
            if state.estimate_in_progress {
                state = wait::wait(&self.changed, state, None, break_check)?;
                continue;
            }

            let now = wait::now_millis();
            if !state.estimate_valid {
                state.series_start_time = now;
                state.estimate_in_progress = true;
                state.total_bytes_read = state.total_bytes_read.saturating_add(byte_count);
                return Ok(true);
            }

            let Some(local_minimum) = state.local_minimum else {
                state = wait::wait(&self.changed, state, None, break_check)?;
                continue;
            };

            // Float-to-int casts saturate, so huge rates pin the target at
            // i64::MAX instead of wrapping.
            let estimated_time = (state.rate_estimate * byte_count as f64) as i64;
            let budget = (state.total_bytes_read.saturating_add(byte_count) as f64 * local_minimum) as i64;
            let desired_end_time = state.series_start_time.saturating_add(budget);
            let wait_time = desired_end_time
                .saturating_sub(estimated_time)
                .saturating_sub(now);
            if wait_time <= 0 {
                state.total_bytes_read = state.total_bytes_read.saturating_add(byte_count);
                return Ok(true);
            }
            state = wait::wait(&self.changed, state, Some(wait::millis(wait_time)), break_check)?;
        }
    }

    /// Abandon a read. If it was the estimating read, someone else may now
    /// become the estimator.
    pub fn abort_read(&self) {
        let mut state = wait::lock(&self.state);
        if state.estimate_in_progress {
            state.estimate_in_progress = false;
            self.changed.notify_all();
        }
    }

    /// Finish a read that was admitted for `original_count` bytes and actually
    /// moved `actual_count`.
    pub fn end_read(&self, original_count: u64, actual_count: u64) {
        let original = i64::try_from(original_count).unwrap_or(i64::MAX);
        let actual = i64::try_from(actual_count).unwrap_or(i64::MAX);
        let mut state = wait::lock(&self.state);
        state.total_bytes_read = state.total_bytes_read.saturating_add(actual).saturating_sub(original);
        if state.estimate_in_progress {
            state.rate_estimate = if actual == 0 {
                0.0
            } else {
                (wait::now_millis() - state.series_start_time) as f64 / actual as f64
            };
            state.estimate_valid = true;
            state.estimate_in_progress = false;
            tracing::trace!(
                bin = %self.bin_name,
                ms_per_byte = state.rate_estimate,
                "read rate estimated"
            );
            self.changed.notify_all();
        }
    }

    /// Leave the series. True when this was the last fetch in it.
    pub fn end_fetch(&self) -> bool {
        let mut state = wait::lock(&self.state);
        if state.ref_count == 0 {
            panic!("throttle bin {}: ending a fetch that never began", self.bin_name);
        }
        state.ref_count -= 1;
        state.ref_count == 0
    }

    /// Publish our byte rate; with peers present, take our share of it.
    pub fn poll(&self) -> Result<()> {
        let minimum = {
            let state = wait::lock(&self.state);
            if !state.alive {
                return Ok(());
            }
            state.minimum_milliseconds_per_byte
        };
        let view = self.service.peers()?;
        let share = rate_share(minimum, &view, |r| match r {
            ServiceReport::ByteRate { bytes_per_ms } => Some(*bytes_per_ms),
            _ => None,
        });
        self.service.publish(ServiceReport::ByteRate { bytes_per_ms: share })?;

        if view.is_alone() {
            return Ok(());
        }
        let target = interval_from_share(share);
        let mut state = wait::lock(&self.state);
        if state.minimum_milliseconds_per_byte != minimum {
            return Ok(());
        }
        if state.local_minimum != target {
            tracing::debug!(bin = %self.bin_name, local_minimum = ?target, "byte rate apportioned");
            state.local_minimum = target;
            self.changed.notify_all();
        }
        Ok(())
    }

    pub fn shut_down(&self) {
        {
            let mut state = wait::lock(&self.state);
            state.alive = false;
            self.changed.notify_all();
        }
        if let Err(e) = self.service.end() {
            tracing::warn!(bin = %self.bin_name, error = %e, "could not end throttle bin service");
        }
    }

    pub fn ref_count(&self) -> u32 {
        wait::lock(&self.state).ref_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::break_check::Deadline;
    use crate::error::ThrottleError;
    use crate::registry::LocalServiceRegistry;
    use std::thread;
    use std::time::{Duration, Instant};

    fn bin(ms_per_byte: f64) -> ThrottleBin {
        ThrottleBin::new(Arc::new(LocalServiceRegistry::new()), "g", "host-a", ms_per_byte).unwrap()
    }

    #[test]
    fn second_read_waits_for_desired_end_minus_estimate() {
        // 1 ms/byte; the first 100-byte read takes ~50ms, so the second
        // 100-byte read may start no earlier than 200 - 50 ms into the series.
        let b = bin(1.0);
        b.begin_fetch();
        let t0 = Instant::now();
        assert!(b.begin_read(100, None).unwrap());
        thread::sleep(Duration::from_millis(50));
        let first_took = t0.elapsed();
        b.end_read(100, 100);

        assert!(b.begin_read(100, None).unwrap());
        let started = t0.elapsed();
        assert!(
            started + first_took >= Duration::from_millis(190),
            "second read started at {started:?}, first took {first_took:?}"
        );
        b.end_read(100, 100);
        assert!(b.end_fetch());
    }

    #[test]
    fn back_to_back_reads_respect_rate() {
        let b = bin(0.2);
        b.begin_fetch();
        let start = Instant::now();
        for _ in 0..5 {
            assert!(b.begin_read(100, None).unwrap());
            b.end_read(100, 100);
        }
        // 500 bytes at 0.2 ms/byte.
        assert!(start.elapsed() >= Duration::from_millis(95), "{:?}", start.elapsed());
        assert!(b.end_fetch());
    }

    #[test]
    fn concurrent_reader_waits_for_estimating_read() {
        let b = Arc::new(bin(0.0));
        b.begin_fetch();
        b.begin_fetch();
        assert!(b.begin_read(10, None).unwrap());
        let other = {
            let b = Arc::clone(&b);
            thread::spawn(move || {
                let t = Instant::now();
                assert!(b.begin_read(10, None).unwrap());
                t.elapsed()
            })
        };
        thread::sleep(Duration::from_millis(40));
        b.end_read(10, 10);
        assert!(other.join().unwrap() >= Duration::from_millis(30));
        assert!(!b.end_fetch());
        assert!(b.end_fetch());
    }

    #[test]
    fn aborted_estimating_read_hands_over() {
        let b = bin(0.0);
        b.begin_fetch();
        assert!(b.begin_read(10, None).unwrap());
        b.abort_read();
        // No estimate yet, so the next read becomes the estimator at once.
        assert!(b.begin_read(10, None).unwrap());
        b.end_read(10, 0);
        b.end_fetch();
    }

    #[test]
    fn new_series_resets_estimate() {
        let b = bin(1.0);
        b.begin_fetch();
        assert!(b.begin_read(1000, None).unwrap());
        b.end_read(1000, 1000);
        assert!(b.end_fetch());

        // Fresh series: first read is the estimator again and does not wait
        // out the previous series' 1000 ms budget.
        b.begin_fetch();
        let t = Instant::now();
        assert!(b.begin_read(1000, None).unwrap());
        assert!(t.elapsed() < Duration::from_millis(200));
        b.abort_read();
        b.abort_fetch();
        assert_eq!(b.ref_count(), 0);
    }

    #[test]
    fn shut_down_releases_readers() {
        let b = Arc::new(bin(10.0));
        b.begin_fetch();
        assert!(b.begin_read(10, None).unwrap());
        b.end_read(10, 10);
        let reader = {
            let b = Arc::clone(&b);
            thread::spawn(move || b.begin_read(10_000, None).unwrap())
        };
        thread::sleep(Duration::from_millis(30));
        let t = Instant::now();
        b.shut_down();
        assert!(!reader.join().unwrap());
        assert!(t.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn huge_rate_limit_waits_instead_of_overflowing() {
        let b = bin(1e18);
        b.begin_fetch();
        assert!(b.begin_read(100, None).unwrap());
        b.end_read(100, 100);

        let deadline = Deadline::after(Duration::from_millis(100));
        let t = Instant::now();
        let err = b.begin_read(100, Some(&deadline)).unwrap_err();
        assert!(matches!(err, ThrottleError::TimedOut), "{err:?}");
        assert!(t.elapsed() >= Duration::from_millis(90));
        assert!(b.end_fetch());
    }

    #[test]
    #[should_panic(expected = "never began")]
    fn ending_unstarted_fetch_fails_fast() {
        bin(0.0).end_fetch();
    }
}
