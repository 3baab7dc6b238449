//! Minimum spacing between fetches for one bin.
//!
//! Scheduling is serialized through a single reservation slot: a caller takes
//! the slot, waits out the interval since the last fetch, and gives the slot
//! up when the fetch begins (or is abandoned). The fetches themselves may then
//! overlap freely.

use std::sync::{Arc, Condvar, Mutex};

use super::wait;
use crate::break_check::BreakCheck;
use crate::error::Result;
use crate::registry::{
    interval_from_share, rate_share, service_type_name, ServiceRegistration, ServiceRegistry,
    ServiceReport,
};

const SERVICE_PREFIX: &str = "_FETCHBIN_";

#[derive(Debug)]
struct FetchState {
    alive: bool,
    min_time_between_fetches: u64,
    /// Interval granted to this process; `None` until a share is available.
    local_minimum: Option<u64>,
    /// Epoch milliseconds; zero before the first fetch.
    last_fetch_time: i64,
    reserve_next_fetch: bool,
}

#[derive(Debug)]
pub struct FetchBin {
    bin_name: String,
    state: Mutex<FetchState>,
    changed: Condvar,
    service: ServiceRegistration,
}

impl FetchBin {
    pub fn new(
        registry: Arc<dyn ServiceRegistry>,
        group_name: &str,
        bin_name: &str,
        min_time_between_fetches: u64,
    ) -> Result<Self> {
        let service = ServiceRegistration::register(
            registry,
            service_type_name(SERVICE_PREFIX, group_name, bin_name),
        )?;
        Ok(Self {
            bin_name: bin_name.to_string(),
            state: Mutex::new(FetchState {
                alive: true,
                min_time_between_fetches,
                local_minimum: Some(min_time_between_fetches),
                last_fetch_time: 0,
                reserve_next_fetch: false,
            }),
            changed: Condvar::new(),
            service,
        })
    }

    pub fn bin_name(&self) -> &str {
        &self.bin_name
    }

    pub fn update_min_time_between_fetches(&self, min_time_between_fetches: u64) {
        let mut state = wait::lock(&self.state);
        if state.min_time_between_fetches != min_time_between_fetches {
            tracing::debug!(
                bin = %self.bin_name,
                from = state.min_time_between_fetches,
                to = min_time_between_fetches,
                "fetch interval changed"
            );
            state.min_time_between_fetches = min_time_between_fetches;
            state.local_minimum = Some(min_time_between_fetches);
        }
        self.changed.notify_all();
    }

    /// Take the scheduling slot, waiting while someone else holds it.
    /// Returns false if the bin is shut down.
    pub fn reserve_fetch_request(&self, break_check: Option<&dyn BreakCheck>) -> Result<bool> {
        let mut state = wait::lock(&self.state);
        loop {
            if !state.alive {
                return Ok(false);
            }
            if !state.reserve_next_fetch {
                state.reserve_next_fetch = true;
                return Ok(true);
            }
            state = wait::wait(&self.changed, state, None, break_check)?;
        }
    }

    /// Give up the slot without fetching.
    pub fn clear_reservation(&self) {
        let mut state = wait::lock(&self.state);
        if !state.reserve_next_fetch {
            panic!(
                "fetch bin {}: clearing a fetch reservation we don't have",
                self.bin_name
            );
        }
        state.reserve_next_fetch = false;
        self.changed.notify_all();
    }

    /// With the slot held, wait until the interval since the last fetch has
    /// passed. Returns false if the bin is shut down meanwhile; the slot is
    /// then still held and the caller clears it.
    pub fn wait_next_fetch(&self, break_check: Option<&dyn BreakCheck>) -> Result<bool> {
        let mut state = wait::lock(&self.state);
        if !state.reserve_next_fetch {
            panic!("fetch bin {}: no fetch request reserved", self.bin_name);
        }
        loop {
            if !state.alive {
                return Ok(false);
            }
            let limit = match state.local_minimum {
                None => None,
                Some(interval) => {
                    let ready_at = state.last_fetch_time.saturating_add(clamp_interval(interval));
                    let remaining = ready_at.saturating_sub(wait::now_millis());
                    if remaining <= 0 {
                        return Ok(true);
                    }
                    Some(wait::millis(remaining))
                }
            };
            state = wait::wait(&self.changed, state, limit, break_check)?;
        }
    }

    /// Record that a fetch started at `current_time` and free the slot.
    pub fn begin_fetch(&self, current_time: i64) {
        let mut state = wait::lock(&self.state);
        if current_time > state.last_fetch_time {
            state.last_fetch_time = current_time;
        }
        state.reserve_next_fetch = false;
        self.changed.notify_all();
    }

    /// Publish our fetch rate and earliest next fetch; with peers present,
    /// take our share of the rate and line our last fetch time up with the
    /// earliest peer.
    pub fn poll(&self) -> Result<()> {
        let (min_interval, last_fetch_time) = {
            let state = wait::lock(&self.state);
            if !state.alive {
                return Ok(());
            }
            (state.min_time_between_fetches, state.last_fetch_time)
        };
        let view = self.service.peers()?;

        let mut earliest = view
            .peers
            .iter()
            .filter_map(|r| match r {
                ServiceReport::FetchRate { next_fetch_time, .. } => Some(*next_fetch_time),
                _ => None,
            })
            .min()
            .unwrap_or(i64::MAX);
        if last_fetch_time == 0 {
            earliest = wait::now_millis();
        } else if earliest > last_fetch_time {
            earliest = last_fetch_time;
        }

        let share = rate_share(min_interval as f64, &view, |r| match r {
            ServiceReport::FetchRate { fetches_per_ms, .. } => Some(*fetches_per_ms),
            _ => None,
        });
        let target = if view.is_alone() {
            Some(min_interval)
        } else {
            interval_from_share(share).map(|ms| (ms + 0.5) as u64)
        };
        let next_fetch_time = earliest.saturating_add(target.map_or(i64::MAX, clamp_interval));
        self.service.publish(ServiceReport::FetchRate {
            fetches_per_ms: share,
            next_fetch_time,
        })?;

        if view.is_alone() {
            return Ok(());
        }
        let mut state = wait::lock(&self.state);
        if state.min_time_between_fetches != min_interval {
            return Ok(());
        }
        if state.local_minimum == target && state.last_fetch_time == earliest {
            return Ok(());
        }
        tracing::debug!(
            bin = %self.bin_name,
            local_minimum = ?target,
            last_fetch_time = earliest,
            "fetch interval apportioned"
        );
        state.local_minimum = target;
        state.last_fetch_time = earliest;
        self.changed.notify_all();
        Ok(())
    }

    pub fn shut_down(&self) {
        {
            let mut state = wait::lock(&self.state);
            state.alive = false;
            self.changed.notify_all();
        }
        if let Err(e) = self.service.end() {
            tracing::warn!(bin = %self.bin_name, error = %e, "could not end fetch bin service");
        }
    }

    pub fn last_fetch_time(&self) -> i64 {
        wait::lock(&self.state).last_fetch_time
    }
}

/// Intervals are unsigned but fetch times are signed epoch milliseconds.
fn clamp_interval(interval: u64) -> i64 {
    i64::try_from(interval).unwrap_or(i64::MAX)
}
