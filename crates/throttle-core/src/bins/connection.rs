//! Connection quota for one bin.
//!
//! A connection passes through two phases here: a slot is first *reserved*
//! (promised to a caller that still has other bins to clear), then committed
//! to *in use* once every bin of the connection has agreed. Pooled connections
//! are counted by the caller's pool counter, which this bin only touches while
//! holding its own lock.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use serde::Serialize;

use super::wait;
use crate::break_check::BreakCheck;
use crate::error::Result;
use crate::registry::{
    connection_target, service_type_name, ServiceRegistration, ServiceRegistry, ServiceReport,
};

const SERVICE_PREFIX: &str = "_CONNECTIONBIN_";

/// Where a granted connection should come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionSource {
    /// Reuse a connection from the caller's pool.
    FromPool,
    /// Open a new connection.
    FromCreation,
    /// The bin is shut down; no connection is available.
    FromNowhere,
}

/// Outcome of the speculative pooled-connection check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PooledDecision {
    /// A pooled connection was taken and should be destroyed.
    Destroy,
    /// Nothing pooled; nothing taken.
    PoolEmpty,
    /// A pooled connection was taken but the bin is within its quota.
    WithinBounds,
}

/// Point-in-time view of a connection bin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionBinStats {
    pub bin: String,
    pub alive: bool,
    pub max_active_connections: u32,
    pub local_max: u32,
    pub reserved: u32,
    pub in_use: u32,
    pub referencing_pools: u32,
}

#[derive(Debug)]
struct ConnectionState {
    alive: bool,
    max_active: u32,
    /// Share of `max_active` granted to this process.
    local_max: u32,
    reserved: u32,
    in_use: u32,
    /// Pool counters touching this bin that are currently non-zero.
    referencing_pools: u32,
}

#[derive(Debug)]
pub struct ConnectionBin {
    bin_name: String,
    state: Mutex<ConnectionState>,
    changed: Condvar,
    service: ServiceRegistration,
}

impl ConnectionBin {
    pub fn new(
        registry: Arc<dyn ServiceRegistry>,
        group_name: &str,
        bin_name: &str,
        max_active_connections: u32,
    ) -> Result<Self> {
        let service = ServiceRegistration::register(
            registry,
            service_type_name(SERVICE_PREFIX, group_name, bin_name),
        )?;
        Ok(Self {
            bin_name: bin_name.to_string(),
            state: Mutex::new(ConnectionState {
                alive: true,
                max_active: max_active_connections,
                local_max: max_active_connections,
                reserved: 0,
                in_use: 0,
                referencing_pools: 0,
            }),
            changed: Condvar::new(),
            service,
        })
    }

    pub fn bin_name(&self) -> &str {
        &self.bin_name
    }

    /// Set the quota. A changed quota also resets the local share until the
    /// next poll apportions it again. Waiters are woken since it may have grown.
    pub fn update_max_active_connections(&self, max_active_connections: u32) {
        let mut state = wait::lock(&self.state);
        if state.max_active != max_active_connections {
            tracing::debug!(
                bin = %self.bin_name,
                from = state.max_active,
                to = max_active_connections,
                "connection quota changed"
            );
            state.max_active = max_active_connections;
            state.local_max = max_active_connections;
        }
        self.changed.notify_all();
    }

    /// Block until a connection may be had from the pool or by creation.
    ///
    /// Pooled reuse wins whenever both are possible. A [`ConnectionSource::FromCreation`]
    /// grant holds a reservation that must be either committed with
    /// [`note_connection_creation`](Self::note_connection_creation) or given
    /// back with [`undo_reservation`](Self::undo_reservation).
    pub fn wait_connection_available(
        &self,
        pool_count: &AtomicUsize,
        break_check: Option<&dyn BreakCheck>,
    ) -> Result<ConnectionSource> {
        let mut state = wait::lock(&self.state);
        loop {
            if !state.alive {
                return Ok(ConnectionSource::FromNowhere);
            }
            if take_pooled(&mut state, pool_count) {
                return Ok(ConnectionSource::FromPool);
            }
            if state.in_use + state.reserved < state.local_max {
                state.reserved += 1;
                return Ok(ConnectionSource::FromCreation);
            }
            state = wait::wait(&self.changed, state, None, break_check)?;
        }
    }

    /// Give back what [`wait_connection_available`](Self::wait_connection_available) granted.
    pub fn undo_reservation(&self, source: ConnectionSource, pool_count: &AtomicUsize) {
        let mut state = wait::lock(&self.state);
        match source {
            ConnectionSource::FromCreation => {
                if state.reserved == 0 {
                    panic!(
                        "connection bin {}: undoing a reservation that was never made",
                        self.bin_name
                    );
                }
                state.reserved -= 1;
            }
            ConnectionSource::FromPool => put_pooled(&mut state, pool_count),
            ConnectionSource::FromNowhere => {}
        }
        self.changed.notify_all();
    }

    /// Commit a reservation: the connection now exists.
    pub fn note_connection_creation(&self) {
        let mut state = wait::lock(&self.state);
        if state.reserved == 0 {
            panic!(
                "connection bin {}: connection created with nothing reserved",
                self.bin_name
            );
        }
        state.reserved -= 1;
        state.in_use += 1;
    }

    /// True when the bin holds more connections than its quota, which happens
    /// after the quota was lowered. Reservations are not counted.
    pub fn should_returned_connection_be_destroyed(&self) -> bool {
        let state = wait::lock(&self.state);
        state.in_use > state.local_max
    }

    /// Speculatively take one connection out of the pool and decide whether it
    /// should be destroyed. Each referencing pool is judged against an even
    /// split of the local quota. Undo with
    /// [`undo_pooled_connection_decision`](Self::undo_pooled_connection_decision)
    /// if another bin vetoes.
    pub fn should_pooled_connection_be_destroyed(&self, pool_count: &AtomicUsize) -> PooledDecision {
        let mut state = wait::lock(&self.state);
        let referencing = state.referencing_pools.max(1);
        if !take_pooled(&mut state, pool_count) {
            return PooledDecision::PoolEmpty;
        }
        let individual_allocation = state.local_max / referencing;
        if state.in_use > individual_allocation {
            PooledDecision::Destroy
        } else {
            PooledDecision::WithinBounds
        }
    }

    /// Take one connection out of the pool if there is one.
    pub fn has_pooled_connection(&self, pool_count: &AtomicUsize) -> bool {
        let mut state = wait::lock(&self.state);
        take_pooled(&mut state, pool_count)
    }

    /// Put back a connection taken by a pooled-connection check.
    pub fn undo_pooled_connection_decision(&self, pool_count: &AtomicUsize) {
        let mut state = wait::lock(&self.state);
        put_pooled(&mut state, pool_count);
        self.changed.notify_all();
    }

    pub fn note_connection_returned_to_pool(&self, pool_count: &AtomicUsize) {
        let mut state = wait::lock(&self.state);
        put_pooled(&mut state, pool_count);
        self.changed.notify_all();
    }

    pub fn note_connection_destroyed(&self) {
        let mut state = wait::lock(&self.state);
        if state.in_use == 0 {
            panic!(
                "connection bin {}: connection destroyed with none in use",
                self.bin_name
            );
        }
        state.in_use -= 1;
        self.changed.notify_all();
    }

    /// Publish our share and, when other processes share this bin, recompute
    /// the local quota from their reports.
    pub fn poll(&self) -> Result<()> {
        let (max, local_max, in_use) = {
            let state = wait::lock(&self.state);
            if !state.alive {
                return Ok(());
            }
            (state.max_active, state.local_max, state.in_use)
        };
        let view = self.service.peers()?;
        let target = connection_target(max, local_max, in_use, &view);
        self.service.publish(ServiceReport::Connections { target, in_use })?;

        let mut state = wait::lock(&self.state);
        if state.max_active != max {
            // The quota changed while we were away; the next poll starts from it.
            return Ok(());
        }
        if state.local_max != target {
            tracing::debug!(
                bin = %self.bin_name,
                from = state.local_max,
                to = target,
                peers = view.num_services.saturating_sub(1),
                "local connection quota apportioned"
            );
            state.local_max = target;
            self.changed.notify_all();
        }
        Ok(())
    }

    /// Mark the bin dead. Every pending and future wait returns
    /// [`ConnectionSource::FromNowhere`].
    pub fn shut_down(&self) {
        {
            let mut state = wait::lock(&self.state);
            state.alive = false;
            self.changed.notify_all();
        }
        if let Err(e) = self.service.end() {
            tracing::warn!(bin = %self.bin_name, error = %e, "could not end connection bin service");
        }
    }

    pub fn stats(&self) -> ConnectionBinStats {
        let state = wait::lock(&self.state);
        ConnectionBinStats {
            bin: self.bin_name.clone(),
            alive: state.alive,
            max_active_connections: state.max_active,
            local_max: state.local_max,
            reserved: state.reserved,
            in_use: state.in_use,
            referencing_pools: state.referencing_pools,
        }
    }
}

/// Decrement the pool counter if positive. Caller holds the bin lock.
fn take_pooled(state: &mut ConnectionState, pool_count: &AtomicUsize) -> bool {
    match pool_count.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1)) {
        Ok(previous) => {
            if previous == 1 {
                state.referencing_pools = state.referencing_pools.saturating_sub(1);
            }
            true
        }
        Err(_) => false,
    }
}

/// Increment the pool counter. Caller holds the bin lock.
fn put_pooled(state: &mut ConnectionState, pool_count: &AtomicUsize) {
    if pool_count.fetch_add(1, Ordering::AcqRel) == 0 {
        state.referencing_pools += 1;
    }
}
