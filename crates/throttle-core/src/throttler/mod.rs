//! Process-wide throttler: `group type -> group -> pool`.
//!
//! A [`Throttler`] is an explicit object shared by `Arc`. Connectors address
//! bins by group and name on every call; the throttler resolves the pool and
//! its bins and runs the ordered multi-bin protocols against them.
//!
//! The groups map is locked only to find, create or remove a pool. All
//! waiting happens inside bins, outside that lock.

mod group;
mod handles;

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::bin_set::BinSet;
use crate::bins::wait::lock;
use crate::bins::ConnectionSource;
use crate::break_check::BreakCheck;
use crate::error::Result;
use crate::registry::{LocalServiceRegistry, ServiceRegistry};
use crate::throttle_spec::{FixedThrottleSpec, ThrottleSpec};

use group::ThrottlingGroup;
pub use group::{GroupStats, PoolState};
pub use handles::{ConnectionPermit, FetchThrottler, PoolCounts, PoolThrottler, StreamThrottler};

/// What became of a connection handed back with
/// [`Throttler::release_connection_permission`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReturnedConnection {
    /// Counted as pooled; the caller keeps it for reuse.
    Pooled,
    /// Counted as destroyed; the caller closes it.
    Destroyed,
}

type GroupMap = HashMap<String, HashMap<String, Arc<ThrottlingGroup>>>;

pub struct Throttler {
    registry: Arc<dyn ServiceRegistry>,
    groups: Mutex<GroupMap>,
    destroyed: AtomicBool,
}

impl Default for Throttler {
    fn default() -> Self {
        Self::new()
    }
}

impl Throttler {
    /// Throttler coordinating only with itself.
    pub fn new() -> Self {
        Self::with_registry(Arc::new(LocalServiceRegistry::new()))
    }

    /// Throttler that apportions quotas with every other service in `registry`.
    pub fn with_registry(registry: Arc<dyn ServiceRegistry>) -> Self {
        Self {
            registry,
            groups: Mutex::new(HashMap::new()),
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn registry(&self) -> &Arc<dyn ServiceRegistry> {
        &self.registry
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Names of the groups of a type.
    pub fn get_throttle_groups(&self, group_type: &str) -> BTreeSet<String> {
        lock(&self.groups)
            .get(group_type)
            .map(|groups| groups.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Remove a group and shut down all of its bins.
    pub fn remove_throttle_group(&self, group_type: &str, group: &str) {
        let removed = {
            let mut groups = lock(&self.groups);
            let removed = groups.get_mut(group_type).and_then(|g| g.remove(group));
            if groups.get(group_type).is_some_and(HashMap::is_empty) {
                groups.remove(group_type);
            }
            removed
        };
        if let Some(g) = removed {
            g.destroy();
        }
    }

    /// Install or replace a group's spec. The group is created on first use.
    pub fn update_throttle_specification(
        &self,
        group_type: &str,
        group: &str,
        spec: Arc<dyn ThrottleSpec>,
    ) -> Result<()> {
        if self.is_destroyed() {
            tracing::warn!(%group_type, %group, "throttler destroyed, ignoring spec update");
            return Ok(());
        }
        let mut groups = lock(&self.groups);
        let of_type = groups.entry(group_type.to_string()).or_default();
        match of_type.get(group) {
            Some(existing) => existing.update_throttle_specification(spec),
            None => {
                let created = ThrottlingGroup::new(Arc::clone(&self.registry), group_type, group, spec)?;
                tracing::info!(%group_type, %group, "created throttle group");
                of_type.insert(group.to_string(), Arc::new(created));
            }
        }
        Ok(())
    }

    fn group(&self, group_type: &str, group: &str) -> Option<Arc<ThrottlingGroup>> {
        lock(&self.groups)
            .get(group_type)
            .and_then(|g| g.get(group))
            .cloned()
    }

    /// Find the group, creating it without limits if nobody configured it.
    /// `None` once the throttler is destroyed.
    fn group_or_create(&self, group_type: &str, group: &str) -> Result<Option<Arc<ThrottlingGroup>>> {
        if self.is_destroyed() {
            return Ok(None);
        }
        if let Some(g) = self.group(group_type, group) {
            return Ok(Some(g));
        }
        let mut groups = lock(&self.groups);
        let of_type = groups.entry(group_type.to_string()).or_default();
        if let Some(g) = of_type.get(group) {
            return Ok(Some(Arc::clone(g)));
        }
        let created = Arc::new(ThrottlingGroup::new(
            Arc::clone(&self.registry),
            group_type,
            group,
            Arc::new(FixedThrottleSpec::unlimited()),
        )?);
        tracing::info!(%group_type, %group, "created unconfigured throttle group without limits");
        of_type.insert(group.to_string(), Arc::clone(&created));
        Ok(Some(created))
    }

    /// Handle for one caller-managed connection pool over `bins`. `None` once
    /// the throttler or group is shut down.
    pub fn obtain_connection_throttler<I, S>(
        &self,
        group_type: &str,
        group: &str,
        bins: I,
    ) -> Result<Option<PoolThrottler>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let bins = BinSet::new(bins);
        let Some(g) = self.group_or_create(group_type, group)? else {
            return Ok(None);
        };
        if !g.ensure_bins(&bins)? {
            return Ok(None);
        }
        let counts = Arc::new(PoolCounts::new(bins));
        Ok(Some(PoolThrottler::new(g, counts)))
    }

    /// Ordered multi-bin connection reservation.
    ///
    /// Blocks until every bin grants. `None` if the throttler or group is
    /// shut down. A break-check error is returned after all partial
    /// reservations have been rolled back.
    pub fn obtain_connection_permission<I, S>(
        &self,
        group_type: &str,
        group: &str,
        bins: I,
        break_check: Option<&dyn BreakCheck>,
    ) -> Result<Option<ConnectionPermit>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let bins = BinSet::new(bins);
        let Some(g) = self.group_or_create(group_type, group)? else {
            return Ok(None);
        };
        if !g.ensure_bins(&bins)? {
            return Ok(None);
        }
        let counts = g.pool_counts_for(&bins);
        let source = g.wait_connection_available(&counts, break_check)?;
        if source == ConnectionSource::FromNowhere {
            return Ok(None);
        }
        tracing::trace!(%group_type, %group, %bins, ?source, "connection permission granted");
        Ok(Some(ConnectionPermit::new(
            source,
            FetchThrottler::new(g, bins),
        )))
    }

    /// Hand a connection back. It is destroyed if any bin is over quota,
    /// pooled otherwise. A set with a bin that was never created (or has been
    /// shut down) could not have been granted, so nothing is counted and the
    /// connection is reported destroyed.
    pub fn release_connection_permission<I, S>(&self, group_type: &str, group: &str, bins: I) -> ReturnedConnection
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let bins = BinSet::new(bins);
        let Some(g) = self.group(group_type, group) else {
            return ReturnedConnection::Destroyed;
        };
        if !g.has_connection_bins(&bins) {
            return ReturnedConnection::Destroyed;
        }
        if g.note_returned_connection(&bins) {
            g.note_connection_destroyed(&bins);
            ReturnedConnection::Destroyed
        } else {
            let counts = g.pool_counts_for(&bins);
            g.note_connection_returned_to_pool(&counts);
            ReturnedConnection::Pooled
        }
    }

    /// How many of `bins` hold more connections than their quota.
    pub fn over_connection_quota_count<I, S>(&self, group_type: &str, group: &str, bins: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let bins = BinSet::new(bins);
        self.group(group_type, group)
            .map_or(0, |g| g.over_quota_count(&bins))
    }

    /// Destroy one pooled connection of this bin set, if every bin has one.
    pub fn expire_pooled_connection<I, S>(&self, group_type: &str, group: &str, bins: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let bins = BinSet::new(bins);
        let Some(g) = self.group(group_type, group) else {
            return false;
        };
        let counts = g.pool_counts_for(&bins);
        if !g.check_expire_connection(&counts) {
            return false;
        }
        g.note_connection_destroyed(&bins);
        true
    }

    /// Refresh and apportion every bin of every group of a type.
    pub fn poll(&self, group_type: &str) -> Result<()> {
        let groups: Vec<_> = lock(&self.groups)
            .get(group_type)
            .map(|g| g.values().cloned().collect())
            .unwrap_or_default();
        poll_groups(&groups)
    }

    pub fn poll_all(&self) -> Result<()> {
        let groups: Vec<_> = lock(&self.groups)
            .values()
            .flat_map(|g| g.values().cloned())
            .collect();
        poll_groups(&groups)
    }

    /// Drop idle bookkeeping. Returns how many entries were released.
    pub fn free_unused_resources(&self) -> usize {
        let groups: Vec<_> = lock(&self.groups)
            .values()
            .flat_map(|g| g.values().cloned())
            .collect();
        let freed: usize = groups.iter().map(|g| g.free_unused_resources()).sum();
        if freed > 0 {
            tracing::debug!(freed, "freed unused pool counters");
        }
        freed
    }

    /// Destroy every group. All pending and future waits return unavailable.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        let groups: Vec<_> = lock(&self.groups)
            .drain()
            .flat_map(|(_, g)| g.into_values())
            .collect();
        tracing::info!(groups = groups.len(), "destroying throttler");
        for g in groups {
            g.destroy();
        }
    }

    pub fn group_stats(&self, group_type: &str, group: &str) -> Option<GroupStats> {
        self.group(group_type, group).map(|g| g.stats())
    }
}

impl Drop for Throttler {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl std::fmt::Debug for Throttler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let groups: usize = lock(&self.groups).values().map(HashMap::len).sum();
        f.debug_struct("Throttler")
            .field("groups", &groups)
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

fn poll_groups(groups: &[Arc<ThrottlingGroup>]) -> Result<()> {
    let mut first_error = None;
    for g in groups {
        if let Err(e) = g.poll() {
            tracing::warn!(group = %g.group(), error = %e, "throttle group poll failed");
            first_error.get_or_insert(e);
        }
    }
    first_error.map_or(Ok(()), Err)
}
