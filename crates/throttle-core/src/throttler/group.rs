//! One throttle group: its bins, its spec and the multi-bin protocols.
//!
//! Bin maps are locked only to look up or create bins, never while waiting
//! on a bin. Every protocol that touches several bins walks them in
//! [`BinSet`] order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde::Serialize;

use super::handles::PoolCounts;
use crate::bin_set::BinSet;
use crate::bins::wait::{lock, now_millis};
use crate::bins::{ConnectionBin, ConnectionBinStats, ConnectionSource, FetchBin, PooledDecision, ThrottleBin};
use crate::break_check::BreakCheck;
use crate::error::Result;
use crate::registry::{service_type_name, ServiceRegistration, ServiceRegistry};
use crate::throttle_spec::ThrottleSpec;

const SERVICE_PREFIX: &str = "_THROTTLEGROUP_";

/// Lifecycle of a throttle group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolState {
    Active,
    Destroyed,
}

/// Snapshot of a throttle group for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct GroupStats {
    pub group_type: String,
    pub group: String,
    pub state: PoolState,
    pub connection_bins: Vec<ConnectionBinStats>,
    pub fetch_bins: usize,
    pub throttle_bins: usize,
    pub cached_pools: usize,
}

pub(crate) struct ThrottlingGroup {
    group_type: String,
    group: String,
    /// `<type>_<group>`, the name bins register under.
    qualified_name: String,
    registry: Arc<dyn ServiceRegistry>,
    spec: RwLock<Arc<dyn ThrottleSpec>>,
    destroyed: AtomicBool,
    connection_bins: Mutex<HashMap<String, Arc<ConnectionBin>>>,
    fetch_bins: Mutex<HashMap<String, Arc<FetchBin>>>,
    throttle_bins: Mutex<HashMap<String, Arc<ThrottleBin>>>,
    /// Pool counters used by the permission-level API, one per bin set.
    pool_counts: Mutex<HashMap<BinSet, Arc<PoolCounts>>>,
    service: ServiceRegistration,
}

impl ThrottlingGroup {
    pub(crate) fn new(
        registry: Arc<dyn ServiceRegistry>,
        group_type: &str,
        group: &str,
        spec: Arc<dyn ThrottleSpec>,
    ) -> Result<Self> {
        let service = ServiceRegistration::register(
            Arc::clone(&registry),
            service_type_name(SERVICE_PREFIX, group_type, group),
        )?;
        Ok(Self {
            group_type: group_type.to_string(),
            group: group.to_string(),
            qualified_name: format!("{group_type}_{group}"),
            registry,
            spec: RwLock::new(spec),
            destroyed: AtomicBool::new(false),
            connection_bins: Mutex::new(HashMap::new()),
            fetch_bins: Mutex::new(HashMap::new()),
            throttle_bins: Mutex::new(HashMap::new()),
            pool_counts: Mutex::new(HashMap::new()),
            service,
        })
    }

    pub(crate) fn group(&self) -> &str {
        &self.group
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    fn spec(&self) -> Arc<dyn ThrottleSpec> {
        Arc::clone(&self.spec.read().unwrap_or_else(std::sync::PoisonError::into_inner))
    }

    /// Swap the spec. Existing bins pick the new limits up at once.
    pub(crate) fn update_throttle_specification(&self, spec: Arc<dyn ThrottleSpec>) {
        *self.spec.write().unwrap_or_else(std::sync::PoisonError::into_inner) = Arc::clone(&spec);
        for bin in lock(&self.connection_bins).values() {
            bin.update_max_active_connections(spec.max_open_connections(bin.bin_name()));
        }
        for bin in lock(&self.fetch_bins).values() {
            bin.update_min_time_between_fetches(spec.minimum_milliseconds_per_fetch(bin.bin_name()));
        }
        for bin in lock(&self.throttle_bins).values() {
            bin.update_minimum_milliseconds_per_byte(spec.minimum_milliseconds_per_byte(bin.bin_name()));
        }
    }

    /// Create whichever bins of the set do not exist yet. Returns false once
    /// the group is destroyed.
    pub(crate) fn ensure_bins(&self, bins: &BinSet) -> Result<bool> {
        if self.is_destroyed() {
            return Ok(false);
        }
        let spec = self.spec();
        {
            let mut map = lock(&self.connection_bins);
            for name in bins {
                if !map.contains_key(name) {
                    let bin = ConnectionBin::new(
                        Arc::clone(&self.registry),
                        &self.qualified_name,
                        name,
                        spec.max_open_connections(name),
                    )?;
                    map.insert(name.clone(), Arc::new(bin));
                }
            }
        }
        {
            let mut map = lock(&self.fetch_bins);
            for name in bins {
                if !map.contains_key(name) {
                    let bin = FetchBin::new(
                        Arc::clone(&self.registry),
                        &self.qualified_name,
                        name,
                        spec.minimum_milliseconds_per_fetch(name),
                    )?;
                    map.insert(name.clone(), Arc::new(bin));
                }
            }
        }
        {
            let mut map = lock(&self.throttle_bins);
            for name in bins {
                if !map.contains_key(name) {
                    let bin = ThrottleBin::new(
                        Arc::clone(&self.registry),
                        &self.qualified_name,
                        name,
                        spec.minimum_milliseconds_per_byte(name),
                    )?;
                    map.insert(name.clone(), Arc::new(bin));
                }
            }
        }
        // A destroy racing with creation may have missed the new bins.
        if self.is_destroyed() {
            self.shut_down_bins();
            return Ok(false);
        }
        Ok(true)
    }

    fn connection_bin(&self, name: &str) -> Option<Arc<ConnectionBin>> {
        lock(&self.connection_bins).get(name).cloned()
    }

    fn fetch_bin(&self, name: &str) -> Option<Arc<FetchBin>> {
        lock(&self.fetch_bins).get(name).cloned()
    }

    fn throttle_bin(&self, name: &str) -> Option<Arc<ThrottleBin>> {
        lock(&self.throttle_bins).get(name).cloned()
    }

    /// Whether every bin of the set has a connection bin.
    pub(crate) fn has_connection_bins(&self, bins: &BinSet) -> bool {
        let map = lock(&self.connection_bins);
        bins.iter().all(|name| map.contains_key(name))
    }

    /// Shared pool counters for a bin set, created on first use.
    pub(crate) fn pool_counts_for(&self, bins: &BinSet) -> Arc<PoolCounts> {
        Arc::clone(
            lock(&self.pool_counts)
                .entry(bins.clone())
                .or_insert_with(|| Arc::new(PoolCounts::new(bins.clone()))),
        )
    }

    // Connection protocols.

    /// Reserve a connection in every bin of the set, in order.
    ///
    /// A bin that is gone or shut down makes the whole acquisition
    /// unavailable; earlier bins are rolled back. When bins disagree between
    /// pool and creation, two callers are racing for the same pooled
    /// connection: everything is rolled back and the acquisition restarts.
    pub(crate) fn wait_connection_available(
        &self,
        counts: &PoolCounts,
        break_check: Option<&dyn BreakCheck>,
    ) -> Result<ConnectionSource> {
        'retry: loop {
            let mut decided: Option<ConnectionSource> = None;
            let mut taken: Vec<(Arc<ConnectionBin>, usize)> = Vec::with_capacity(counts.len());

            for (index, name) in counts.bins().iter().enumerate() {
                let pool_count = counts.get(index);
                let Some(bin) = self.connection_bin(name) else {
                    undo_reservations(&taken, decided, counts);
                    return Ok(ConnectionSource::FromNowhere);
                };
                let source = match bin.wait_connection_available(pool_count, break_check) {
                    Ok(source) => source,
                    Err(e) => {
                        undo_reservations(&taken, decided, counts);
                        return Err(e);
                    }
                };
                if source == ConnectionSource::FromNowhere {
                    undo_reservations(&taken, decided, counts);
                    return Ok(source);
                }
                match decided {
                    Some(previous) if previous != source => {
                        bin.undo_reservation(source, pool_count);
                        undo_reservations(&taken, decided, counts);
                        tracing::trace!(
                            group = %self.group,
                            bins = %counts.bins(),
                            "mixed pool/creation decision, retrying"
                        );
                        std::thread::yield_now();
                        continue 'retry;
                    }
                    _ => decided = Some(source),
                }
                taken.push((bin, index));
            }

            let source = decided.unwrap_or(ConnectionSource::FromNowhere);
            if source == ConnectionSource::FromCreation {
                for (bin, _) in &taken {
                    bin.note_connection_creation();
                }
            }
            return Ok(source);
        }
    }

    /// True if any bin wants a connection being handed back destroyed.
    pub(crate) fn note_returned_connection(&self, bins: &BinSet) -> bool {
        bins.iter()
            .filter_map(|name| self.connection_bin(name))
            .fold(false, |destroy, bin| {
                bin.should_returned_connection_be_destroyed() || destroy
            })
    }

    /// Number of bins in the set currently holding more connections than
    /// their quota.
    pub(crate) fn over_quota_count(&self, bins: &BinSet) -> usize {
        bins.iter()
            .filter_map(|name| self.connection_bin(name))
            .filter(|bin| bin.should_returned_connection_be_destroyed())
            .count()
    }

    /// Decide whether one pooled connection of this set should be destroyed.
    /// On true the connection has been taken out of the pool counters and the
    /// caller destroys it (and reports that with `note_connection_destroyed`).
    pub(crate) fn check_destroy_pooled_connection(&self, counts: &PoolCounts) -> bool {
        let mut taken: Vec<(Arc<ConnectionBin>, usize)> = Vec::with_capacity(counts.len());
        let mut destroy = false;
        for (index, name) in counts.bins().iter().enumerate() {
            let Some(bin) = self.connection_bin(name) else {
                continue;
            };
            match bin.should_pooled_connection_be_destroyed(counts.get(index)) {
                PooledDecision::PoolEmpty => {
                    undo_pooled(&taken, counts);
                    return false;
                }
                PooledDecision::Destroy => destroy = true,
                PooledDecision::WithinBounds => {}
            }
            taken.push((bin, index));
        }
        if !destroy {
            undo_pooled(&taken, counts);
        }
        destroy
    }

    /// Take one pooled connection out of every bin of the set, or nothing if
    /// any bin's pool is empty.
    pub(crate) fn check_expire_connection(&self, counts: &PoolCounts) -> bool {
        let mut taken: Vec<(Arc<ConnectionBin>, usize)> = Vec::with_capacity(counts.len());
        for (index, name) in counts.bins().iter().enumerate() {
            let Some(bin) = self.connection_bin(name) else {
                continue;
            };
            if !bin.has_pooled_connection(counts.get(index)) {
                undo_pooled(&taken, counts);
                return false;
            }
            taken.push((bin, index));
        }
        true
    }

    pub(crate) fn note_connection_returned_to_pool(&self, counts: &PoolCounts) {
        for (index, name) in counts.bins().iter().enumerate() {
            if let Some(bin) = self.connection_bin(name) {
                bin.note_connection_returned_to_pool(counts.get(index));
            }
        }
    }

    pub(crate) fn note_connection_destroyed(&self, bins: &BinSet) {
        for name in bins {
            if let Some(bin) = self.connection_bin(name) {
                bin.note_connection_destroyed();
            }
        }
    }

    // Fetch protocols.

    /// Reserve the scheduling slot of every fetch bin, then wait out and begin
    /// the fetch on each. On any refusal, every slot still held is cleared.
    pub(crate) fn obtain_fetch_document_permission(
        &self,
        bins: &BinSet,
        break_check: Option<&dyn BreakCheck>,
    ) -> Result<bool> {
        let mut reserved: Vec<Arc<FetchBin>> = Vec::with_capacity(bins.len());
        for name in bins {
            let granted = match self.fetch_bin(name) {
                None => Ok(false),
                Some(bin) => bin.reserve_fetch_request(break_check).map(|ok| {
                    if ok {
                        reserved.push(bin);
                    }
                    ok
                }),
            };
            match granted {
                Ok(true) => {}
                other => {
                    for bin in &reserved {
                        bin.clear_reservation();
                    }
                    return other;
                }
            }
        }

        for (index, bin) in reserved.iter().enumerate() {
            match bin.wait_next_fetch(break_check) {
                Ok(true) => bin.begin_fetch(now_millis()),
                other => {
                    for pending in &reserved[index..] {
                        pending.clear_reservation();
                    }
                    return other;
                }
            }
        }
        Ok(true)
    }

    pub(crate) fn create_fetch_stream(&self, bins: &BinSet) {
        for name in bins {
            if let Some(bin) = self.throttle_bin(name) {
                bin.begin_fetch();
            }
        }
    }

    /// Admit a read of `byte_count` bytes in every bin, in order. Bins already
    /// admitted are backed out if a later one refuses.
    pub(crate) fn obtain_read_permission(
        &self,
        bins: &BinSet,
        byte_count: u64,
        break_check: Option<&dyn BreakCheck>,
    ) -> Result<bool> {
        let mut admitted: Vec<Arc<ThrottleBin>> = Vec::with_capacity(bins.len());
        for name in bins {
            let granted = match self.throttle_bin(name) {
                None => Ok(false),
                Some(bin) => bin.begin_read(byte_count, break_check).map(|ok| {
                    if ok {
                        admitted.push(bin);
                    }
                    ok
                }),
            };
            match granted {
                Ok(true) => {}
                other => {
                    for bin in &admitted {
                        bin.abort_read();
                        bin.end_read(byte_count, 0);
                    }
                    return other;
                }
            }
        }
        Ok(true)
    }

    pub(crate) fn release_read_permission(&self, bins: &BinSet, original_count: u64, actual_count: u64) {
        for name in bins {
            if let Some(bin) = self.throttle_bin(name) {
                bin.end_read(original_count, actual_count);
            }
        }
    }

    pub(crate) fn abort_read(&self, bins: &BinSet) {
        for name in bins {
            if let Some(bin) = self.throttle_bin(name) {
                bin.abort_read();
            }
        }
    }

    /// End the fetch on every throttle bin. True if any bin's series ended.
    pub(crate) fn close_stream(&self, bins: &BinSet) -> bool {
        bins.iter()
            .filter_map(|name| self.throttle_bin(name))
            .fold(false, |ended, bin| bin.end_fetch() || ended)
    }

    pub(crate) fn abort_stream(&self, bins: &BinSet) {
        for name in bins {
            if let Some(bin) = self.throttle_bin(name) {
                bin.abort_fetch();
            }
        }
    }

    // Bookkeeping.

    /// Refresh every bin from the spec, then let each apportion its share.
    /// All bins are polled even if some fail; the first failure is returned.
    pub(crate) fn poll(&self) -> Result<()> {
        if self.is_destroyed() {
            return Ok(());
        }
        let spec = self.spec();
        let mut first_error = None;
        let mut note = |res: Result<()>, bin: &str| {
            if let Err(e) = res {
                tracing::warn!(group = %self.qualified_name, %bin, error = %e, "bin poll failed");
                first_error.get_or_insert(e);
            }
        };

        let connection_bins: Vec<_> = lock(&self.connection_bins).values().cloned().collect();
        for bin in connection_bins {
            bin.update_max_active_connections(spec.max_open_connections(bin.bin_name()));
            note(bin.poll(), bin.bin_name());
        }
        let fetch_bins: Vec<_> = lock(&self.fetch_bins).values().cloned().collect();
        for bin in fetch_bins {
            bin.update_min_time_between_fetches(spec.minimum_milliseconds_per_fetch(bin.bin_name()));
            note(bin.poll(), bin.bin_name());
        }
        let throttle_bins: Vec<_> = lock(&self.throttle_bins).values().cloned().collect();
        for bin in throttle_bins {
            bin.update_minimum_milliseconds_per_byte(spec.minimum_milliseconds_per_byte(bin.bin_name()));
            note(bin.poll(), bin.bin_name());
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Drop pool counters nobody holds and that count no pooled connections.
    pub(crate) fn free_unused_resources(&self) -> usize {
        let mut counts = lock(&self.pool_counts);
        let before = counts.len();
        counts.retain(|_, c| Arc::strong_count(c) > 1 || !c.is_idle());
        before - counts.len()
    }

    /// Shut down every bin and leave the registry. Idempotent.
    pub(crate) fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!(group_type = %self.group_type, group = %self.group, "destroying throttle group");
        self.shut_down_bins();
        lock(&self.pool_counts).clear();
        if let Err(e) = self.service.end() {
            tracing::warn!(group = %self.qualified_name, error = %e, "could not end throttle group service");
        }
    }

    fn shut_down_bins(&self) {
        for (_, bin) in lock(&self.connection_bins).drain() {
            bin.shut_down();
        }
        for (_, bin) in lock(&self.fetch_bins).drain() {
            bin.shut_down();
        }
        for (_, bin) in lock(&self.throttle_bins).drain() {
            bin.shut_down();
        }
    }

    pub(crate) fn stats(&self) -> GroupStats {
        let mut connection_bins: Vec<ConnectionBinStats> =
            lock(&self.connection_bins).values().map(|b| b.stats()).collect();
        connection_bins.sort_by(|a, b| a.bin.cmp(&b.bin));
        GroupStats {
            group_type: self.group_type.clone(),
            group: self.group.clone(),
            state: if self.is_destroyed() {
                PoolState::Destroyed
            } else {
                PoolState::Active
            },
            connection_bins,
            fetch_bins: lock(&self.fetch_bins).len(),
            throttle_bins: lock(&self.throttle_bins).len(),
            cached_pools: lock(&self.pool_counts).len(),
        }
    }
}

impl std::fmt::Debug for ThrottlingGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThrottlingGroup")
            .field("group_type", &self.group_type)
            .field("group", &self.group)
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

fn undo_reservations(
    taken: &[(Arc<ConnectionBin>, usize)],
    decided: Option<ConnectionSource>,
    counts: &PoolCounts,
) {
    let Some(source) = decided else {
        return;
    };
    for (bin, index) in taken.iter().rev() {
        bin.undo_reservation(source, counts.get(*index));
    }
}

fn undo_pooled(taken: &[(Arc<ConnectionBin>, usize)], counts: &PoolCounts) {
    for (bin, index) in taken.iter().rev() {
        bin.undo_pooled_connection_decision(counts.get(*index));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::LocalServiceRegistry;
    use crate::throttle_spec::FixedThrottleSpec;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    fn group(max: u32) -> Arc<ThrottlingGroup> {
        let spec = Arc::new(FixedThrottleSpec::new(max, 0, 0.0).unwrap());
        Arc::new(ThrottlingGroup::new(Arc::new(LocalServiceRegistry::new()), "web", "g", spec).unwrap())
    }

    #[test]
    fn disagreeing_bins_roll_back_and_retry_until_they_agree() {
        let g = group(2);
        let bins = BinSet::new(["a", "b"]);
        assert!(g.ensure_bins(&bins).unwrap());
        let counts = g.pool_counts_for(&bins);
        assert_eq!(
            g.wait_connection_available(&counts, None).unwrap(),
            ConnectionSource::FromCreation
        );

        // Only "a" sees the connection come back, so "a" offers its pool while
        // "b" still has room to create.
        let (a, b) = (g.connection_bin("a").unwrap(), g.connection_bin("b").unwrap());
        a.note_connection_returned_to_pool(counts.get(0));

        let (tx, rx) = mpsc::channel();
        let waiter = {
            let (g, counts) = (Arc::clone(&g), Arc::clone(&counts));
            thread::spawn(move || {
                let _ = tx.send(g.wait_connection_available(&counts, None).unwrap());
            })
        };
        assert!(
            rx.recv_timeout(Duration::from_millis(50)).is_err(),
            "a split decision must not be handed out"
        );

        b.note_connection_returned_to_pool(counts.get(1));
        let source = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        waiter.join().unwrap();
        assert_eq!(source, ConnectionSource::FromPool);

        // Every abandoned attempt gave back what it took: both pooled
        // connections were consumed once, and no creation slot is left over.
        assert_eq!(counts.get(0).load(Ordering::Acquire), 0);
        assert_eq!(counts.get(1).load(Ordering::Acquire), 0);
        for bin in [&a, &b] {
            let s = bin.stats();
            assert_eq!((s.in_use, s.reserved, s.referencing_pools), (1, 0, 0), "bin {}", s.bin);
        }
    }

    #[test]
    fn missing_bin_is_detected_per_set() {
        let g = group(1);
        assert!(g.ensure_bins(&BinSet::new(["a"])).unwrap());
        assert!(g.has_connection_bins(&BinSet::new(["a"])));
        assert!(!g.has_connection_bins(&BinSet::new(["a", "z"])));
    }
}
