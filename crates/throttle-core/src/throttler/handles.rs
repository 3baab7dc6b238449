//! Caller-side handles scoped to one bin set of one throttle group.
//!
//! Handles never own bins. They hold the group and look bins up by name on
//! every call, so a destroyed group simply answers "unavailable".

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::group::ThrottlingGroup;
use crate::bin_set::BinSet;
use crate::bins::ConnectionSource;
use crate::break_check::BreakCheck;
use crate::error::Result;

/// Pooled-connection counters of one caller pool, one per bin of its set.
///
/// The counters are only ever changed by connection bins, each while holding
/// its own lock.
#[derive(Debug)]
pub struct PoolCounts {
    bins: BinSet,
    counts: Vec<AtomicUsize>,
}

impl PoolCounts {
    pub fn new(bins: BinSet) -> Self {
        let counts = bins.iter().map(|_| AtomicUsize::new(0)).collect();
        Self { bins, counts }
    }

    pub fn bins(&self) -> &BinSet {
        &self.bins
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub(crate) fn get(&self, index: usize) -> &AtomicUsize {
        &self.counts[index]
    }

    /// Pooled connections as seen by the first bin of the set.
    pub fn pooled(&self) -> usize {
        self.counts
            .first()
            .map_or(0, |c| c.load(Ordering::Acquire))
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.counts.iter().all(|c| c.load(Ordering::Acquire) == 0)
    }
}

/// Connection throttling for one caller-managed connection pool.
///
/// The caller keeps the actual connections; this handle tells it whether to
/// reuse a pooled one, open a new one, or destroy one.
#[derive(Debug)]
pub struct PoolThrottler {
    group: Arc<ThrottlingGroup>,
    counts: Arc<PoolCounts>,
}

impl PoolThrottler {
    pub(crate) fn new(group: Arc<ThrottlingGroup>, counts: Arc<PoolCounts>) -> Self {
        Self { group, counts }
    }

    pub fn bins(&self) -> &BinSet {
        self.counts.bins()
    }

    pub fn pooled_connections(&self) -> usize {
        self.counts.pooled()
    }

    /// Block until a connection may be reused or created. On
    /// [`ConnectionSource::FromCreation`] the connection is already counted
    /// as in use; on [`ConnectionSource::FromPool`] one pooled connection has
    /// been handed to the caller.
    pub fn wait_connection_available(&self, break_check: Option<&dyn BreakCheck>) -> Result<ConnectionSource> {
        self.group.wait_connection_available(&self.counts, break_check)
    }

    pub fn new_connection_fetch_throttler(&self) -> FetchThrottler {
        FetchThrottler::new(Arc::clone(&self.group), self.counts.bins().clone())
    }

    /// Whether a connection coming back from use should be destroyed instead
    /// of pooled.
    pub fn note_returned_connection(&self) -> bool {
        self.group.note_returned_connection(self.counts.bins())
    }

    /// Whether a pooled connection should be destroyed to get back under
    /// quota. On true the caller must take one connection out of its pool,
    /// destroy it and call [`note_connection_destroyed`](Self::note_connection_destroyed).
    pub fn check_destroy_pooled_connection(&self) -> bool {
        self.group.check_destroy_pooled_connection(&self.counts)
    }

    /// Take an expired connection out of the pool counters. On true the
    /// caller destroys it and calls [`note_connection_destroyed`](Self::note_connection_destroyed).
    pub fn check_expire_connection(&self) -> bool {
        self.group.check_expire_connection(&self.counts)
    }

    pub fn note_connection_returned_to_pool(&self) {
        self.group.note_connection_returned_to_pool(&self.counts);
    }

    pub fn note_connection_destroyed(&self) {
        self.group.note_connection_destroyed(self.counts.bins());
    }
}

/// Fetch scheduling for the connection a permit was granted for.
#[derive(Debug, Clone)]
pub struct FetchThrottler {
    group: Arc<ThrottlingGroup>,
    bins: BinSet,
}

impl FetchThrottler {
    pub(crate) fn new(group: Arc<ThrottlingGroup>, bins: BinSet) -> Self {
        Self { group, bins }
    }

    pub fn bins(&self) -> &BinSet {
        &self.bins
    }

    /// Wait until every bin allows the next fetch and record its start.
    /// False if the group is shut down.
    pub fn obtain_fetch_document_permission(&self, break_check: Option<&dyn BreakCheck>) -> Result<bool> {
        self.group.obtain_fetch_document_permission(&self.bins, break_check)
    }

    /// Open a byte stream for a fetch that has permission.
    pub fn create_fetch_stream(&self) -> StreamThrottler {
        self.group.create_fetch_stream(&self.bins);
        StreamThrottler {
            group: Arc::clone(&self.group),
            bins: self.bins.clone(),
            open: true,
        }
    }

    /// Fetch permission and stream in one step. `None` if the group is shut
    /// down.
    pub fn begin_fetch(&self, break_check: Option<&dyn BreakCheck>) -> Result<Option<StreamThrottler>> {
        if !self.obtain_fetch_document_permission(break_check)? {
            return Ok(None);
        }
        Ok(Some(self.create_fetch_stream()))
    }
}

/// Read throttling for one fetch. Dropping an open stream ends the fetch.
#[derive(Debug)]
pub struct StreamThrottler {
    group: Arc<ThrottlingGroup>,
    bins: BinSet,
    open: bool,
}

impl StreamThrottler {
    /// Wait until `byte_count` bytes may be read. False if the group is shut
    /// down. An admitted read ends with [`end_read`](Self::end_read) or
    /// [`abort_read`](Self::abort_read).
    pub fn begin_read(&self, byte_count: u64, break_check: Option<&dyn BreakCheck>) -> Result<bool> {
        self.group.obtain_read_permission(&self.bins, byte_count, break_check)
    }

    /// Finish a read admitted for `original_count` bytes that moved
    /// `actual_count`.
    pub fn end_read(&self, original_count: u64, actual_count: u64) {
        self.group
            .release_read_permission(&self.bins, original_count, actual_count);
    }

    pub fn abort_read(&self) {
        self.group.abort_read(&self.bins);
    }

    /// End the fetch. True if this closed the series on some bin.
    pub fn end_fetch(mut self) -> bool {
        self.open = false;
        self.group.close_stream(&self.bins)
    }

    /// Leave the fetch without having read from it.
    pub fn abort_fetch(mut self) {
        self.open = false;
        self.group.abort_stream(&self.bins);
    }
}

impl Drop for StreamThrottler {
    fn drop(&mut self) {
        if self.open {
            self.group.close_stream(&self.bins);
        }
    }
}

/// Granted connection permission.
#[derive(Debug, Clone)]
pub struct ConnectionPermit {
    source: ConnectionSource,
    fetch: FetchThrottler,
}

impl ConnectionPermit {
    pub(crate) fn new(source: ConnectionSource, fetch: FetchThrottler) -> Self {
        Self { source, fetch }
    }

    /// Whether to reuse a pooled connection or create one.
    pub fn source(&self) -> ConnectionSource {
        self.source
    }

    pub fn bins(&self) -> &BinSet {
        self.fetch.bins()
    }

    pub fn fetch_throttler(&self) -> &FetchThrottler {
        &self.fetch
    }

    pub fn into_fetch_throttler(self) -> FetchThrottler {
        self.fetch
    }

    /// See [`FetchThrottler::begin_fetch`].
    pub fn begin_fetch(&self, break_check: Option<&dyn BreakCheck>) -> Result<Option<StreamThrottler>> {
        self.fetch.begin_fetch(break_check)
    }
}
