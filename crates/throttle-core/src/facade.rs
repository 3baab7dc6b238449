//! Per-connector view of a shared [`Throttler`].
//!
//! A connector is configured with one throttle group; the façade fixes the
//! group so call sites only name the bins of the resource they talk to.

use std::sync::Arc;

use crate::break_check::BreakCheck;
use crate::error::Result;
use crate::throttler::{ConnectionPermit, ReturnedConnection, Throttler};

/// The capability a connector plugin needs from the throttler.
pub trait ThrottledConnector {
    /// Block until a connection to the resource described by `bins` may be
    /// reused or opened. `None` when the throttler is shutting down.
    fn obtain_permit(&self, bins: &[&str], break_check: Option<&dyn BreakCheck>) -> Result<Option<ConnectionPermit>>;

    /// Hand the connection back.
    fn release_permit(&self, bins: &[&str]) -> ReturnedConnection;
}

#[derive(Debug, Clone)]
pub struct ConnectionThrottler {
    throttler: Arc<Throttler>,
    group_type: String,
    group: String,
}

impl ConnectionThrottler {
    pub fn new(throttler: Arc<Throttler>, group_type: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            throttler,
            group_type: group_type.into(),
            group: group.into(),
        }
    }

    pub fn group_type(&self) -> &str {
        &self.group_type
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn throttler(&self) -> &Arc<Throttler> {
        &self.throttler
    }

    pub fn obtain(&self, bins: &[&str], break_check: Option<&dyn BreakCheck>) -> Result<Option<ConnectionPermit>> {
        self.throttler
            .obtain_connection_permission(&self.group_type, &self.group, bins.iter().copied(), break_check)
    }

    pub fn release(&self, bins: &[&str]) -> ReturnedConnection {
        self.throttler
            .release_connection_permission(&self.group_type, &self.group, bins.iter().copied())
    }

    /// How many of `bins` are over quota; a hint for the connector's own
    /// eviction of pooled connections.
    pub fn over_quota_count(&self, bins: &[&str]) -> usize {
        self.throttler
            .over_connection_quota_count(&self.group_type, &self.group, bins.iter().copied())
    }

    pub fn expire_pooled_connection(&self, bins: &[&str]) -> bool {
        self.throttler
            .expire_pooled_connection(&self.group_type, &self.group, bins.iter().copied())
    }
}

impl ThrottledConnector for ConnectionThrottler {
    fn obtain_permit(&self, bins: &[&str], break_check: Option<&dyn BreakCheck>) -> Result<Option<ConnectionPermit>> {
        self.obtain(bins, break_check)
    }

    fn release_permit(&self, bins: &[&str]) -> ReturnedConnection {
        self.release(bins)
    }
}
