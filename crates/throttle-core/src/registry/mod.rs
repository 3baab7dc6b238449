//! Service registry: where bins publish their local share of a quota.
//!
//! Every bin and every pool registers as an anonymous service under a
//! service type derived from its group and bin name. On each poll a bin posts
//! a [`ServiceReport`] and reads back the reports of its peers (the same bin
//! in other processes) to work out its fair share of the configured limit.
//!
//! [`LocalServiceRegistry`] keeps all of this in memory, which makes a single
//! process its own only peer: every bin then gets the full configured limit.
//! A clustered deployment plugs in its own [`ServiceRegistry`].

mod apportion;

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::{Result, ThrottleError};

pub use apportion::{connection_target, interval_from_share, rate_share, PeerView};

/// What a service last told its peers.
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceReport {
    /// Connection bin: locally granted quota and connections currently held.
    Connections { target: u32, in_use: u32 },
    /// Fetch bin: local fetch rate and the earliest time of its next fetch.
    FetchRate {
        fetches_per_ms: f64,
        next_fetch_time: i64,
    },
    /// Throttle bin: local byte rate.
    ByteRate { bytes_per_ms: f64 },
}

/// One active service as seen by a scan.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceEntry {
    pub name: String,
    pub report: Option<ServiceReport>,
}

/// Directory of active services, shared by everything that throttles the same
/// resources.
pub trait ServiceRegistry: Send + Sync {
    /// Register and activate an anonymous service; returns its unique name.
    fn register_service(&self, service_type: &str) -> Result<String>;

    /// Deactivate a service. Unknown names are ignored.
    fn end_service_activity(&self, service_type: &str, service_name: &str) -> Result<()>;

    /// Replace the report a service publishes.
    fn update_service_data(
        &self,
        service_type: &str,
        service_name: &str,
        report: ServiceReport,
    ) -> Result<()>;

    /// All active services of a type, sorted by name.
    fn scan_service_data(&self, service_type: &str) -> Result<Vec<ServiceEntry>>;
}

/// In-process registry.
#[derive(Debug, Default)]
pub struct LocalServiceRegistry {
    services: Mutex<HashMap<String, BTreeMap<String, Option<ServiceReport>>>>,
    next_id: AtomicU64,
}

impl LocalServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of active services of a type.
    pub fn active_services(&self, service_type: &str) -> usize {
        self.services
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(service_type)
            .map_or(0, BTreeMap::len)
    }

    /// Total number of active services across all types.
    pub fn total_active_services(&self) -> usize {
        self.services
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(BTreeMap::len)
            .sum()
    }
}

impl ServiceRegistry for LocalServiceRegistry {
    fn register_service(&self, service_type: &str) -> Result<String> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let name = format!("svc-{id:08}");
        self.services
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(service_type.to_string())
            .or_default()
            .insert(name.clone(), None);
        Ok(name)
    }

    fn end_service_activity(&self, service_type: &str, service_name: &str) -> Result<()> {
        let mut services = self.services.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(of_type) = services.get_mut(service_type) {
            of_type.remove(service_name);
            if of_type.is_empty() {
                services.remove(service_type);
            }
        }
        Ok(())
    }

    fn update_service_data(
        &self,
        service_type: &str,
        service_name: &str,
        report: ServiceReport,
    ) -> Result<()> {
        let mut services = self.services.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = services
            .get_mut(service_type)
            .and_then(|of_type| of_type.get_mut(service_name))
            .ok_or_else(|| {
                ThrottleError::Registry(format!(
                    "service {service_name} of type {service_type} is not active"
                ))
            })?;
        *slot = Some(report);
        Ok(())
    }

    fn scan_service_data(&self, service_type: &str) -> Result<Vec<ServiceEntry>> {
        let services = self.services.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(services
            .get(service_type)
            .map(|of_type| {
                of_type
                    .iter()
                    .map(|(name, report)| ServiceEntry {
                        name: name.clone(),
                        report: report.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// A live registration, owned by the bin or pool that made it.
#[derive(Clone)]
pub(crate) struct ServiceRegistration {
    registry: Arc<dyn ServiceRegistry>,
    service_type: String,
    service_name: String,
}

impl ServiceRegistration {
    pub(crate) fn register(registry: Arc<dyn ServiceRegistry>, service_type: String) -> Result<Self> {
        let service_name = registry.register_service(&service_type)?;
        tracing::trace!(%service_type, %service_name, "registered service");
        Ok(Self {
            registry,
            service_type,
            service_name,
        })
    }

    pub(crate) fn publish(&self, report: ServiceReport) -> Result<()> {
        self.registry
            .update_service_data(&self.service_type, &self.service_name, report)
    }

    /// Our position among the active services of our type, plus everyone
    /// else's last report.
    pub(crate) fn peers(&self) -> Result<PeerView> {
        let entries = self.registry.scan_service_data(&self.service_type)?;
        let rank = entries
            .iter()
            .position(|e| e.name == self.service_name)
            .unwrap_or(0);
        Ok(PeerView {
            num_services: entries.len(),
            rank,
            peers: entries
                .into_iter()
                .filter(|e| e.name != self.service_name)
                .filter_map(|e| e.report)
                .collect(),
        })
    }

    pub(crate) fn end(&self) -> Result<()> {
        self.registry
            .end_service_activity(&self.service_type, &self.service_name)
    }
}

impl std::fmt::Debug for ServiceRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistration")
            .field("service_type", &self.service_type)
            .field("service_name", &self.service_name)
            .finish()
    }
}

/// Service type name for a bin or pool: `<prefix><group>_<bin>`.
pub(crate) fn service_type_name(prefix: &str, group: &str, bin: &str) -> String {
    format!("{prefix}{group}_{bin}")
}
