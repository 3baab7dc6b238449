//! Splitting a configured limit among the services that share it.
//!
//! Pure functions: a bin gathers its [`PeerView`] from the registry and feeds
//! it here together with its own counters.

use super::ServiceReport;

/// What a service knows about the other services of its type.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PeerView {
    /// Active services including ourselves.
    pub num_services: usize,
    /// Our index among the active services sorted by name.
    pub rank: usize,
    /// Last report of every other service that has published one.
    pub peers: Vec<ServiceReport>,
}

impl PeerView {
    pub fn is_alone(&self) -> bool {
        self.num_services <= 1
    }
}

/// Local connection quota for one bin.
///
/// The result never exceeds what the peers leave free, never exceeds an even
/// split of `max`, and moves `local_max` by small steps: down by one when we
/// are not using our whole quota, up by a quarter of `max` when we are.
pub fn connection_target(max: u32, local_max: u32, local_in_use: u32, view: &PeerView) -> u32 {
    if view.is_alone() {
        return max;
    }
    let (mut peer_target, mut peer_in_use) = (0u64, 0u64);
    for report in &view.peers {
        if let ServiceReport::Connections { target, in_use } = report {
            peer_target += u64::from(*target);
            peer_in_use += u64::from(*in_use);
        }
    }
    let max = u64::from(max);
    let maximum = max
        .saturating_sub(peer_target)
        .min(max.saturating_sub(peer_in_use));

    let n = view.num_services as u64;
    let mut fair = max / n;
    if (view.rank as u64) < max % n {
        fair += 1;
    }

    let local_max = u64::from(local_max);
    let optimal = if local_max > u64::from(local_in_use) {
        local_max - 1
    } else {
        local_max + (max / 4).max(1)
    };

    maximum.min(fair).min(optimal).min(u64::from(u32::MAX)) as u32
}

/// Local share of a rate, in units per millisecond.
///
/// `min_interval` is the configured minimum milliseconds per unit; zero means
/// unlimited and yields `f64::INFINITY`. `peer_rate` picks the rate a peer's
/// report claims, if it is the right kind of report.
pub fn rate_share(
    min_interval: f64,
    view: &PeerView,
    peer_rate: impl Fn(&ServiceReport) -> Option<f64>,
) -> f64 {
    if min_interval <= 0.0 {
        return f64::INFINITY;
    }
    let max_rate = 1.0 / min_interval;
    let claimed: f64 = view.peers.iter().filter_map(peer_rate).sum();
    let maximum = (max_rate - claimed).max(0.0);
    let fair = max_rate / view.num_services.max(1) as f64;
    maximum.min(fair)
}

/// Turn a rate share back into a minimum interval. `None` means no share is
/// available yet and the caller has to wait for the next poll.
pub fn interval_from_share(share: f64) -> Option<f64> {
    if share.is_infinite() {
        Some(0.0)
    } else if share > 0.0 {
        Some(1.0 / share)
    } else {
        None
    }
}
