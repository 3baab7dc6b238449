//! Throttle specifications shared by the integration tests.

use std::collections::HashMap;

use throttle_core::ThrottleSpec;

/// Per-bin limits; bins not listed are unlimited.
#[derive(Debug, Default)]
pub struct PerBinSpec {
    limits: HashMap<String, (u32, f64, u64)>,
}

impl PerBinSpec {
    pub fn new() -> Self {
        Self::default()
    }

    /// `max_connections`, milliseconds per byte, milliseconds per fetch.
    pub fn bin(mut self, name: &str, max_connections: u32, ms_per_byte: f64, ms_per_fetch: u64) -> Self {
        self.limits
            .insert(name.to_string(), (max_connections, ms_per_byte, ms_per_fetch));
        self
    }
}

impl ThrottleSpec for PerBinSpec {
    fn max_open_connections(&self, bin_name: &str) -> u32 {
        self.limits.get(bin_name).map_or(u32::MAX, |l| l.0)
    }

    fn minimum_milliseconds_per_byte(&self, bin_name: &str) -> f64 {
        self.limits.get(bin_name).map_or(0.0, |l| l.1)
    }

    fn minimum_milliseconds_per_fetch(&self, bin_name: &str) -> u64 {
        self.limits.get(bin_name).map_or(0, |l| l.2)
    }
}

/// Three overlapping bins: `A` caps connections at 3 and spaces fetches,
/// `B` caps at 4 and limits bandwidth, `C` only limits bandwidth and spacing.
/// Rates are scaled down so a full simulation runs in a couple of seconds.
pub fn three_bin_spec() -> PerBinSpec {
    PerBinSpec::new()
        .bin("A", 3, 0.0, 5)
        .bin("B", 4, 0.001, 0)
        .bin("C", u32::MAX, 0.0015, 10)
}
