//! Quota configuration consumed by a throttle group.

use crate::error::{Result, ThrottleError};

/// Per-bin limits for one throttle group.
pub trait ThrottleSpec: Send + Sync {
    /// Maximum concurrent connections for a bin. `u32::MAX` means unlimited.
    fn max_open_connections(&self, bin_name: &str) -> u32;

    /// Minimum milliseconds per byte read; zero means unthrottled.
    fn minimum_milliseconds_per_byte(&self, bin_name: &str) -> f64;

    /// Minimum milliseconds between fetch starts; zero means unthrottled.
    fn minimum_milliseconds_per_fetch(&self, bin_name: &str) -> u64;
}

/// The same three limits for every bin.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FixedThrottleSpec {
    max_connections: u32,
    min_ms_between_fetches: u64,
    min_ms_per_byte: f64,
}

impl FixedThrottleSpec {
    pub fn new(max_connections: u32, min_ms_between_fetches: u64, min_ms_per_byte: f64) -> Result<Self> {
        check_ms_per_byte(min_ms_per_byte)?;
        Ok(Self {
            max_connections,
            min_ms_between_fetches,
            min_ms_per_byte,
        })
    }

    /// No limits at all.
    pub fn unlimited() -> Self {
        Self {
            max_connections: u32::MAX,
            min_ms_between_fetches: 0,
            min_ms_per_byte: 0.0,
        }
    }

    /// Build from textual quota values, as they arrive from a connector's
    /// configuration form.
    pub fn parse(max_connections: &str, min_ms_between_fetches: &str, min_ms_per_byte: &str) -> Result<Self> {
        let max_connections = max_connections
            .trim()
            .parse::<u32>()
            .map_err(|_| bad_number("max_connections", max_connections))?;
        let min_ms_between_fetches = min_ms_between_fetches
            .trim()
            .parse::<u64>()
            .map_err(|_| bad_number("min_ms_between_fetches", min_ms_between_fetches))?;
        let min_ms_per_byte = min_ms_per_byte
            .trim()
            .parse::<f64>()
            .map_err(|_| bad_number("min_ms_per_byte", min_ms_per_byte))?;
        Self::new(max_connections, min_ms_between_fetches, min_ms_per_byte)
    }
}

impl ThrottleSpec for FixedThrottleSpec {
    fn max_open_connections(&self, _bin_name: &str) -> u32 {
        self.max_connections
    }

    fn minimum_milliseconds_per_byte(&self, _bin_name: &str) -> f64 {
        self.min_ms_per_byte
    }

    fn minimum_milliseconds_per_fetch(&self, _bin_name: &str) -> u64 {
        self.min_ms_between_fetches
    }
}

fn bad_number(field: &'static str, value: &str) -> ThrottleError {
    ThrottleError::BadNumber {
        field,
        value: value.to_string(),
    }
}

pub(crate) fn check_ms_per_byte(value: f64) -> Result<()> {
    if !value.is_finite() || value < 0.0 {
        return Err(ThrottleError::InvalidLimit {
            field: "min_ms_per_byte",
            reason: format!("{value} is not a finite, non-negative number"),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_numbers() {
        let spec = FixedThrottleSpec::parse("3", " 5 ", "0.5").unwrap();
        assert_eq!(spec.max_open_connections("any"), 3);
        assert_eq!(spec.minimum_milliseconds_per_fetch("any"), 5);
        assert_eq!(spec.minimum_milliseconds_per_byte("any"), 0.5);
    }

    #[test]
    fn parse_rejects_non_numeric_quota() {
        let err = FixedThrottleSpec::parse("three", "5", "0.5").unwrap_err();
        assert!(matches!(
            err,
            ThrottleError::BadNumber { field: "max_connections", .. }
        ));
        assert!(FixedThrottleSpec::parse("3", "-1", "0").is_err());
    }

    #[test]
    fn negative_rate_is_invalid() {
        assert!(matches!(
            FixedThrottleSpec::new(1, 0, -0.5),
            Err(ThrottleError::InvalidLimit { .. })
        ));
        assert!(FixedThrottleSpec::new(1, 0, f64::NAN).is_err());
    }
}
