//! Throttle configuration loaded from `~/.config/throttler/config.toml`.
//!
//! Each `[[groups]]` entry names a throttle group and lists its bin rules:
//!
//! ```toml
//! poll_interval_ms = 5000
//!
//! [[groups]]
//! group_type = "web"
//! group = "default"
//!
//!   [[groups.bins]]
//!   pattern = "^www\\."
//!   case_insensitive = true
//!   max_connections = 4
//!   max_kb_per_second = "64"
//!   max_fetches_per_minute = 120
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::description::{BinRule, ThrottleDescription};
use crate::error::{Result, ThrottleError};
use crate::throttler::Throttler;

const DEFAULT_POLL_INTERVAL_MS: u64 = 5_000;

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

/// One throttle group and its rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupConfig {
    pub group_type: String,
    pub group: String,
    #[serde(default)]
    pub bins: Vec<BinRule>,
}

impl GroupConfig {
    /// Compile the rules. Bad numbers and bad patterns surface here, before
    /// anything is installed.
    pub fn to_description(&self) -> Result<ThrottleDescription> {
        ThrottleDescription::new(&self.bins)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThrottlerConfig {
    /// How often bins are refreshed and re-apportioned.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub groups: Vec<GroupConfig>,
}

impl Default for ThrottlerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            groups: Vec::new(),
        }
    }
}

impl ThrottlerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn group(&self, group_type: &str, group: &str) -> Option<&GroupConfig> {
        self.groups
            .iter()
            .find(|g| g.group_type == group_type && g.group == group)
    }

    /// Compile every group's rules without installing anything.
    pub fn validate(&self) -> Result<()> {
        for g in &self.groups {
            g.to_description()?;
        }
        Ok(())
    }

    /// Install every group's rules into `throttler`. All groups are compiled
    /// first, so a bad rule leaves the throttler untouched. Returns the
    /// number of groups installed.
    pub fn apply(&self, throttler: &Throttler) -> Result<usize> {
        let compiled = self
            .groups
            .iter()
            .map(|g| g.to_description().map(|d| (g, d)))
            .collect::<Result<Vec<_>>>()?;
        for (g, description) in compiled {
            throttler.update_throttle_specification(&g.group_type, &g.group, Arc::new(description))?;
            tracing::debug!(group_type = %g.group_type, group = %g.group, rules = g.bins.len(), "installed throttle rules");
        }
        Ok(self.groups.len())
    }

    pub fn from_toml_str(data: &str, origin: &Path) -> Result<Self> {
        toml::from_str(data).map_err(|e| config_error(origin, e))
    }

    /// Load a config file; a missing file is an error.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path).map_err(|e| config_error(path, e))?;
        Self::from_toml_str(&data, path)
    }
}

fn config_error(path: &Path, err: impl std::fmt::Display) -> ThrottleError {
    ThrottleError::Config {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}

pub fn config_path() -> Result<PathBuf> {
    let xdg_dirs = xdg::BaseDirectories::with_prefix("throttler")
        .map_err(|e| config_error(Path::new("config.toml"), e))?;
    xdg_dirs
        .place_config_file("config.toml")
        .map_err(|e| config_error(Path::new("config.toml"), e))
}

/// Load the default config, writing one with defaults if none exists.
pub fn load_or_init() -> Result<ThrottlerConfig> {
    let path = config_path()?;
    if !path.exists() {
        let default_cfg = ThrottlerConfig::default();
        let toml = toml::to_string_pretty(&default_cfg).map_err(|e| config_error(&path, e))?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| config_error(&path, e))?;
        }
        fs::write(&path, toml).map_err(|e| config_error(&path, e))?;
        tracing::info!("created default config at {}", path.display());
        return Ok(default_cfg);
    }
    ThrottlerConfig::load_from_path(&path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::description::QuotaValue;
    use crate::throttle_spec::ThrottleSpec;
    use std::io::Write;

    const SAMPLE: &str = r#"
        poll_interval_ms = 250

        [[groups]]
        group_type = "web"
        group = "default"

          [[groups.bins]]
          pattern = "^www\\."
          case_insensitive = true
          max_connections = 4
          max_kb_per_second = "64"
          max_fetches_per_minute = 120.0

          [[groups.bins]]
          pattern = "example"
          max_connections = "2"
    "#;

    fn sample() -> ThrottlerConfig {
        ThrottlerConfig::from_toml_str(SAMPLE, Path::new("sample.toml")).unwrap()
    }

    #[test]
    fn default_config_values() {
        let cfg = ThrottlerConfig::default();
        assert_eq!(cfg.poll_interval_ms, 5_000);
        assert!(cfg.groups.is_empty());
    }

    #[test]
    fn missing_fields_take_defaults() {
        let cfg = ThrottlerConfig::from_toml_str("", Path::new("empty.toml")).unwrap();
        assert_eq!(cfg, ThrottlerConfig::default());
    }

    #[test]
    fn rule_values_accept_numbers_and_strings() {
        let cfg = sample();
        assert_eq!(cfg.poll_interval(), Duration::from_millis(250));
        let g = cfg.group("web", "default").unwrap();
        assert_eq!(g.bins.len(), 2);
        assert!(g.bins[0].case_insensitive);
        assert_eq!(g.bins[0].max_connections, Some(QuotaValue::Int(4)));
        assert_eq!(g.bins[0].max_kb_per_second, Some(QuotaValue::Text("64".into())));
        assert_eq!(g.bins[0].max_fetches_per_minute, Some(QuotaValue::Float(120.0)));

        let d = g.to_description().unwrap();
        assert_eq!(d.max_open_connections("WWW.example.com"), 4);
        assert_eq!(d.max_open_connections("api.example.com"), 2);
        assert_eq!(d.minimum_milliseconds_per_fetch("www.x"), 500);
    }

    #[test]
    fn config_toml_roundtrip() {
        let cfg = sample();
        let toml = toml::to_string_pretty(&cfg).unwrap();
        let parsed = ThrottlerConfig::from_toml_str(&toml, Path::new("rt.toml")).unwrap();
        assert_eq!(parsed, cfg);
    }

    #[test]
    fn bad_number_is_reported_before_install() {
        let toml = r#"
            [[groups]]
            group_type = "web"
            group = "ok"
              [[groups.bins]]
              pattern = "."
              max_connections = 1

            [[groups]]
            group_type = "web"
            group = "broken"
              [[groups.bins]]
              pattern = "."
              max_kb_per_second = "lots"
        "#;
        let cfg = ThrottlerConfig::from_toml_str(toml, Path::new("bad.toml")).unwrap();
        assert!(matches!(cfg.validate(), Err(ThrottleError::BadNumber { .. })));

        let throttler = Throttler::new();
        assert!(cfg.apply(&throttler).is_err());
        assert!(throttler.get_throttle_groups("web").is_empty());
    }

    #[test]
    fn apply_installs_groups() {
        let throttler = Throttler::new();
        assert_eq!(sample().apply(&throttler).unwrap(), 1);
        assert!(throttler.get_throttle_groups("web").contains("default"));
    }

    #[test]
    fn load_from_path_reads_file_and_reports_errors() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let cfg = ThrottlerConfig::load_from_path(file.path()).unwrap();
        assert_eq!(cfg.groups.len(), 1);

        let mut broken = tempfile::NamedTempFile::new().unwrap();
        broken.write_all(b"poll_interval_ms = \"soon\"").unwrap();
        let err = ThrottlerConfig::load_from_path(broken.path()).unwrap_err();
        assert!(matches!(err, ThrottleError::Config { .. }));

        let missing = ThrottlerConfig::load_from_path(Path::new("/nonexistent/throttler.toml"));
        assert!(matches!(missing, Err(ThrottleError::Config { .. })));
    }
}
