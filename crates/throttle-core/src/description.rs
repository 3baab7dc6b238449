//! Rule-based throttle specification.
//!
//! Each rule pairs a regular expression over bin names with optional limits.
//! A bin is governed by every rule whose pattern matches anywhere in its name;
//! the most generous connection limit and the tightest rates among them win.

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::error::{Result, ThrottleError};
use crate::throttle_spec::ThrottleSpec;

/// A quota as written in configuration: a number or a numeric string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QuotaValue {
    Int(i64),
    Float(f64),
    Text(String),
}

impl QuotaValue {
    fn to_f64(&self, field: &'static str) -> Result<f64> {
        match self {
            QuotaValue::Int(n) => Ok(*n as f64),
            QuotaValue::Float(x) => Ok(*x),
            QuotaValue::Text(s) => s.trim().parse::<f64>().map_err(|_| ThrottleError::BadNumber {
                field,
                value: s.clone(),
            }),
        }
    }

    fn to_i64(&self, field: &'static str) -> Result<i64> {
        match self {
            QuotaValue::Int(n) => Ok(*n),
            QuotaValue::Float(x) => Err(ThrottleError::BadNumber {
                field,
                value: x.to_string(),
            }),
            QuotaValue::Text(s) => s.trim().parse::<i64>().map_err(|_| ThrottleError::BadNumber {
                field,
                value: s.clone(),
            }),
        }
    }
}

impl From<i64> for QuotaValue {
    fn from(n: i64) -> Self {
        QuotaValue::Int(n)
    }
}

impl From<i32> for QuotaValue {
    fn from(n: i32) -> Self {
        QuotaValue::Int(i64::from(n))
    }
}

impl From<u32> for QuotaValue {
    fn from(n: u32) -> Self {
        QuotaValue::Int(i64::from(n))
    }
}

impl From<f64> for QuotaValue {
    fn from(x: f64) -> Self {
        QuotaValue::Float(x)
    }
}

impl From<&str> for QuotaValue {
    fn from(s: &str) -> Self {
        QuotaValue::Text(s.to_string())
    }
}

/// One throttling rule as configured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinRule {
    pub pattern: String,
    #[serde(default)]
    pub case_insensitive: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<QuotaValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_kb_per_second: Option<QuotaValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_fetches_per_minute: Option<QuotaValue>,
}

impl BinRule {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            case_insensitive: false,
            max_connections: None,
            max_kb_per_second: None,
            max_fetches_per_minute: None,
        }
    }

    pub fn case_insensitive(mut self) -> Self {
        self.case_insensitive = true;
        self
    }

    pub fn max_connections(mut self, value: impl Into<QuotaValue>) -> Self {
        self.max_connections = Some(value.into());
        self
    }

    pub fn max_kb_per_second(mut self, value: impl Into<QuotaValue>) -> Self {
        self.max_kb_per_second = Some(value.into());
        self
    }

    pub fn max_fetches_per_minute(mut self, value: impl Into<QuotaValue>) -> Self {
        self.max_fetches_per_minute = Some(value.into());
        self
    }
}

#[derive(Debug)]
struct CompiledRule {
    pattern: Regex,
    max_connections: Option<u32>,
    min_ms_per_byte: Option<f64>,
    min_ms_per_fetch: Option<u64>,
}

impl CompiledRule {
    fn compile(rule: &BinRule) -> Result<Self> {
        let max_connections = match &rule.max_connections {
            None => None,
            Some(v) => {
                let n = v.to_i64("max_connections")?;
                Some(u32::try_from(n).map_err(|_| ThrottleError::InvalidLimit {
                    field: "max_connections",
                    reason: format!("{n} is out of range"),
                })?)
            }
        };
        let min_ms_per_byte = match &rule.max_kb_per_second {
            None => None,
            Some(v) => {
                let kb_per_second = v.to_f64("max_kb_per_second")?;
                (kb_per_second > 0.0).then(|| 1.0 / kb_per_second)
            }
        };
        let min_ms_per_fetch = match &rule.max_fetches_per_minute {
            None => None,
            Some(v) => {
                let per_minute = v.to_f64("max_fetches_per_minute")?;
                (per_minute > 0.0).then(|| (60_000.0 / per_minute) as u64)
            }
        };
        let pattern = RegexBuilder::new(&rule.pattern)
            .case_insensitive(rule.case_insensitive)
            .build()
            .map_err(|source| ThrottleError::BadPattern {
                pattern: rule.pattern.clone(),
                source,
            })?;
        Ok(Self {
            pattern,
            max_connections,
            min_ms_per_byte,
            min_ms_per_fetch,
        })
    }
}

/// Limits resolved for one bin.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedLimits {
    pub bin: String,
    pub max_connections: u32,
    pub min_ms_per_byte: f64,
    pub min_ms_per_fetch: u64,
}

/// Compiled set of [`BinRule`]s.
#[derive(Debug)]
pub struct ThrottleDescription {
    rules: Vec<CompiledRule>,
}

impl ThrottleDescription {
    /// Compile rules. A later rule with the same pattern replaces an earlier
    /// one.
    pub fn new(rules: &[BinRule]) -> Result<Self> {
        let mut compiled: Vec<CompiledRule> = Vec::with_capacity(rules.len());
        for rule in rules {
            let c = CompiledRule::compile(rule)?;
            match compiled
                .iter_mut()
                .find(|existing| existing.pattern.as_str() == rule.pattern)
            {
                Some(existing) => *existing = c,
                None => compiled.push(c),
            }
        }
        Ok(Self { rules: compiled })
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn resolve(&self, bin_name: &str) -> ResolvedLimits {
        ResolvedLimits {
            bin: bin_name.to_string(),
            max_connections: self.max_open_connections(bin_name),
            min_ms_per_byte: self.minimum_milliseconds_per_byte(bin_name),
            min_ms_per_fetch: self.minimum_milliseconds_per_fetch(bin_name),
        }
    }

    fn matching<'a>(&'a self, bin_name: &'a str) -> impl Iterator<Item = &'a CompiledRule> + 'a {
        self.rules
            .iter()
            .filter(move |rule| rule.pattern.is_match(bin_name))
    }
}

impl ThrottleSpec for ThrottleDescription {
    fn max_open_connections(&self, bin_name: &str) -> u32 {
        match self.matching(bin_name).filter_map(|r| r.max_connections).max() {
            None => u32::MAX,
            Some(0) => 1,
            Some(n) => n,
        }
    }

    fn minimum_milliseconds_per_byte(&self, bin_name: &str) -> f64 {
        self.matching(bin_name)
            .filter_map(|r| r.min_ms_per_byte)
            .reduce(f64::min)
            .unwrap_or(0.0)
    }

    fn minimum_milliseconds_per_fetch(&self, bin_name: &str) -> u64 {
        self.matching(bin_name)
            .filter_map(|r| r.min_ms_per_fetch)
            .min()
            .unwrap_or(0)
    }
}
