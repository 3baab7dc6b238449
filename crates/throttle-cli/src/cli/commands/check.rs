//! `throttlectl check [--bin NAME]...` – validate rules and resolve bins.

use anyhow::{Context, Result};
use throttle_core::config::ThrottlerConfig;

fn format_limit<T: PartialEq + std::fmt::Display>(value: T, unlimited: T) -> String {
    if value == unlimited {
        "-".to_string()
    } else {
        value.to_string()
    }
}

pub fn run_check(cfg: &ThrottlerConfig, bins: &[String]) -> Result<()> {
    if cfg.groups.is_empty() {
        println!("No throttle groups configured.");
        return Ok(());
    }
    println!("Poll interval: {} ms", cfg.poll_interval_ms);
    for g in &cfg.groups {
        let description = g
            .to_description()
            .with_context(|| format!("group {}/{}", g.group_type, g.group))?;
        println!("{}/{}: {} rule(s)", g.group_type, g.group, description.len());
        if bins.is_empty() {
            continue;
        }
        println!("  {:<32} {:>8} {:>10} {:>10}", "BIN", "MAXCONN", "MS/BYTE", "MS/FETCH");
        for bin in bins {
            let limits = description.resolve(bin);
            println!(
                "  {:<32} {:>8} {:>10} {:>10}",
                limits.bin,
                format_limit(limits.max_connections, u32::MAX),
                format_limit(limits.min_ms_per_byte, 0.0),
                format_limit(limits.min_ms_per_fetch, 0),
            );
        }
    }
    Ok(())
}
