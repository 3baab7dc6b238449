//! `throttlectl simulate` – drive a throttle group from worker threads.

use std::sync::Arc;

use anyhow::{bail, Result};
use throttle_core::bench::{self, SimulationPlan, SimulationReport};
use throttle_core::config::ThrottlerConfig;
use throttle_core::Throttler;

use crate::cli::SimulateArgs;

fn print_report(r: &SimulationReport) {
    let a = &r.analysis;
    println!("  {:<28} {}", "Workers", r.plan.workers);
    println!("  {:<28} {:.2}", "Time(s)", r.elapsed_secs);
    println!("  {:<28} {}", "Fetches", a.fetches);
    println!("  {:<28} {}", "Bytes read", a.bytes_read);
    println!("  {:<28} {}", "Connections created", a.connections_created);
    println!("  {:<28} {}", "Connections reused", a.connections_reused);
    println!("  {:<28} {}", "Connections destroyed", a.connections_destroyed);
    println!("  {:<28} {}", "Peak concurrent fetches", a.peak_concurrent_fetches);
    let limit = r
        .connection_limit
        .map(|l| l.to_string())
        .unwrap_or_else(|| "unlimited".to_string());
    println!(
        "  {:<28} {} (limit {})",
        "Peak outstanding conns", a.peak_outstanding_connections, limit
    );
}

pub fn run_simulate(cfg: &ThrottlerConfig, args: &SimulateArgs) -> Result<()> {
    let throttler = Arc::new(Throttler::new());
    cfg.apply(&throttler)?;
    if cfg.group(&args.group_type, &args.group).is_none() {
        tracing::warn!(
            group_type = %args.group_type,
            group = %args.group,
            "group not in config, simulating without limits"
        );
    }

    let mut plan = SimulationPlan::new(args.group_type.clone(), args.group.clone(), args.bins.clone());
    plan.workers = args.workers;
    plan.cycles = args.cycles;
    plan.fetches_per_cycle = args.fetches;
    plan.reads_per_fetch = args.reads;
    plan.read_bytes = args.read_bytes;
    plan.last_read_bytes = args.read_bytes / 10;
    plan.poll_interval = Some(cfg.poll_interval());

    let report = bench::run_simulation(&throttler, &plan, args.json)?;
    throttler.destroy();
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    if !report.within_quota {
        bail!(
            "connection quota exceeded: peak {} over limit {:?}",
            report.analysis.peak_outstanding_connections,
            report.connection_limit
        );
    }
    Ok(())
}
