//! Simulation mode: hammer a throttle group from many threads and check the
//! resulting event log against its quotas.
//!
//! Each worker plays a connector with one pooled connection slot: it takes a
//! connection, runs a few fetches of a few reads each, then hands the
//! connection back. Nothing touches the network; the reads are pretend reads
//! that report however many bytes the plan says. Every step is logged with a
//! timestamp and the log is replayed afterwards to find the peak number of
//! outstanding connections and concurrent fetches.

use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use serde::Serialize;

use crate::bins::ConnectionSource;
use crate::poller::Poller;
use crate::throttler::{PoolThrottler, Throttler};

/// Shape of a simulation run. Defaults: 10 workers, 3 connection cycles of
/// 3 fetches of 3 reads of 1000 bytes, the last read of each fetch returning
/// only 100.
#[derive(Debug, Clone, Serialize)]
pub struct SimulationPlan {
    pub group_type: String,
    pub group: String,
    pub bins: Vec<String>,
    pub workers: usize,
    pub cycles: usize,
    pub fetches_per_cycle: usize,
    pub reads_per_fetch: usize,
    pub read_bytes: u64,
    /// Bytes actually "read" by the last read of each fetch.
    pub last_read_bytes: u64,
    /// Poll the throttler in the background at this interval.
    pub poll_interval: Option<Duration>,
}

impl SimulationPlan {
    pub fn new(group_type: impl Into<String>, group: impl Into<String>, bins: Vec<String>) -> Self {
        Self {
            group_type: group_type.into(),
            group: group.into(),
            bins,
            workers: 10,
            cycles: 3,
            fetches_per_cycle: 3,
            reads_per_fetch: 3,
            read_bytes: 1000,
            last_read_bytes: 100,
            poll_interval: Some(Duration::from_secs(1)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum EventKind {
    ConnectionCreated,
    ConnectionFromPool,
    ConnectionReturnedToPool,
    ConnectionDestroyed,
    FetchStart,
    FetchDone,
    ReadStart { bytes: u64 },
    ReadDone { bytes: u64 },
}

#[derive(Debug, Clone, Serialize)]
pub struct Event {
    /// Milliseconds since the simulation started.
    pub at_ms: u64,
    pub worker: usize,
    #[serde(flatten)]
    pub kind: EventKind,
}

#[derive(Debug)]
struct EventLog {
    start: Instant,
    events: Mutex<Vec<Event>>,
}

impl EventLog {
    fn new() -> Self {
        Self {
            start: Instant::now(),
            events: Mutex::new(Vec::new()),
        }
    }

    fn add(&self, worker: usize, kind: EventKind) {
        let at_ms = self.start.elapsed().as_millis() as u64;
        tracing::trace!(worker, ?kind, at_ms, "simulation event");
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Event { at_ms, worker, kind });
    }

    fn into_events(self) -> Vec<Event> {
        self.events.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}

/// What the replayed event log shows.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LogAnalysis {
    pub connections_created: u64,
    pub connections_reused: u64,
    pub connections_pooled: u64,
    pub connections_destroyed: u64,
    pub fetches: u64,
    pub bytes_read: u64,
    pub peak_outstanding_connections: u64,
    pub peak_concurrent_fetches: u64,
}

/// Replay events in log order.
pub fn analyze(events: &[Event]) -> LogAnalysis {
    let mut a = LogAnalysis::default();
    let (mut outstanding, mut fetching) = (0u64, 0u64);
    for e in events {
        match e.kind {
            EventKind::ConnectionCreated => {
                a.connections_created += 1;
                outstanding += 1;
                a.peak_outstanding_connections = a.peak_outstanding_connections.max(outstanding);
            }
            EventKind::ConnectionFromPool => a.connections_reused += 1,
            EventKind::ConnectionReturnedToPool => a.connections_pooled += 1,
            EventKind::ConnectionDestroyed => {
                a.connections_destroyed += 1;
                outstanding = outstanding.saturating_sub(1);
            }
            EventKind::FetchStart => {
                a.fetches += 1;
                fetching += 1;
                a.peak_concurrent_fetches = a.peak_concurrent_fetches.max(fetching);
            }
            EventKind::FetchDone => fetching = fetching.saturating_sub(1),
            EventKind::ReadStart { .. } => {}
            EventKind::ReadDone { bytes } => a.bytes_read += bytes,
        }
    }
    a
}

#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub plan: SimulationPlan,
    pub elapsed_secs: f64,
    /// Tightest connection quota among the plan's bins; `None` if unlimited.
    pub connection_limit: Option<u32>,
    pub within_quota: bool,
    #[serde(flatten)]
    pub analysis: LogAnalysis,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<Event>,
}

/// Run `plan` against `throttler`. The group must be configured already (or
/// it is created without limits). Set `keep_events` to return the raw log.
pub fn run_simulation(throttler: &Arc<Throttler>, plan: &SimulationPlan, keep_events: bool) -> Result<SimulationReport> {
    if plan.bins.is_empty() {
        bail!("simulation needs at least one bin");
    }
    let pool = throttler
        .obtain_connection_throttler(&plan.group_type, &plan.group, plan.bins.iter().cloned())
        .context("obtain connection throttler")?
        .context("throttler is shut down")?;
    let connection_limit = throttler
        .group_stats(&plan.group_type, &plan.group)
        .and_then(|s| {
            s.connection_bins
                .iter()
                .filter(|b| plan.bins.contains(&b.bin))
                .map(|b| b.max_active_connections)
                .min()
        })
        .filter(|&limit| limit != u32::MAX);

    let poller = match plan.poll_interval {
        Some(interval) => Some(Poller::spawn(Arc::clone(throttler), interval).context("spawn poller")?),
        None => None,
    };

    tracing::info!(
        group_type = %plan.group_type,
        group = %plan.group,
        bins = %pool.bins(),
        workers = plan.workers,
        "simulation started"
    );
    let log = EventLog::new();
    let (pool, log_ref) = (&pool, &log);
    let start = Instant::now();
    let outcome: Result<()> = thread::scope(|scope| {
        let handles: Vec<_> = (0..plan.workers)
            .map(|worker| {
                thread::Builder::new()
                    .name(format!("sim-worker-{worker}"))
                    .spawn_scoped(scope, move || run_worker(worker, pool, plan, log_ref))
            })
            .collect::<std::io::Result<_>>()
            .context("spawn simulation worker")?;
        let mut first_error = None;
        for h in handles {
            let res = h
                .join()
                .unwrap_or_else(|_| Err(anyhow::anyhow!("simulation worker panicked")));
            if let Err(e) = res {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    });
    let elapsed_secs = start.elapsed().as_secs_f64();
    if let Some(p) = poller {
        p.stop();
    }
    outcome?;

    let events = log.into_events();
    let analysis = analyze(&events);
    let within_quota = connection_limit.map_or(true, |limit| analysis.peak_outstanding_connections <= u64::from(limit));
    tracing::info!(
        elapsed_secs,
        peak = analysis.peak_outstanding_connections,
        ?connection_limit,
        within_quota,
        "simulation finished"
    );
    Ok(SimulationReport {
        plan: plan.clone(),
        elapsed_secs,
        connection_limit,
        within_quota,
        analysis,
        events: if keep_events { events } else { Vec::new() },
    })
}

fn run_worker(worker: usize, pool: &PoolThrottler, plan: &SimulationPlan, log: &EventLog) -> Result<()> {
    for _ in 0..plan.cycles {
        match pool.wait_connection_available(None)? {
            ConnectionSource::FromNowhere => bail!("worker {worker}: no connection available"),
            ConnectionSource::FromCreation => log.add(worker, EventKind::ConnectionCreated),
            ConnectionSource::FromPool => log.add(worker, EventKind::ConnectionFromPool),
        }
        let fetcher = pool.new_connection_fetch_throttler();
        for _ in 0..plan.fetches_per_cycle {
            if !fetcher.obtain_fetch_document_permission(None)? {
                bail!("worker {worker}: fetch permission refused");
            }
            log.add(worker, EventKind::FetchStart);
            let stream = fetcher.create_fetch_stream();
            for read in 0..plan.reads_per_fetch {
                if !stream.begin_read(plan.read_bytes, None)? {
                    bail!("worker {worker}: read permission refused");
                }
                log.add(worker, EventKind::ReadStart { bytes: plan.read_bytes });
                let actual = if read + 1 == plan.reads_per_fetch {
                    plan.last_read_bytes.min(plan.read_bytes)
                } else {
                    plan.read_bytes
                };
                stream.end_read(plan.read_bytes, actual);
                log.add(worker, EventKind::ReadDone { bytes: actual });
            }
            stream.end_fetch();
            log.add(worker, EventKind::FetchDone);
        }
        if pool.note_returned_connection() {
            log.add(worker, EventKind::ConnectionDestroyed);
            pool.note_connection_destroyed();
        } else {
            log.add(worker, EventKind::ConnectionReturnedToPool);
            pool.note_connection_returned_to_pool();
        }
    }
    Ok(())
}
