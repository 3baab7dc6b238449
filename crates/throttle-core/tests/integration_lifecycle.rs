//! Integration test: configuration to permits, cancellation, and shutdown.

mod common;

use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use throttle_core::config::ThrottlerConfig;
use throttle_core::{
    AbortFlag, ConnectionSource, ConnectionThrottler, Deadline, FixedThrottleSpec, LocalServiceRegistry,
    ReturnedConnection, ThrottleError, ThrottledConnector, Throttler,
};

const CONFIG: &str = r#"
    poll_interval_ms = 100

    [[groups]]
    group_type = "web"
    group = "crawl"

      [[groups.bins]]
      pattern = "^example\\.com$"
      max_connections = 1

      [[groups.bins]]
      pattern = "\\.org$"
      max_connections = "2"
      max_fetches_per_minute = 600
"#;

#[test]
fn configured_rules_drive_connection_quotas() {
    let cfg = ThrottlerConfig::from_toml_str(CONFIG, Path::new("test.toml")).unwrap();
    let throttler = Arc::new(Throttler::new());
    assert_eq!(cfg.apply(&throttler).unwrap(), 1);
    let connector = ConnectionThrottler::new(Arc::clone(&throttler), "web", "crawl");

    let first = connector.obtain(&["example.com"], None).unwrap().unwrap();
    assert_eq!(first.source(), ConnectionSource::FromCreation);
    let blocked = connector.obtain(&["example.com"], Some(&Deadline::after(Duration::from_millis(60))));
    assert!(matches!(blocked, Err(ThrottleError::TimedOut)));

    // Two slots for the .org rule.
    let a = connector.obtain(&["lists.debian.org"], None).unwrap().unwrap();
    let b = connector.obtain(&["lists.debian.org"], None).unwrap().unwrap();
    assert_eq!((a.source(), b.source()), (ConnectionSource::FromCreation, ConnectionSource::FromCreation));

    // Unmatched bins are unlimited.
    for _ in 0..5 {
        connector.obtain(&["elsewhere.net"], None).unwrap().unwrap();
    }

    let stats = throttler.group_stats("web", "crawl").unwrap();
    let org = stats
        .connection_bins
        .iter()
        .find(|b| b.bin == "lists.debian.org")
        .unwrap();
    assert_eq!((org.max_active_connections, org.in_use), (2, 2));
}

#[test]
fn abort_flag_breaks_a_wait_and_rolls_back_earlier_bins() {
    let throttler = Arc::new(Throttler::new());
    throttler
        .update_throttle_specification("web", "g", Arc::new(FixedThrottleSpec::new(1, 0, 0.0).unwrap()))
        .unwrap();
    let connector = ConnectionThrottler::new(Arc::clone(&throttler), "web", "g");
    let _holder = connector.obtain(&["proxy"], None).unwrap().unwrap();

    let flag = AbortFlag::new();
    let waiter = {
        let connector = connector.clone();
        let flag = flag.clone();
        // "origin" sorts before "proxy", so it is reserved first and must be undone.
        thread::spawn(move || connector.obtain(&["proxy", "origin"], Some(&flag)).map(|p| p.is_some()))
    };
    thread::sleep(Duration::from_millis(80));
    let started = Instant::now();
    flag.abort();
    let outcome = waiter.join().unwrap();
    assert!(matches!(outcome, Err(ThrottleError::Interrupted)));
    assert!(started.elapsed() < Duration::from_secs(1));

    let origin = connector
        .obtain(&["origin"], Some(&Deadline::after(Duration::from_millis(200))))
        .unwrap()
        .unwrap();
    assert_eq!(origin.source(), ConnectionSource::FromCreation);
}

#[test]
fn destroy_releases_every_waiter_and_ends_registry_services() {
    let registry = Arc::new(LocalServiceRegistry::new());
    let throttler = Arc::new(Throttler::with_registry(registry.clone()));
    throttler
        .update_throttle_specification("web", "g", Arc::new(FixedThrottleSpec::new(1, 0, 0.0).unwrap()))
        .unwrap();
    let connector = ConnectionThrottler::new(Arc::clone(&throttler), "web", "g");
    let _held = connector.obtain(&["h"], None).unwrap().unwrap();

    let waiters: Vec<_> = (0..4)
        .map(|_| {
            let connector = connector.clone();
            thread::spawn(move || connector.obtain_permit(&["h"], None).unwrap().is_none())
        })
        .collect();
    thread::sleep(Duration::from_millis(50));
    assert!(registry.total_active_services() > 0);

    throttler.destroy();
    let released = common::within(Duration::from_secs(5), "waiters", move || {
        waiters.into_iter().map(|w| w.join().unwrap()).collect::<Vec<_>>()
    });
    assert_eq!(released, vec![true; 4]);
    assert_eq!(registry.total_active_services(), 0);

    assert!(connector.obtain(&["h"], None).unwrap().is_none());
    assert_eq!(connector.release_permit(&["h"]), ReturnedConnection::Destroyed);
    assert!(throttler.get_throttle_groups("web").is_empty());
}

#[test]
fn lowered_quota_destroys_returned_connections() {
    let throttler = Arc::new(Throttler::new());
    throttler
        .update_throttle_specification("web", "g", Arc::new(FixedThrottleSpec::new(3, 0, 0.0).unwrap()))
        .unwrap();
    let connector = ConnectionThrottler::new(Arc::clone(&throttler), "web", "g");
    for _ in 0..3 {
        connector.obtain(&["h"], None).unwrap().unwrap();
    }
    throttler
        .update_throttle_specification("web", "g", Arc::new(FixedThrottleSpec::new(1, 0, 0.0).unwrap()))
        .unwrap();
    assert_eq!(connector.over_quota_count(&["h"]), 1);
    assert_eq!(connector.release(&["h"]), ReturnedConnection::Destroyed);
    assert_eq!(connector.release(&["h"]), ReturnedConnection::Destroyed);
    assert_eq!(connector.release(&["h"]), ReturnedConnection::Pooled);
    assert_eq!(connector.over_quota_count(&["h"]), 0);
}
