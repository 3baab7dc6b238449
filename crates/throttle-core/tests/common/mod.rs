#![allow(dead_code)]

pub mod specs;

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

/// Run `f` on its own thread and fail the test if it has not finished within
/// `limit`. Used to turn a deadlock into a test failure instead of a hang.
pub fn within<T: Send + 'static>(limit: Duration, what: &str, f: impl FnOnce() -> T + Send + 'static) -> T {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let _ = tx.send(f());
    });
    rx.recv_timeout(limit)
        .unwrap_or_else(|_| panic!("{what} did not finish within {limit:?}"))
}
