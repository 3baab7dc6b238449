//! Per-bin monitors: connection quota, fetch spacing, byte rate.
//!
//! Each bin owns one mutex and one condition variable. Waiters are woken by
//! broadcast and re-check their condition; there is no FIFO ordering.

mod connection;
mod fetch;
mod throttle;
pub(crate) mod wait;

pub use connection::{ConnectionBin, ConnectionBinStats, ConnectionSource, PooledDecision};
pub use fetch::FetchBin;
pub use throttle::ThrottleBin;
