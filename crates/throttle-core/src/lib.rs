pub mod config;
pub mod error;
pub mod logging;

pub mod bench;
pub mod bin_set;
pub mod bins;
pub mod break_check;
pub mod description;
pub mod facade;
pub mod poller;
pub mod registry;
pub mod throttle_spec;
pub mod throttler;

pub use bin_set::BinSet;
pub use bins::ConnectionSource;
pub use break_check::{AbortFlag, BreakCheck, Deadline};
pub use description::{BinRule, QuotaValue, ThrottleDescription};
pub use error::{Result, ThrottleError};
pub use facade::{ConnectionThrottler, ThrottledConnector};
pub use registry::{LocalServiceRegistry, ServiceRegistry};
pub use throttle_spec::{FixedThrottleSpec, ThrottleSpec};
pub use throttler::{
    ConnectionPermit, FetchThrottler, PoolThrottler, ReturnedConnection, StreamThrottler, Throttler,
};
