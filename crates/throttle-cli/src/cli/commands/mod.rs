//! CLI command handlers, one per file.

mod check;
mod simulate;

pub use check::run_check;
pub use simulate::run_simulate;
