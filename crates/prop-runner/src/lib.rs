//! Batch side of the estimation workflow: the idempotent run driver, its on-disk ledger, and the
//! aggregator that turns committed runs into a benchmark table.

pub mod aggregate;
pub mod driver;
pub mod error;
pub mod io;
pub mod ledger;

pub use aggregate::{gather, write_csv, BenchmarkRow, Gathered, Inconsistency};
pub use driver::{DriverConfig, RunDriver, RunOutcome, RunSummary};
pub use error::{Result, RunnerError};
pub use ledger::{LedgerEntry, RunLock, RunPaths};
