//! Periodic maintenance for the task queues and tunnel sessions
//!
//! One run performs, in order: stuck-task detection, the retention purge,
//! the tunnel orphan sweep and the tunnel expiry sweep. A failing sweep is
//! logged and reported; the remaining sweeps still run, and the failed one is
//! retried on the next scheduled run.

pub mod config;
pub mod housekeeper;

pub use config::HousekeeperConfig;
pub use housekeeper::{Housekeeper, Sweep, SweepFailure, SweepReport};
