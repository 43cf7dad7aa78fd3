// # -----------------------------
// # crates/cli/src/lib.rs
// # -----------------------------
//! fleetload console: pushes a load profile to the daemons, starts the run
//! and gathers one result per test process.

pub mod console;
pub mod report;

pub use console::{Console, RunOptions};
pub use report::{ProcessReport, RunReport};
