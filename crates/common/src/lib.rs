// # -----------------------------
// # crates/common/src/lib.rs
// # -----------------------------
//! Types shared by the fleetload console, daemon and test processes.
//!
//! Everything that crosses a process boundary lives here: the wire
//! [`Envelope`], its payloads, client identifiers, the load profile and the
//! runtime configuration.

pub mod config;
pub mod ids;
pub mod message;
pub mod profile;

pub use config::{ConfigError, FleetConfig, ProcessSettings, SchedulerSettings, TransportSettings};
pub use message::{
    ClientCount, Envelope, MessageError, MessageType, ProcessIds, ProcessOutcome, StatusReport,
};
pub use profile::{
    assignments_for, DaemonEndpoint, LoadProfile, OperationAssignment, ProcessConfig,
    ProfileEvent,
};
