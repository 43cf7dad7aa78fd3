//! Host for one fleetload test process: connects to the local daemon,
//! receives its CONFIG and hands control to the process coordinator.

mod driver;
mod host;

pub use driver::{LoggingDriver, ABORT_ON_PROPERTY, LATENCY_PROPERTY};
pub use host::TestProcessHost;
