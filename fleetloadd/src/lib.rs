//! fleetload daemon
//!
//! One daemon runs per load-generating host. Consoles and test processes
//! both connect to it; the daemon relays control traffic from consoles to
//! test processes and status traffic back the other way.

mod relay;

pub use relay::Relay;
