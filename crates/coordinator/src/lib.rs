//! Per-process state machine that turns a schedule of operations plus
//! START/ABORT control signals into one authoritative outcome.

mod coordinator;
mod driver;
mod error;
mod gate;
mod lifecycle;
mod uplink;

pub use coordinator::{AbortHandle, CoordinatorConfig, ProcessCoordinator, ProcessState};
pub use driver::{Driver, ExecutionContext};
pub use error::{AbortSignal, CoordinatorError, Severity};
pub use gate::{GateExit, StartGate};
pub use lifecycle::{LifecycleListener, ProcessContext};
pub use uplink::Uplink;
