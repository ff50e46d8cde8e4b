//! Manager/Responder/Worker concurrency core and process lifecycle wiring
//! (spec.md §4.4-§4.6, §5).

pub mod broker;
pub mod control_plane;
pub mod lifecycle;
pub mod manager;
pub mod queue_naming;
pub mod responder;
pub mod worker;

pub use control_plane::{ControlPlane, ResultMessage, Severity, StoppingDescriptor, Task};
pub use lifecycle::{run_once, serve};
pub use manager::{Manager, ManagerConfig};
pub use responder::{Responder, ResponderConfig};
