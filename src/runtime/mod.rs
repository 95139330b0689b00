//! Local dev-server supervision: port probing, log capture, process lifecycle and
//! the per-project registry.

pub mod logs;
pub mod port;
pub mod registry;
pub mod supervisor;

pub use logs::{LogEntry, LogLevel, LogRingBuffer, LogSubscription, OutputStream};
pub use port::find_available_port;
pub use registry::RuntimeRegistry;
pub use supervisor::{ProcessSupervisor, SupervisorOptions, SupervisorPhase, SupervisorStatus};
