// Job engine: option model, command building, process supervision and scheduling

pub mod core;
pub mod error;
pub mod events;
pub mod queue;
pub mod supervisor;

pub use core::*;
pub use error::{BuildError, ControlError, JobError, OptionParseError, QueueError, Violation};
pub use events::{EventKind, JobEvent};
pub use queue::JobQueue;
pub use supervisor::{ProcessHandle, Supervisor, SupervisorConfig};
