//! OBD-II Session Engine
//!
//! Schedules polling of the configured parameters by how overdue each one
//! is, arbitrates ad-hoc and trouble code requests against routine polls
//! and runs both through a single adapter session.

pub mod engine;
mod error;
pub mod queue;
mod scheduler;

pub use engine::{start_session, EngineConfig, PollTarget, SessionHandle, VehicleConfig};
pub use error::EngineError;
pub use queue::{Priority, PushError, RequestQueue};
pub use scheduler::{PollScheduler, ScheduledPid, SchedulerConfig};
