//! voxrun Core Domain Types
//!
//! This crate contains pure domain types with no dependencies on:
//! - Network/HTTP
//! - Local inference engines
//! - Runtime specifics
//!
//! All types here describe long-running tasks, their lifecycle and the
//! progress events that drive it.

pub mod error;
pub mod event;
pub mod ids;
pub mod stats;
pub mod status;
pub mod task;
mod wire_time;

// Re-export commonly used types
pub use error::CoreError;
pub use event::{ProgressEvent, QueueEvent};
pub use ids::TaskId;
pub use stats::JobStats;
pub use status::{QueueTab, TaskKind, TaskStatus};
pub use task::{Task, Transition, DEFAULT_PRIORITY, DEFAULT_RETENTION_DAYS};
