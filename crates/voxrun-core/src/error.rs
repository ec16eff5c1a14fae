//! Core domain errors.

use thiserror::Error;

use crate::{TaskId, TaskStatus};

/// Core domain errors for voxrun.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Task not found.
    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    /// A task with this id is already registered.
    #[error("Task already registered: {0}")]
    DuplicateTask(TaskId),

    /// Invalid state transition requested by a user action.
    #[error("Cannot {action} task {task_id} while {from}")]
    InvalidStateTransition {
        task_id: TaskId,
        from: TaskStatus,
        action: &'static str,
    },

    /// Unknown task kind on the wire or command line.
    #[error("Unknown task kind: {0}")]
    UnknownKind(String),

    /// Unknown task status on the wire or command line.
    #[error("Unknown task status: {0}")]
    UnknownStatus(String),

    /// Invalid input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
