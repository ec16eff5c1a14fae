//! Error types for the voxrun client.

use thiserror::Error;
use voxrun_core::{CoreError, TaskId};
use voxrun_inference::InferenceError;

/// Errors that can occur when talking to the task service or driving tasks.
#[derive(Debug, Error)]
pub enum ClientError {
    /// HTTP transport error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The service answered with a non-success status.
    #[error("service returned {status}: {message}")]
    Status { status: u16, message: String },

    /// Malformed event stream.
    #[error("stream error: {0}")]
    Stream(String),

    /// A progress channel closed before its task finished.
    #[error("connection lost")]
    ConnectionLost,

    /// The awaited task failed.
    #[error("task {task_id} failed: {message}")]
    TaskFailed { task_id: TaskId, message: String },

    /// The awaited task was cancelled.
    #[error("task {0} was cancelled")]
    Cancelled(TaskId),

    /// Task state machine rejected the operation.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Local inference failed.
    #[error(transparent)]
    Inference(#[from] InferenceError),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Resource not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid client configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        ClientError::Serialization(err.to_string())
    }
}
