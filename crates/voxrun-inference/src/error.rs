//! Error types for the local inference worker.

use thiserror::Error;

/// Errors that can occur while loading a model or generating text.
#[derive(Debug, Error)]
pub enum InferenceError {
    /// `generate` was called before the model reported ready.
    #[error("Local model is not ready. Load a model before generating.")]
    NotReady,

    /// The caller stopped waiting because the proxy was aborted.
    #[error("Generation aborted")]
    Cancelled,

    /// The worker reported a failure for one chunk.
    #[error("Generation failed for chunk {chunk_index}: {message}")]
    Generation { chunk_index: usize, message: String },

    /// The model could not be loaded.
    #[error("Model load failed: {0}")]
    LoadFailed(String),

    /// The worker task has stopped.
    #[error("Inference worker is not running")]
    WorkerGone,

    /// Engine-level failure.
    #[error("Engine error: {0}")]
    Engine(String),

    /// HTTP error talking to a local engine server.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}
