//! Message protocol between the inference proxy and its worker.
//!
//! The worker shares no memory with its callers. Every exchange is one of
//! the tagged messages below, so the same types can cross a process
//! boundary as JSON when the worker runs out of process.

use serde::{Deserialize, Serialize};

/// Message sent from the proxy to the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum WorkerRequest {
    /// Load (or replace) the model.
    Load { model_id: String },

    /// Generate a completion for one chunk of text.
    Generate {
        /// Proxy-assigned sequence number, echoed back by the worker.
        request_id: u64,
        chunk_index: usize,
        system_prompt: String,
        user_content: String,
    },

    /// Reset the engine and drop any in-flight generations.
    Abort,
}

/// Message sent from the worker back to the proxy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum WorkerResponse {
    /// Model load progress in `[0, 1]`.
    LoadProgress { progress: f32, text: String },

    /// Model finished loading.
    LoadComplete { model_id: String },

    /// Model failed to load.
    LoadError { model_id: String, error: String },

    /// Generation finished.
    GenerateComplete {
        request_id: u64,
        chunk_index: usize,
        text: String,
    },

    /// Generation failed.
    GenerateError {
        request_id: u64,
        chunk_index: usize,
        error: String,
    },
}

impl WorkerResponse {
    /// Short name used in log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::LoadProgress { .. } => "load-progress",
            Self::LoadComplete { .. } => "load-complete",
            Self::LoadError { .. } => "load-error",
            Self::GenerateComplete { .. } => "generate-complete",
            Self::GenerateError { .. } => "generate-error",
        }
    }
}
