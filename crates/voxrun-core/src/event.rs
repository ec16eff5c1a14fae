//! Progress and queue events delivered over event streams.

use serde::Deserialize;
use serde_json::{json, Value};

use crate::{CoreError, JobStats, Task, TaskId};

const DEFAULT_ERROR_MESSAGE: &str = "Task failed";

/// An event on a per-task progress channel.
///
/// Exactly one `Complete` or `Error` terminates a channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    /// Intermediate progress.
    Progress { fraction: f64, message: String },
    /// Terminal success carrying the service's result payload.
    Complete(Value),
    /// Terminal failure.
    Error { message: String },
}

impl ProgressEvent {
    /// Decode an SSE frame into an event.
    ///
    /// Returns `Ok(None)` for event names this client does not act on.
    /// `downloading` and `loading` frames from model preparation streams are
    /// read as progress.
    pub fn from_frame(event: &str, data: &str) -> Result<Option<Self>, CoreError> {
        let data: Value = if data.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(data)?
        };

        let message = data
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string);

        let event = match event {
            "progress" | "downloading" | "loading" => Self::Progress {
                fraction: data.get("fraction").and_then(Value::as_f64).unwrap_or(0.0),
                message: message.unwrap_or_default(),
            },
            "complete" => Self::Complete(data),
            "error" => Self::Error {
                message: message.unwrap_or_else(|| DEFAULT_ERROR_MESSAGE.to_string()),
            },
            _ => return Ok(None),
        };
        Ok(Some(event))
    }

    /// Encode as an SSE `(event, data)` pair.
    pub fn to_frame(&self) -> (&'static str, Value) {
        match self {
            Self::Progress { fraction, message } => (
                "progress",
                json!({ "fraction": fraction, "message": message }),
            ),
            Self::Complete(result) => ("complete", result.clone()),
            Self::Error { message } => ("error", json!({ "message": message })),
        }
    }

    /// Whether this event ends its channel.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete(_) | Self::Error { .. })
    }
}

/// An event on the process-wide queue stream.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    JobCreated(Task),
    JobUpdate(Task),
    JobCompleted(Task),
    JobFailed { job_id: TaskId, error: String },
    StatsUpdate(JobStats),
    /// Keep-alive.
    Ping,
}

#[derive(Deserialize)]
struct QueueEnvelope {
    event: String,
    #[serde(default)]
    data: Value,
}

#[derive(Deserialize)]
struct JobFailedData {
    job_id: TaskId,
    #[serde(default)]
    error: Option<String>,
}

impl QueueEvent {
    /// Decode one frame of the queue stream.
    ///
    /// The queue stream wraps every message as
    /// `{"event": ..., "data": ..., "session_id": ...}` inside the SSE data
    /// field. Returns `Ok(None)` for unknown event names.
    pub fn from_json(raw: &str) -> Result<Option<Self>, CoreError> {
        let envelope: QueueEnvelope = serde_json::from_str(raw)?;
        let event = match envelope.event.as_str() {
            "job_created" => Self::JobCreated(serde_json::from_value(envelope.data)?),
            "job_update" => Self::JobUpdate(serde_json::from_value(envelope.data)?),
            "job_completed" => Self::JobCompleted(serde_json::from_value(envelope.data)?),
            "job_failed" => {
                let data: JobFailedData = serde_json::from_value(envelope.data)?;
                Self::JobFailed {
                    job_id: data.job_id,
                    error: data
                        .error
                        .unwrap_or_else(|| DEFAULT_ERROR_MESSAGE.to_string()),
                }
            }
            "stats_update" => Self::StatsUpdate(serde_json::from_value(envelope.data)?),
            "ping" => Self::Ping,
            _ => return Ok(None),
        };
        Ok(Some(event))
    }

    /// Encode as the JSON envelope the queue stream carries.
    pub fn to_json(&self, session_id: &str) -> Result<String, CoreError> {
        let (event, data) = match self {
            Self::JobCreated(task) => ("job_created", serde_json::to_value(task)?),
            Self::JobUpdate(task) => ("job_update", serde_json::to_value(task)?),
            Self::JobCompleted(task) => ("job_completed", serde_json::to_value(task)?),
            Self::JobFailed { job_id, error } => {
                ("job_failed", json!({ "job_id": job_id, "error": error }))
            }
            Self::StatsUpdate(stats) => ("stats_update", serde_json::to_value(stats)?),
            Self::Ping => ("ping", json!({})),
        };
        Ok(json!({ "event": event, "data": data, "session_id": session_id }).to_string())
    }
}
